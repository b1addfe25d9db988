//! Alternate ingestion path: push each scraped page to a hosted vector store.
//!
//! The remote store is emptied first, every page is uploaded as its own
//! markdown file (retrying transient failures with capped exponential
//! backoff and jitter), and the uploaded files are attached in fixed-size
//! batches that are polled until the provider finishes indexing them.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::Rng;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::document_store::render_markdown_document;
use crate::models::SourceDocument;
use crate::rate_limit::{Throttle, ThrottlePolicy};

pub const ATTACH_BATCH_SIZE: usize = 100;
const LIST_PAGE_SIZE: usize = 100;
const BATCH_IN_PROGRESS: &str = "in_progress";

#[derive(Debug, Error)]
pub enum RemoteStoreError {
    #[error("server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl RemoteStoreError {
    /// Server errors, timeouts, connection failures and rate limits are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteStoreError::Server { .. }
                | RemoteStoreError::RateLimited(_)
                | RemoteStoreError::Timeout(_)
                | RemoteStoreError::Connection(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RemoteStoreError::Server { .. } => "ServerError",
            RemoteStoreError::RateLimited(_) => "RateLimited",
            RemoteStoreError::Timeout(_) => "Timeout",
            RemoteStoreError::Connection(_) => "ConnectionError",
            RemoteStoreError::Api { .. } => "ApiError",
            RemoteStoreError::Decode(_) => "DecodeError",
        }
    }

    pub fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            RemoteStoreError::RateLimited(body)
        } else if status.is_server_error() {
            RemoteStoreError::Server {
                status: status.as_u16(),
                body,
            }
        } else {
            RemoteStoreError::Api {
                status: status.as_u16(),
                body,
            }
        }
    }
}

impl From<reqwest::Error> for RemoteStoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteStoreError::Timeout(err.to_string())
        } else if err.is_decode() {
            RemoteStoreError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            RemoteStoreError::from_status(status, err.to_string())
        } else {
            RemoteStoreError::Connection(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given failed attempt (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn jittered(&self, delay: Duration, rng: &mut impl Rng) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rng.gen_range(0.0..=self.jitter) * delay.as_secs_f64();
        delay + Duration::from_secs_f64(extra)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the attempt
/// budget is spent. The error returned after exhaustion is the last one observed.
pub async fn retry_with_backoff<T, F, Fut>(policy: &BackoffPolicy, what: &str, mut op: F) -> Result<T, RemoteStoreError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RemoteStoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.jittered(policy.delay_for(attempt), &mut rand::thread_rng());
                tracing::warn!(
                    "{} failed ({}) attempt {}/{}. Retrying in {:.1}s",
                    what,
                    err.kind(),
                    attempt,
                    max_attempts,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FileCounts {
    #[serde(default)]
    pub in_progress: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub cancelled: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileBatch {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub file_counts: FileCounts,
}

#[derive(Debug, Clone, Default)]
pub struct FilePage {
    pub file_ids: Vec<String>,
    pub last_id: Option<String>,
    pub has_more: bool,
}

/// The hosted vector store's file API.
#[async_trait]
pub trait RemoteVectorStore: Send + Sync {
    async fn upload_file(&self, file_name: &str, contents: Vec<u8>) -> Result<String, RemoteStoreError>;

    async fn list_files(&self, store_id: &str, after: Option<&str>) -> Result<FilePage, RemoteStoreError>;

    /// Removes a file from the store; the file object itself survives.
    async fn detach_file(&self, store_id: &str, file_id: &str) -> Result<(), RemoteStoreError>;

    async fn delete_file(&self, file_id: &str) -> Result<(), RemoteStoreError>;

    async fn create_file_batch(&self, store_id: &str, file_ids: &[String]) -> Result<FileBatch, RemoteStoreError>;

    async fn get_file_batch(&self, store_id: &str, batch_id: &str) -> Result<FileBatch, RemoteStoreError>;
}

/// Removes every file from the store, page by page. Returns how many were removed.
pub async fn clear_vector_store(
    store: &dyn RemoteVectorStore,
    store_id: &str,
    delete_underlying_files: bool,
) -> Result<usize, RemoteStoreError> {
    let mut removed = 0usize;
    let mut cursor: Option<String> = None;

    loop {
        let page = store.list_files(store_id, cursor.as_deref()).await?;

        for file_id in &page.file_ids {
            store.detach_file(store_id, file_id).await?;
            if delete_underlying_files {
                store.delete_file(file_id).await?;
            }
            removed += 1;
        }

        match page.last_id {
            Some(last) if page.has_more => cursor = Some(last),
            _ => break,
        }
    }

    tracing::info!("Removed {} files from vector store {}", removed, store_id);
    Ok(removed)
}

pub fn upload_file_name(index: usize) -> String {
    format!("doc_{:06}.md", index)
}

/// Uploads one markdown file per document. Returns the new file ids in document order.
pub async fn upload_documents(
    store: &dyn RemoteVectorStore,
    documents: &[SourceDocument],
    backoff: &BackoffPolicy,
    policy: ThrottlePolicy,
) -> Result<Vec<String>, RemoteStoreError> {
    let throttle = &Throttle::new(policy);

    let file_ids: Vec<String> = stream::iter(documents.iter().enumerate())
        .map(|(index, doc)| async move {
            let name = upload_file_name(index);
            let body = render_markdown_document(index, doc).into_bytes();

            throttle.ready().await;
            let file_id = retry_with_backoff(backoff, &format!("Upload of {}", name), |_| {
                store.upload_file(&name, body.clone())
            })
            .await?;
            tracing::debug!("Uploaded {} as {}", name, file_id);
            throttle.finished().await;

            Ok::<_, RemoteStoreError>(file_id)
        })
        .buffered(policy.concurrency())
        .try_collect()
        .await?;

    tracing::info!("Uploaded {} files", file_ids.len());
    Ok(file_ids)
}

/// Attaches files in batches of `batch_size`, waiting for each batch to finish.
pub async fn attach_files_in_batches(
    store: &dyn RemoteVectorStore,
    store_id: &str,
    file_ids: &[String],
    batch_size: usize,
    poll_interval: Duration,
) -> Result<Vec<FileBatch>, RemoteStoreError> {
    let mut batches = Vec::new();

    for (n, group) in file_ids.chunks(batch_size.max(1)).enumerate() {
        let start = n * batch_size.max(1);
        let mut batch = store.create_file_batch(store_id, group).await?;

        while batch.status == BATCH_IN_PROGRESS {
            tokio::time::sleep(poll_interval).await;
            batch = store.get_file_batch(store_id, &batch.id).await?;
        }

        tracing::info!(
            "Attached files {}-{} | status={} | counts={:?}",
            start,
            start + group.len() - 1,
            batch.status,
            batch.file_counts
        );
        batches.push(batch);
    }

    Ok(batches)
}

/// Client for the OpenAI-compatible Files and Vector Stores endpoints.
pub struct OpenAiVectorStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiVectorStore {
    pub fn new(api_key: &str, base_url: &str) -> Result<Self, RemoteStoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, RemoteStoreError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RemoteStoreError::from_status(status, body));
        }
        Ok(response.json::<T>().await?)
    }
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Deserialize)]
struct ListedFile {
    id: String,
}

#[derive(Deserialize)]
struct FileList {
    data: Vec<ListedFile>,
    #[serde(default)]
    last_id: Option<String>,
    #[serde(default)]
    has_more: bool,
}

#[async_trait]
impl RemoteVectorStore for OpenAiVectorStore {
    async fn upload_file(&self, file_name: &str, contents: Vec<u8>) -> Result<String, RemoteStoreError> {
        let part = Part::bytes(contents)
            .file_name(file_name.to_string())
            .mime_str("text/markdown")?;
        let form = Form::new().text("purpose", "assistants").part("file", part);
        let created: CreatedFile =
            Self::send(self.request(reqwest::Method::POST, "/files").multipart(form)).await?;
        Ok(created.id)
    }

    async fn list_files(&self, store_id: &str, after: Option<&str>) -> Result<FilePage, RemoteStoreError> {
        let mut query = vec![("limit", LIST_PAGE_SIZE.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let list: FileList = Self::send(
            self.request(reqwest::Method::GET, &format!("/vector_stores/{}/files", store_id))
                .query(&query),
        )
        .await?;
        Ok(FilePage {
            file_ids: list.data.into_iter().map(|f| f.id).collect(),
            last_id: list.last_id,
            has_more: list.has_more,
        })
    }

    async fn detach_file(&self, store_id: &str, file_id: &str) -> Result<(), RemoteStoreError> {
        let _: serde_json::Value = Self::send(self.request(
            reqwest::Method::DELETE,
            &format!("/vector_stores/{}/files/{}", store_id, file_id),
        ))
        .await?;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), RemoteStoreError> {
        let _: serde_json::Value =
            Self::send(self.request(reqwest::Method::DELETE, &format!("/files/{}", file_id))).await?;
        Ok(())
    }

    async fn create_file_batch(&self, store_id: &str, file_ids: &[String]) -> Result<FileBatch, RemoteStoreError> {
        Self::send(
            self.request(
                reqwest::Method::POST,
                &format!("/vector_stores/{}/file_batches", store_id),
            )
            .json(&serde_json::json!({ "file_ids": file_ids })),
        )
        .await
    }

    async fn get_file_batch(&self, store_id: &str, batch_id: &str) -> Result<FileBatch, RemoteStoreError> {
        Self::send(self.request(
            reqwest::Method::GET,
            &format!("/vector_stores/{}/file_batches/{}", store_id, batch_id),
        ))
        .await
    }
}
