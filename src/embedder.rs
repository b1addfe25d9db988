use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::error::{AdvisorError, AdvisorResult};
use crate::models::{Chunk, EmbeddedChunk};

const SERVICE: &str = "embeddings";

/// Inputs per request; the provider accepts more, but smaller bodies fail less.
pub const BATCH_SIZE: usize = 100;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Name of the model, recorded alongside a persisted index.
    fn model(&self) -> &str;

    async fn embed_batch(&self, inputs: &[String]) -> AdvisorResult<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> AdvisorResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AdvisorError::dependency(SERVICE, "empty embedding response"))
    }
}

/// Embeds every chunk, batching requests.
pub async fn embed_chunks(embedder: &dyn Embedder, chunks: &[Chunk]) -> AdvisorResult<Vec<EmbeddedChunk>> {
    let mut embedded = Vec::with_capacity(chunks.len());

    for (batch_no, batch) in chunks.chunks(BATCH_SIZE).enumerate() {
        tracing::debug!("Embedding batch {} ({} chunks)", batch_no + 1, batch.len());
        let inputs: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let vectors = embedder.embed_batch(&inputs).await?;

        if vectors.len() != batch.len() {
            return Err(AdvisorError::dependency(
                SERVICE,
                format!("returned {} embeddings for {} inputs", vectors.len(), batch.len()),
            ));
        }

        embedded.extend(
            batch
                .iter()
                .cloned()
                .zip(vectors)
                .map(|(chunk, embedding)| EmbeddedChunk { chunk, embedding }),
        );
    }

    Ok(embedded)
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> AdvisorResult<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|e| AdvisorError::dependency(SERVICE, format!("invalid API key: {}", e)))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| AdvisorError::dependency(SERVICE, e))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, inputs: &[String]) -> AdvisorResult<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| AdvisorError::dependency(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(AdvisorError::dependency(SERVICE, format!("HTTP {}: {}", status, body)));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AdvisorError::dependency(SERVICE, e))?;
        parsed.data.sort_by_key(|entry| entry.index);

        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn chunk(i: usize, text: &str) -> Chunk {
        Chunk {
            webpage: i,
            source: format!("https://example.edu/{}", i),
            content: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_embed_chunks_pairs_vectors_in_order() {
        let embedder = KeywordEmbedder::new(&["prerequisite", "finance"]);
        let chunks: Vec<Chunk> = (0..(BATCH_SIZE + 5))
            .map(|i| chunk(i, if i % 2 == 0 { "finance" } else { "prerequisite prerequisite" }))
            .collect();

        let embedded = embed_chunks(&embedder, &chunks).await.unwrap();

        assert_eq!(embedded.len(), chunks.len());
        assert_eq!(embedded[0].embedding, vec![0.0, 1.0]);
        assert_eq!(embedded[1].embedding, vec![2.0, 0.0]);
        assert_eq!(embedded[BATCH_SIZE + 4].chunk, chunks[BATCH_SIZE + 4]);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_a_dependency_error() {
        let err = embed_chunks(&UnreachableEmbedder, &[chunk(0, "x")]).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Dependency { service: "embeddings", .. }));
    }

    #[tokio::test]
    #[ignore] // Run with: cargo test -- --ignored (requires OPENAI_API_KEY)
    async fn test_openai_embedding_dimension() {
        let key = std::env::var("OPENAI_API_KEY").unwrap();
        let embedder =
            OpenAiEmbedder::new(&key, "https://api.openai.com/v1", "text-embedding-3-small").unwrap();
        let vector = embedder.embed("What are the prerequisites for ISA 401?").await.unwrap();
        assert_eq!(vector.len(), 1536);
    }
}
