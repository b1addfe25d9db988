//! Answers from the hosted vector store filled by `chatadv upload`.
//!
//! The provider runs file search over the store itself. Multi-turn continuity
//! is carried by the id of the previous response rather than by resending history.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdvisorError, AdvisorResult};

const SERVICE: &str = "hosted file search";

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    input: [InputMessage<'a>; 1],
    tools: [FileSearchTool<'a>; 1],
    include: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct InputMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct FileSearchTool<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    vector_store_ids: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct ResponsesReply {
    id: String,
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<OutputContent>,
    #[serde(default)]
    results: Option<Vec<SearchResult>>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    score: Option<f32>,
}

impl ResponsesReply {
    /// Top-level `output_text` when present, otherwise every `output_text`
    /// part of every message item joined by newlines.
    fn text(&self) -> Option<String> {
        if let Some(text) = self.output_text.as_deref().filter(|t| !t.is_empty()) {
            return Some(text.to_string());
        }

        let parts: Vec<&str> = self
            .output
            .iter()
            .filter(|item| item.kind == "message")
            .flat_map(|item| item.content.iter())
            .filter(|c| c.kind == "output_text")
            .filter_map(|c| c.text.as_deref())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    fn log_search_results(&self) {
        for item in self.output.iter().filter(|item| item.kind == "file_search_call") {
            for result in item.results.iter().flatten() {
                tracing::debug!(
                    "File search hit {} (score {:.4})",
                    result.filename.as_deref().unwrap_or("<unnamed>"),
                    result.score.unwrap_or_default()
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedReply {
    /// Pass back as `previous_response_id` to continue the conversation.
    pub response_id: String,
    pub text: String,
}

pub struct HostedAdvisor {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    vector_store_id: String,
    instructions: String,
}

impl HostedAdvisor {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        vector_store_id: &str,
        instructions: String,
    ) -> AdvisorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AdvisorError::dependency(SERVICE, e))?;
        Ok(Self {
            client,
            endpoint: format!("{}/responses", base_url.trim_end_matches('/')),
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            vector_store_id: vector_store_id.to_string(),
            instructions,
        })
    }

    pub fn load_instructions(path: &Path) -> AdvisorResult<String> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AdvisorError::Template(format!("cannot read {}: {}", path.display(), e))
        })?;
        if text.trim().is_empty() {
            return Err(AdvisorError::Template(format!("{} is empty", path.display())));
        }
        Ok(text)
    }

    pub fn vector_store_id(&self) -> &str {
        &self.vector_store_id
    }

    pub async fn respond(
        &self,
        message: &str,
        previous_response_id: Option<&str>,
    ) -> AdvisorResult<HostedReply> {
        let request = ResponsesRequest {
            model: &self.model,
            instructions: &self.instructions,
            input: [InputMessage {
                role: "user",
                content: message,
            }],
            tools: [FileSearchTool {
                kind: "file_search",
                vector_store_ids: [self.vector_store_id.as_str()],
            }],
            include: ["file_search_call.results"],
            previous_response_id: previous_response_id.filter(|id| !id.is_empty()),
        };

        tracing::debug!(
            "Asking {} over store {} (continuing: {})",
            self.model,
            self.vector_store_id,
            request.previous_response_id.is_some()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
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

        let reply: ResponsesReply = response
            .json()
            .await
            .map_err(|e| AdvisorError::dependency(SERVICE, e))?;
        reply.log_search_results();

        let text = reply
            .text()
            .ok_or_else(|| AdvisorError::dependency(SERVICE, "no output text in response"))?;

        Ok(HostedReply {
            response_id: reply.id,
            text,
        })
    }
}
