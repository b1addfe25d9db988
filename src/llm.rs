use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AdvisorError, AdvisorResult};

const SERVICE: &str = "chat completion";

/// A language model that turns one prompt into one raw completion.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> AdvisorResult<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions at zero temperature.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> AdvisorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AdvisorError::dependency(SERVICE, e))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, prompt: &str) -> AdvisorResult<String> {
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        tracing::debug!("Sending {} prompt characters to {}", prompt.len(), self.model);

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

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AdvisorError::dependency(SERVICE, e))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AdvisorError::dependency(SERVICE, "no completion content"))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    #[test]
    fn test_request_shape() {
        let request = ChatRequest {
            model: "gpt-4o",
            temperature: 0.0,
            messages: [ChatMessage {
                role: "user",
                content: "hello",
            }],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "model": "gpt-4o",
                "temperature": 0.0,
                "messages": [{"role": "user", "content": "hello"}]
            })
        );
    }

    #[tokio::test]
    async fn test_complete_against_local_endpoint() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["temperature"], json!(0.0));
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": "<answer>hi</answer>"}}]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let model = OpenAiChatModel::new("sk-test", &format!("http://{}/v1", addr), "gpt-4o").unwrap();
        assert_eq!(model.complete("hello").await.unwrap(), "<answer>hi</answer>");
    }

    #[tokio::test]
    async fn test_missing_content_is_dependency_error() {
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(|| async { Json(json!({"choices": []})) }),
            )
            .route(
                "/null/chat/completions",
                post(|| async {
                    Json(json!({"choices": [{"message": {"role": "assistant", "content": null}}]}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        for prefix in ["v1", "null"] {
            let model =
                OpenAiChatModel::new("sk-test", &format!("http://{}/{}", addr, prefix), "gpt-4o").unwrap();
            let err = model.complete("hello").await.unwrap_err();
            assert!(
                matches!(err, AdvisorError::Dependency { .. }),
                "{}: {:?}",
                prefix,
                err
            );
            assert!(err.to_string().contains("no completion content"));
        }
    }

    #[tokio::test]
    async fn test_http_error_is_dependency_error() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let model = OpenAiChatModel::new("sk-test", &format!("http://{}/v1", addr), "gpt-4o").unwrap();
        let err = model.complete("hello").await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }
}
