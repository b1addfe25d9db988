use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::chat::SessionStore;
use crate::error::AdvisorError;
use crate::models::ChatTurn;
use crate::pdf_generator;
use crate::pipeline::AdvisorBackend;

// Application State
pub struct AppState {
    pub advisor: AdvisorBackend,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(advisor: impl Into<AdvisorBackend>) -> Self {
        Self::with_sessions(advisor, SessionStore::new())
    }

    pub fn with_sessions(advisor: impl Into<AdvisorBackend>, sessions: SessionStore) -> Self {
        Self {
            advisor: advisor.into(),
            sessions,
        }
    }
}

// Request / response bodies
#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize)]
struct ChatReply {
    session_id: Uuid,
    text: String,
}

#[derive(Serialize, Deserialize)]
struct SessionHistory {
    session_id: Uuid,
    history: Vec<ChatTurn>,
}

#[derive(Deserialize)]
struct ExportRequest {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn advisor_error_response(err: &AdvisorError) -> Response {
    let status = match err {
        AdvisorError::EmptyQuestion | AdvisorError::EmptyExportName => StatusCode::BAD_REQUEST,
        AdvisorError::MalformedOutput(_) => StatusCode::BAD_GATEWAY,
        AdvisorError::Dependency { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.user_message())
}

fn parse_session_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid session ID"))
}

// Handlers
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.len(),
    }))
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.message.trim().is_empty() {
        return advisor_error_response(&AdvisorError::EmptyQuestion);
    }

    let mut previous_response_id = None;
    if let Some(id) = request.session_id {
        if !state.sessions.exists(id) {
            return error_response(StatusCode::NOT_FOUND, "Session not found");
        }
        previous_response_id = state.sessions.previous_response_id(id);
    }

    let reply = match state
        .advisor
        .reply(&request.message, previous_response_id.as_deref())
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!("Question failed: {}", e);
            return advisor_error_response(&e);
        }
    };

    // New sessions start on their first successful answer.
    let session_id = request
        .session_id
        .unwrap_or_else(|| state.sessions.create());

    if !state.sessions.record(session_id, &request.message, &reply) {
        return error_response(StatusCode::NOT_FOUND, "Session ended while answering");
    }

    Json(ChatReply {
        session_id,
        text: reply.text,
    })
    .into_response()
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    let session_id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.sessions.history(session_id) {
        Some(history) => Json(SessionHistory {
            session_id,
            history,
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Session not found"),
    }
}

async fn end_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    let session_id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    if state.sessions.end(session_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "Session not found")
    }
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<ExportRequest>,
) -> Response {
    let session_id = match parse_session_id(&session_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let file_name = match pdf_generator::export_file_name(&request.name) {
        Ok(name) => name,
        Err(e) => return advisor_error_response(&e),
    };

    let Some(history) = state.sessions.history(session_id) else {
        return error_response(StatusCode::NOT_FOUND, "Session not found");
    };

    let today = chrono::Local::now().date_naive();
    match pdf_generator::render_chat_pdf(&history, &request.name, today) {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", file_name),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("PDF export failed for session {}: {}", session_id, e);
            advisor_error_response(&e)
        }
    }
}

// Router setup
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .route(
            "/api/sessions/:id",
            get(history_handler).delete(end_session_handler),
        )
        .route("/api/sessions/:id/export", post(export_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MALFORMED_FALLBACK;
    use crate::hosted::testing::{hosted_advisor, spawn_responses_endpoint};
    use crate::models::Role;
    use crate::pipeline::testing::{advisor_with_reply, WELL_FORMED_REPLY};
    use serde_json::json;
    use std::time::Duration;

    async fn spawn_app(reply: &str) -> String {
        let (advisor, _) = advisor_with_reply(reply).await;
        spawn_state(AppState::new(advisor)).await
    }

    async fn spawn_state(state: AppState) -> String {
        let app = create_router(Arc::new(state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_chat_creates_session_and_records_history() {
        let base = spawn_app(WELL_FORMED_REPLY).await;
        let client = reqwest::Client::new();

        let reply: ChatReply = client
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "What are the prerequisites for ISA 401?"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(reply.text.contains("ISA 245 or CSE 385"));

        // A second question on the same session appends to it.
        let second = client
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "And for ISA 245?", "session_id": reply.session_id}))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), reqwest::StatusCode::OK);

        let history: SessionHistory = client
            .get(format!("{}/api/sessions/{}", base, reply.session_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history.history.len(), 4);
        assert_eq!(history.history[0].role, Role::User);
        assert_eq!(history.history[3].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_empty_message_is_bad_request() {
        let base = spawn_app(WELL_FORMED_REPLY).await;
        let response = reqwest::Client::new()
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_output_is_bad_gateway_with_fallback() {
        let base = spawn_app("no envelope here").await;
        let response = reqwest::Client::new()
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "prereqs for ISA 401?"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.error, MALFORMED_FALLBACK);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let base = spawn_app(WELL_FORMED_REPLY).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "hi", "session_id": Uuid::new_v4()}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = client
            .get(format!("{}/api/sessions/{}", base, Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = client
            .get(format!("{}/api/sessions/not-a-uuid", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_export_and_end_session() {
        let base = spawn_app(WELL_FORMED_REPLY).await;
        let client = reqwest::Client::new();

        let reply: ChatReply = client
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "What are the prerequisites for ISA 401?"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let empty_name = client
            .post(format!("{}/api/sessions/{}/export", base, reply.session_id))
            .json(&json!({"name": "  "}))
            .send()
            .await
            .unwrap();
        assert_eq!(empty_name.status(), reqwest::StatusCode::BAD_REQUEST);

        let export = client
            .post(format!("{}/api/sessions/{}/export", base, reply.session_id))
            .json(&json!({"name": "Jane Doe"}))
            .send()
            .await
            .unwrap();
        assert_eq!(export.status(), reqwest::StatusCode::OK);
        assert_eq!(export.headers()[reqwest::header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            export.headers()[reqwest::header::CONTENT_DISPOSITION],
            "attachment; filename=\"Jane_Doe_chatadv_advising_session.pdf\""
        );
        assert!(export.bytes().await.unwrap().starts_with(b"%PDF"));

        let ended = client
            .delete(format!("{}/api/sessions/{}", base, reply.session_id))
            .send()
            .await
            .unwrap();
        assert_eq!(ended.status(), reqwest::StatusCode::NO_CONTENT);

        let gone = client
            .get(format!("{}/api/sessions/{}", base, reply.session_id))
            .send()
            .await
            .unwrap();
        assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hosted_backend_threads_response_id_per_session() {
        let (provider, seen) = spawn_responses_endpoint(WELL_FORMED_REPLY).await;
        let base = spawn_state(AppState::new(hosted_advisor(&provider))).await;
        let client = reqwest::Client::new();

        let first: ChatReply = client
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "What is ISA 401?"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(first.text.contains("ISA 245 or CSE 385"));

        let second = client
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "And its prerequisites?", "session_id": first.session_id}))
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), reqwest::StatusCode::OK);

        // A different student starts a fresh conversation.
        let other = client
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "What is FIN 301?"}))
            .send()
            .await
            .unwrap();
        assert_eq!(other.status(), reqwest::StatusCode::OK);

        let seen = seen.lock();
        assert!(seen[0].get("previous_response_id").is_none());
        assert_eq!(seen[1]["previous_response_id"], "resp_1");
        assert!(seen[2].get("previous_response_id").is_none());
    }

    #[tokio::test]
    async fn test_idle_session_is_gone() {
        let (advisor, _) = advisor_with_reply(WELL_FORMED_REPLY).await;
        let sessions = SessionStore::with_idle_ttl(Duration::from_millis(50));
        let base = spawn_state(AppState::with_sessions(advisor, sessions)).await;
        let client = reqwest::Client::new();

        let reply: ChatReply = client
            .post(format!("{}/api/chat", base))
            .json(&json!({"message": "What are the prerequisites for ISA 401?"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let gone = client
            .get(format!("{}/api/sessions/{}", base, reply.session_id))
            .send()
            .await
            .unwrap();
        assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let base = spawn_app(WELL_FORMED_REPLY).await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }
}
