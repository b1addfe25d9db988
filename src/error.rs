use thiserror::Error;

use crate::answer::MalformedOutput;

/// Shown to the student whenever the model's reply cannot be parsed.
pub const MALFORMED_FALLBACK: &str = "ChatAdv could not produce a well-formed answer to this question. \
Please try rephrasing it, or contact your academic advisor directly.";

const DEPENDENCY_FALLBACK: &str = "ChatAdv is temporarily unable to reach its language service. \
Please try again in a moment.";

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("question is empty")]
    EmptyQuestion,

    #[error("export name is empty after sanitising")]
    EmptyExportName,

    /// A call to the embedding, language-model or remote-store service failed.
    #[error("{service} request failed: {message}")]
    Dependency {
        service: &'static str,
        message: String,
    },

    #[error("malformed model output: {0}")]
    MalformedOutput(#[from] MalformedOutput),

    #[error("vector index not found at {0}; run `chatadv build-index` first")]
    IndexMissing(String),

    #[error("query vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid prompt template: {0}")]
    Template(String),

    #[error("PDF rendering failed: {0}")]
    Pdf(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AdvisorError {
    pub fn dependency(service: &'static str, err: impl std::fmt::Display) -> Self {
        AdvisorError::Dependency {
            service,
            message: err.to_string(),
        }
    }

    /// Text suitable for showing to a student instead of the raw error.
    pub fn user_message(&self) -> String {
        match self {
            AdvisorError::EmptyQuestion => "Please type a question first.".to_string(),
            AdvisorError::EmptyExportName => {
                "Please enter your name before exporting the chat.".to_string()
            }
            AdvisorError::MalformedOutput(_) => MALFORMED_FALLBACK.to_string(),
            AdvisorError::Dependency { .. } => DEPENDENCY_FALLBACK.to_string(),
            other => format!("Something went wrong: {}", other),
        }
    }
}

pub type AdvisorResult<T> = Result<T, AdvisorError>;
