use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_TOP_K: usize = 4;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-wide settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub vector_store_id: Option<String>,
    pub data_dir: PathBuf,
    pub index_dir: PathBuf,
    pub prompt_path: PathBuf,
    pub instructions_path: PathBuf,
    pub urls_path: PathBuf,
    pub top_k: usize,
    pub bind_addr: SocketAddr,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable lookup, so tests need not touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let top_k = match get("CHATADV_TOP_K") {
            Some(raw) => raw.trim().parse::<usize>().map_err(|e| ConfigError::Invalid {
                name: "CHATADV_TOP_K",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_TOP_K,
        };

        let bind_raw = get("CHATADV_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                name: "CHATADV_BIND_ADDR",
                value: bind_raw.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            api_key: get("OPENAI_API_KEY"),
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            chat_model: get("CHATADV_CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            embedding_model: get("CHATADV_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            vector_store_id: get("VECTOR_STORE_ID"),
            data_dir: get("CHATADV_DATA_DIR").unwrap_or_else(|| "data".into()).into(),
            index_dir: get("CHATADV_INDEX_DIR")
                .unwrap_or_else(|| "vstore/webpage_vectorstore".into())
                .into(),
            prompt_path: get("CHATADV_PROMPT_PATH")
                .unwrap_or_else(|| "prompts/advising_prompt.txt".into())
                .into(),
            instructions_path: get("CHATADV_INSTRUCTIONS_PATH")
                .unwrap_or_else(|| "prompts/hosted_instructions.txt".into())
                .into(),
            urls_path: get("CHATADV_URLS_PATH")
                .unwrap_or_else(|| "config/urls.txt".into())
                .into(),
            top_k,
            bind_addr,
        })
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.as_deref().ok_or(ConfigError::Missing("OPENAI_API_KEY"))
    }

    pub fn require_vector_store_id(&self) -> Result<&str, ConfigError> {
        self.vector_store_id
            .as_deref()
            .ok_or(ConfigError::Missing("VECTOR_STORE_ID"))
    }
}
