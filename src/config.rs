//! Carga y gestión de configuración de la aplicación (servidor + LLM + rutas).

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

#[derive(Clone, Debug)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub upload_dir: PathBuf,
    pub index_path: PathBuf,
    pub rules_path: PathBuf,
    pub advisor_keys_path: PathBuf,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    /// Modelo usado cuando la petición de chat no indica uno.
    pub default_chat_model: String,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8000".to_string());

        let upload_dir = env::var("UPLOAD_DIR")
            .unwrap_or_else(|_| "uploaded_pdfs".to_string())
            .into();
        let index_path = env::var("INDEX_PATH")
            .unwrap_or_else(|_| "index/chunks.json".to_string())
            .into();
        let rules_path = env::var("RULES_PATH")
            .unwrap_or_else(|_| "priority_rules.json".to_string())
            .into();
        let advisor_keys_path = env::var("ADVISOR_KEYS_PATH")
            .unwrap_or_else(|_| "advisor_keys.json".to_string())
            .into();

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let default_chat_model =
            env::var("DEFAULT_CHAT_MODEL").unwrap_or_else(|_| "phi-2".to_string());

        Ok(Self {
            server_addr,
            upload_dir,
            index_path,
            rules_path,
            advisor_keys_path,
            llm_provider,
            llm_embedding_model,
            default_chat_model,
        })
    }
}
