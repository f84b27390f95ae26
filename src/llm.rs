//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el
//! futuro. Además gestiona la sesión de modelo de generación activa.

use anyhow::{anyhow, Result};
use rig::completion::Prompt;
use tracing::info;
use uuid::Uuid;

use crate::config::{AppConfig, LlmProvider};
use crate::errors::PipelineError;

/// Alias amigables de modelo y su identificador canónico.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("phi-2", "microsoft/phi-2"),
    ("socialite-llama", "hlab/SocialiteLlama"),
];

/// Resuelve un alias amigable a su identificador canónico. Un identificador
/// sin alias registrado pasa tal cual.
pub fn canonical_model_id(model_id: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model_id)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(model_id)
}

const SYSTEM_PROMPT: &str =
    "Eres un asistente experto en programas sociales de Hidalgo, México. \
     Respondes en español, de forma clara y concisa, usando únicamente la \
     información suministrada en el contexto.";

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
        })
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    /// Calcula embeddings para una lista de textos.
    ///
    /// Nota: sólo implementado para OpenAI. Para otros proveedores se
    /// podrían añadir ramas adicionales al `match`.
    pub async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(texts).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para embeddings",
                other
            )),
        }
    }

    async fn embed_with_openai(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        let client = openai::Client::from_env();
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let expected = texts.len();
        let embeddings = embedding_model.embed_texts(texts).await?;
        if embeddings.len() != expected {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                expected
            ));
        }

        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }

    // ---------------------------------------------------------------------
    // SESIONES DE GENERACIÓN
    // ---------------------------------------------------------------------

    /// Carga una sesión nueva para `model_id`. La sesión anterior debe
    /// haberse liberado antes de llamar (el coordinador lo garantiza) para
    /// acotar el pico de memoria durante el cambio de modelo.
    pub fn load_session(&self, model_id: &str) -> Result<ModelSession> {
        match self.provider {
            LlmProvider::OpenAI => {
                let canonical = canonical_model_id(model_id).to_string();
                info!("Cargando sesión de generación para '{model_id}' ({canonical}).");
                Ok(ModelSession {
                    session_id: Uuid::new_v4(),
                    model_id: model_id.to_string(),
                    canonical_model: canonical,
                    provider: self.provider.clone(),
                })
            }
            ref other => Err(PipelineError::ModelLoad {
                model_id: model_id.to_string(),
                reason: format!("proveedor {other:?} aún no implementado para generación"),
            }
            .into()),
        }
    }
}

/// Sesión de generación activa. Como máximo hay una viva por proceso; al
/// cambiar de modelo se sustituye entera, nunca se muta.
#[derive(Debug)]
pub struct ModelSession {
    pub session_id: Uuid,
    pub model_id: String,
    canonical_model: String,
    provider: LlmProvider,
}

impl ModelSession {
    /// Genera una respuesta sustituyendo instrucción, contexto y pregunta
    /// en la plantilla fija de prompt, y devuelve la salida tal cual.
    pub async fn generate(
        &self,
        question: &str,
        instruction: &str,
        context: &str,
    ) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => self.generate_with_openai(question, instruction, context).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para generación",
                other
            )),
        }
    }

    async fn generate_with_openai(
        &self,
        question: &str,
        instruction: &str,
        context: &str,
    ) -> Result<String> {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        let client = openai::Client::from_env();

        let preamble = format!("{SYSTEM_PROMPT}\n\nIMPORTANTE:\n{instruction}");
        let full_context = format!("Contexto relevante de los documentos:\n{context}");

        let agent = client
            .agent(&self.canonical_model)
            .preamble(&preamble)
            .context(&full_context)
            .build();

        let answer = agent.prompt(question).await?;
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(provider: LlmProvider) -> LlmManager {
        LlmManager {
            provider,
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }

    #[test]
    fn alias_se_resuelve_a_identificador_canonico() {
        assert_eq!(canonical_model_id("phi-2"), "microsoft/phi-2");
        assert_eq!(canonical_model_id("socialite-llama"), "hlab/SocialiteLlama");
        // Sin alias registrado: pasa tal cual.
        assert_eq!(canonical_model_id("gpt-4o-mini"), "gpt-4o-mini");
    }

    #[test]
    fn cada_carga_produce_una_sesion_distinta() {
        let llm = manager(LlmProvider::OpenAI);
        let a = llm.load_session("phi-2").unwrap();
        let b = llm.load_session("phi-2").unwrap();
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn proveedor_no_implementado_falla_la_carga() {
        let llm = manager(LlmProvider::Gemini);
        assert!(llm.load_session("phi-2").is_err());
    }
}
