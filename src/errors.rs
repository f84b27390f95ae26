//! Taxonomía de errores del pipeline.
//!
//! Ningún error de este núcleo debe propagarse más allá del coordinador:
//! cada variante acaba o bien en un log-y-continuar o bien en un mensaje
//! de texto hacia el usuario.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fuente de reglas ilegible o malformada. Degrada a un conjunto vacío.
    #[error("no se pudieron cargar las reglas desde {path}: {reason}")]
    ConfigLoad { path: String, reason: String },

    /// Fallo de extracción de texto de un documento concreto. Se salta el
    /// documento y la ingesta continúa.
    #[error("no se pudo extraer texto de {path}: {reason}")]
    Extraction { path: String, reason: String },

    /// Índice persistido corrupto o ausente. Dispara una reconstrucción.
    #[error("no se pudo cargar el índice persistido: {0}")]
    IndexLoad(String),

    /// El proveedor de generación o embeddings no pudo inicializarse.
    #[error("no se pudo cargar el modelo '{model_id}': {reason}")]
    ModelLoad { model_id: String, reason: String },

    /// Fallo durante una única invocación de generación ya con el modelo
    /// cargado. Sólo afecta a esa llamada.
    #[error("fallo durante la generación de la respuesta: {0}")]
    Generation(String),
}
