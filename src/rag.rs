//! Coordinador de recuperación: orquesta ingesta → indexación → consulta
//! filtrada por rol → ensamblado del prompt, y gestiona el cambio en
//! caliente del modelo de generación.
//!
//! Flujo de una consulta:
//!   1. Asegurar la sesión del modelo pedido (liberando antes la anterior).
//!   2. Resumen demográfico + programas prioritarios del motor de reglas.
//!   3. Recuperar los k=10 chunks más cercanos, filtrados por rol.
//!   4. Concatenar el contexto y pedir la generación.
//! Ningún fallo sale de aquí como error: toda ruta degradada termina en un
//! mensaje de texto para el usuario.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::errors::PipelineError;
use crate::ingest::DocumentIngestor;
use crate::llm::{LlmManager, ModelSession};
use crate::models::{demographic_summary, UserContext};
use crate::rules::RulesEngine;
use crate::vector_store::VectorIndex;

/// Número de vecinos recuperados por consulta.
pub const RETRIEVAL_K: usize = 10;

pub const MSG_NO_DOCUMENTS: &str =
    "El sistema no está listo. Por favor sube documentos primero.";
pub const MSG_INDEXING: &str =
    "Los documentos se están indexando. Inténtalo de nuevo en unos momentos.";

fn degraded_message(reason: &str) -> String {
    format!(
        "El servicio está degradado: {reason}. Lo más probable es que el modelo \
         haya agotado la memoria disponible; prueba con un modelo más ligero \
         como 'phi-2'."
    )
}

/// Estados del pipeline. `Failed` y `Ready` son re-entrables: una nueva
/// subida de documentos vuelve a `Indexing` desde cualquiera de los dos.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Uninitialized,
    Indexing,
    Ready,
    Failed(String),
}

impl PipelineState {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Indexing => "indexing",
            PipelineState::Ready => "ready",
            PipelineState::Failed(_) => "failed",
        }
    }
}

pub struct RetrievalCoordinator {
    llm: LlmManager,
    ingestor: DocumentIngestor,
    state: PipelineState,
    index: Option<VectorIndex>,
    session: Option<ModelSession>,
    /// Contador monótono de reconstrucciones: el resultado de una
    /// reconstrucción sólo se publica si su generación sigue vigente, de
    /// modo que dos subidas solapadas no compitan por publicar (gana la
    /// más reciente).
    build_generation: u64,
}

impl RetrievalCoordinator {
    pub fn new(llm: LlmManager, ingestor: DocumentIngestor) -> Self {
        Self {
            llm,
            ingestor,
            state: PipelineState::Uninitialized,
            index: None,
            session: None,
            build_generation: 0,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn llm(&self) -> &LlmManager {
        &self.llm
    }

    pub fn ingestor(&self) -> &DocumentIngestor {
        &self.ingestor
    }

    /// Mensaje legible del estado actual, para el endpoint de estado.
    pub fn status_message(&self) -> String {
        match &self.state {
            PipelineState::Uninitialized => "Sin documentos indexados.".to_string(),
            PipelineState::Indexing => "Indexando documentos...".to_string(),
            PipelineState::Ready => format!(
                "Listo. {} chunks indexados.",
                self.index.as_ref().map(VectorIndex::len).unwrap_or(0)
            ),
            PipelineState::Failed(reason) => format!("Error: {reason}"),
        }
    }

    /// Transición a `Indexing`. Retira el índice publicado (las consultas
    /// durante la transición se rechazan con "no listo") y devuelve la
    /// generación que el trabajo de reconstrucción debe presentar al
    /// terminar.
    pub fn begin_rebuild(&mut self) -> u64 {
        self.build_generation += 1;
        self.state = PipelineState::Indexing;
        self.index = None;
        info!("Reconstrucción {} iniciada.", self.build_generation);
        self.build_generation
    }

    /// Publica el resultado de una reconstrucción. Un resultado cuya
    /// generación ya no es la vigente se descarta entero.
    pub fn finish_rebuild(&mut self, generation: u64, result: Result<VectorIndex>) {
        if generation != self.build_generation {
            info!(
                "Descartado el resultado de la reconstrucción {generation}: la generación vigente es {}.",
                self.build_generation
            );
            return;
        }
        match result {
            Ok(index) => {
                info!("Índice publicado con {} entradas.", index.len());
                self.index = Some(index);
                self.state = PipelineState::Ready;
            }
            Err(err) => {
                error!("La reconstrucción del índice falló: {err}");
                self.state = PipelineState::Failed(err.to_string());
            }
        }
    }

    /// Trabajo pesado de una reconstrucción. Es una función asociada, sin
    /// `&self`, para ejecutarse en una tarea de fondo SIN retener el lock
    /// del coordinador mientras se calculan los embeddings.
    ///
    /// Con `reuse_persisted` se intenta primero recargar el índice
    /// persistido (arranque); si no existe, está corrupto o fue construido
    /// con otro modelo de embeddings, se reconstruye desde cero.
    pub async fn build_index_from_dir(
        llm: &LlmManager,
        ingestor: &DocumentIngestor,
        upload_dir: &Path,
        index_path: &Path,
        reuse_persisted: bool,
    ) -> Result<VectorIndex> {
        if reuse_persisted {
            if let Some(index) = VectorIndex::load(index_path, llm.embedding_model()) {
                return Ok(index);
            }
        }

        let mut chunks = Vec::new();
        let mut scanned = 0u32;
        let mut skipped = 0u32;

        for entry in WalkDir::new(upload_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            scanned += 1;
            let path = entry.path();
            let source_name = path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());

            // Un documento que falla se salta; la ingesta continúa.
            match DocumentIngestor::extract_text(path) {
                Ok(raw_text) => chunks.extend(ingestor.ingest(&raw_text, &source_name)),
                Err(err) => {
                    skipped += 1;
                    warn!("Saltando documento: {err}");
                }
            }
        }

        info!(
            "Ingesta completada: {scanned} ficheros escaneados, {skipped} saltados, {} chunks.",
            chunks.len()
        );

        let index = VectorIndex::build(llm, chunks).await?;
        if let Err(err) = index.persist(index_path) {
            warn!("No se pudo persistir el índice: {err}");
        }
        Ok(index)
    }

    /// Garantiza que la sesión activa corresponde a `model_id`. Si hay que
    /// cambiar de modelo, la sesión anterior se libera por completo antes
    /// de cargar la nueva.
    fn ensure_session(&mut self, model_id: &str) -> Result<()> {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.model_id == model_id)
        {
            return Ok(());
        }
        if let Some(old) = self.session.take() {
            info!(
                "Liberando la sesión del modelo '{}' antes de cargar '{model_id}'.",
                old.model_id
            );
            drop(old);
        }
        self.session = Some(self.llm.load_session(model_id)?);
        Ok(())
    }

    /// Responde una pregunta. Nunca devuelve un error: toda ruta degradada
    /// produce un mensaje explicativo para el usuario.
    pub async fn answer(
        &mut self,
        question: &str,
        model_id: &str,
        user_context: &UserContext,
        is_advisor: bool,
        rules: &RulesEngine,
    ) -> String {
        match &self.state {
            PipelineState::Uninitialized => return MSG_NO_DOCUMENTS.to_string(),
            PipelineState::Indexing => return MSG_INDEXING.to_string(),
            PipelineState::Failed(reason) => return degraded_message(reason),
            PipelineState::Ready => {}
        }

        // 1) Sesión del modelo pedido.
        if let Err(err) = self.ensure_session(model_id) {
            error!("{err}");
            let reason = err.to_string();
            self.state = PipelineState::Failed(reason.clone());
            return degraded_message(&reason);
        }

        // Sin documentos indexados no hay nada que recuperar.
        let index = match self.index.as_ref() {
            Some(index) if !index.is_empty() => index,
            _ => return MSG_NO_DOCUMENTS.to_string(),
        };

        // 2) y 3) Señal de elegibilidad + resumen demográfico.
        let boosts = rules.evaluate(user_context);
        if !boosts.is_empty() {
            info!("Programas priorizados para el usuario: {boosts:?}");
        }
        let summary = demographic_summary(user_context);
        let instruction = build_instruction(&boosts, &summary);

        // 4) Recuperación filtrada por rol.
        let public_only = !is_advisor;
        let chunks = match index.search(&self.llm, question, RETRIEVAL_K, public_only).await {
            Ok(chunks) => chunks,
            Err(err) => {
                let err = PipelineError::Generation(err.to_string());
                error!("{err}");
                return format!("Ocurrió un error al procesar la consulta: {err}");
            }
        };

        // 5) Contexto en el orden devuelto por la búsqueda.
        let context_block = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        // 6) Generación. Un fallo aquí sólo afecta a esta llamada.
        let Some(session) = self.session.as_ref() else {
            return degraded_message("la sesión de generación no está disponible");
        };
        match session.generate(question, &instruction, &context_block).await {
            Ok(answer) => answer,
            Err(err) => {
                let err = PipelineError::Generation(err.to_string());
                error!("{err}");
                format!("Ocurrió un error al generar la respuesta: {err}")
            }
        }
    }
}

/// Instrucción prioritaria + perfil demográfico para la plantilla de prompt.
fn build_instruction(boosts: &[String], summary: &str) -> String {
    let mut parts = Vec::new();
    if !boosts.is_empty() {
        parts.push(format!(
            "ATENCIÓN: El usuario califica con prioridad para los siguientes \
             programas: {}. Asegúrate de mencionar si estos programas aparecen \
             en el contexto y recomendarlos encarecidamente.",
            boosts.join(", ")
        ));
    }
    if !summary.is_empty() {
        parts.push(format!("Perfil del usuario: {summary}."));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmProvider;
    use serde_json::json;

    fn coordinator() -> RetrievalCoordinator {
        let llm = LlmManager {
            provider: LlmProvider::OpenAI,
            embedding_model: "text-embedding-3-small".to_string(),
        };
        RetrievalCoordinator::new(llm, DocumentIngestor::new().unwrap())
    }

    fn contexto_vacio() -> UserContext {
        UserContext::new()
    }

    #[tokio::test]
    async fn sin_inicializar_responde_mensaje_de_no_listo() {
        let mut coord = coordinator();
        let rules = RulesEngine::from_rules(vec![]);
        let answer = coord
            .answer("¿Qué apoyos hay?", "phi-2", &contexto_vacio(), false, &rules)
            .await;
        assert_eq!(answer, MSG_NO_DOCUMENTS);
    }

    #[tokio::test]
    async fn durante_la_indexacion_se_rechazan_consultas() {
        let mut coord = coordinator();
        coord.begin_rebuild();
        assert_eq!(coord.state(), &PipelineState::Indexing);

        let rules = RulesEngine::from_rules(vec![]);
        let answer = coord
            .answer("pregunta", "phi-2", &contexto_vacio(), false, &rules)
            .await;
        assert_eq!(answer, MSG_INDEXING);
    }

    #[tokio::test]
    async fn estado_fallido_devuelve_mensaje_degradado() {
        let mut coord = coordinator();
        let generation = coord.begin_rebuild();
        coord.finish_rebuild(generation, Err(anyhow::anyhow!("sin memoria")));
        assert_eq!(coord.state().label(), "failed");

        let rules = RulesEngine::from_rules(vec![]);
        let answer = coord
            .answer("pregunta", "phi-2", &contexto_vacio(), false, &rules)
            .await;
        assert!(answer.contains("sin memoria"));
        assert!(answer.contains("más ligero"));
    }

    #[test]
    fn resultado_de_generacion_obsoleta_se_descarta() {
        let mut coord = coordinator();
        let primera = coord.begin_rebuild();
        let segunda = coord.begin_rebuild();
        assert!(segunda > primera);

        // La reconstrucción antigua termina tarde: su índice no se publica.
        coord.finish_rebuild(primera, Ok(VectorIndex::new("m")));
        assert_eq!(coord.state(), &PipelineState::Indexing);
        assert!(coord.index.is_none());

        // La vigente sí publica.
        coord.finish_rebuild(segunda, Ok(VectorIndex::new("m")));
        assert_eq!(coord.state(), &PipelineState::Ready);
    }

    #[test]
    fn estados_terminales_son_reentrables() {
        let mut coord = coordinator();
        let g = coord.begin_rebuild();
        coord.finish_rebuild(g, Err(anyhow::anyhow!("fallo")));
        assert_eq!(coord.state().label(), "failed");

        // Una nueva subida desde `failed` vuelve a `indexing`.
        let g = coord.begin_rebuild();
        assert_eq!(coord.state(), &PipelineState::Indexing);
        coord.finish_rebuild(g, Ok(VectorIndex::new("m")));
        assert_eq!(coord.state(), &PipelineState::Ready);

        // Y también desde `ready`.
        coord.begin_rebuild();
        assert_eq!(coord.state(), &PipelineState::Indexing);
    }

    #[test]
    fn cambiar_de_modelo_recarga_la_sesion_completa() {
        let mut coord = coordinator();

        coord.ensure_session("phi-2").unwrap();
        let primera = coord.session.as_ref().unwrap().session_id;

        // Mismo modelo: la sesión se reutiliza.
        coord.ensure_session("phi-2").unwrap();
        assert_eq!(coord.session.as_ref().unwrap().session_id, primera);

        // A -> B -> A: dos recargas completas, sin caché implícita.
        coord.ensure_session("socialite-llama").unwrap();
        let segunda = coord.session.as_ref().unwrap().session_id;
        assert_ne!(segunda, primera);

        coord.ensure_session("phi-2").unwrap();
        let tercera = coord.session.as_ref().unwrap().session_id;
        assert_ne!(tercera, primera);
        assert_ne!(tercera, segunda);
    }

    #[tokio::test]
    async fn conjunto_de_subida_vacio_degrada_sin_invocar_proveedores() {
        let dir = tempfile::tempdir().unwrap();
        let upload_dir = dir.path().join("uploads");
        std::fs::create_dir_all(&upload_dir).unwrap();
        let index_path = dir.path().join("index/chunks.json");

        let mut coord = coordinator();
        let generation = coord.begin_rebuild();
        // Sin documentos no hay lotes que embeber: no se toca ningún proveedor.
        let result = RetrievalCoordinator::build_index_from_dir(
            coord.llm(),
            coord.ingestor(),
            &upload_dir,
            &index_path,
            false,
        )
        .await;
        coord.finish_rebuild(generation, result);
        assert_eq!(coord.state(), &PipelineState::Ready);

        let rules = RulesEngine::from_rules(vec![]);
        let answer = coord
            .answer("¿Qué apoyos hay?", "phi-2", &contexto_vacio(), false, &rules)
            .await;
        assert_eq!(answer, MSG_NO_DOCUMENTS);
    }

    #[tokio::test]
    async fn documentos_ilegibles_se_saltan_sin_abortar() {
        let dir = tempfile::tempdir().unwrap();
        let upload_dir = dir.path().join("uploads");
        std::fs::create_dir_all(&upload_dir).unwrap();
        // Extensión no soportada: se salta. El resto de la pasada continúa
        // y termina con un índice vacío pero utilizable.
        std::fs::write(upload_dir.join("datos.xlsx"), b"binario").unwrap();

        let coord = coordinator();
        let index = RetrievalCoordinator::build_index_from_dir(
            coord.llm(),
            coord.ingestor(),
            &upload_dir,
            &dir.path().join("chunks.json"),
            false,
        )
        .await
        .unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn instruccion_prioritaria_nombra_los_programas() {
        let boosts = vec!["Pension Adulto Mayor".to_string()];
        let instruction = build_instruction(&boosts, "age: 70");
        assert!(instruction.contains("Pension Adulto Mayor"));
        assert!(instruction.contains("recomendarlos encarecidamente"));
        assert!(instruction.contains("Perfil del usuario: age: 70."));

        // Sin boosts ni perfil, la instrucción queda vacía.
        assert!(build_instruction(&[], "").is_empty());
    }

    #[test]
    fn contexto_con_boosts_desde_reglas() {
        let rules: Vec<crate::rules::Rule> = serde_json::from_str(
            r#"[{
                "description": "adultos mayores",
                "conditions": {"field": "age", "operator": ">=", "value": 65},
                "priority_programs": ["Pension Adulto Mayor"]
            }]"#,
        )
        .unwrap();
        let engine = RulesEngine::from_rules(rules);

        let mut ctx = UserContext::new();
        ctx.insert("age".to_string(), json!(70));
        assert_eq!(engine.evaluate(&ctx), vec!["Pension Adulto Mayor".to_string()]);
    }
}
