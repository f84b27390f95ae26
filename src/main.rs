// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod errors;
mod ingest;
mod llm;
mod models;
mod rag;
mod rules;
mod vector_store;

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::ingest::DocumentIngestor;
use crate::llm::LlmManager;
use crate::rag::RetrievalCoordinator;
use crate::rules::RulesEngine;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Cargar reglas de prioridad (una fuente malformada degrada a un
    //    conjunto vacío, nunca aborta el arranque)
    let rules = Arc::new(RulesEngine::load(&cfg.rules_path));

    // 4. Inicializar el coordinador de recuperación
    let llm = LlmManager::from_config(&cfg).expect("Error inicializando LLM Manager");
    let ingestor = DocumentIngestor::new().expect("Error inicializando el ingestor");
    let coordinator = Arc::new(Mutex::new(RetrievalCoordinator::new(llm, ingestor)));

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        rules,
        coordinator,
    };

    // 6. Si ya hay documentos subidos, indexar al arranque reutilizando el
    //    índice persistido cuando sea compatible
    if has_documents(&cfg.upload_dir) {
        info!("Documentos existentes en {}; indexando al arranque.", cfg.upload_dir.display());
        api::spawn_rebuild(app_state.clone(), true);
    }

    // 7. Configurar el router de la API con CORS permisivo
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 8. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir el puerto del servidor");
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    axum::serve(listener, app)
        .await
        .expect("El servidor terminó con error");
}

/// Comprueba si el directorio de subida contiene algún fichero, con el
/// mismo recorrido recursivo que usa luego la reconstrucción del índice.
fn has_documents(dir: &Path) -> bool {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detecta_documentos_en_subdirectorios() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_documents(dir.path()));

        // Un documento anidado también cuenta para indexar al arranque.
        let nested = dir.path().join("convocatorias/2024");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("folleto.pdf"), b"pdf").unwrap();
        assert!(has_documents(dir.path()));
    }

    #[test]
    fn directorio_inexistente_no_tiene_documentos() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_documents(&dir.path().join("no_existe")));
    }
}
