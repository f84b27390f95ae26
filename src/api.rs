//! Adaptadores HTTP finos sobre el coordinador y el motor de reglas.

use std::path::Path;

use axum::{
    extract::{Json, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::spawn;
use tracing::{error, info, warn};

use crate::{
    app_state::AppState,
    models::UserContext,
    rag::RetrievalCoordinator,
};

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct ChatPayload {
    message: String,
    #[serde(default)]
    model_name: Option<String>,
    #[serde(default)]
    user_context: Option<UserContext>,
    #[serde(default)]
    is_advisor: bool,
}

#[derive(Serialize)]
pub struct ChatResponse {
    response: String,
}

#[derive(Deserialize)]
pub struct VerifyKeyPayload {
    key: String,
}

#[derive(Deserialize)]
struct AdvisorKeys {
    #[serde(default)]
    keys: Vec<String>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload_handler))
        .route("/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .route("/verify-key", post(verify_key_handler))
        .route("/api/status", get(status_handler))
        .with_state(app_state)
}

/// Lanza una reconstrucción del índice en una tarea de fondo. El lock del
/// coordinador sólo se toma para las transiciones de estado, nunca durante
/// el cálculo de embeddings, así la capa HTTP sigue respondiendo y los
/// clientes observan el progreso vía `/api/status`.
pub fn spawn_rebuild(state: AppState, reuse_persisted: bool) {
    spawn(async move {
        let (generation, llm, ingestor) = {
            let mut coord = state.coordinator.lock().await;
            (
                coord.begin_rebuild(),
                coord.llm().clone(),
                coord.ingestor().clone(),
            )
        };

        let result = RetrievalCoordinator::build_index_from_dir(
            &llm,
            &ingestor,
            &state.config.upload_dir,
            &state.config.index_path,
            reuse_persisted,
        )
        .await;

        state.coordinator.lock().await.finish_rebuild(generation, result);
    });
}

// --- Handlers ---

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    tokio::fs::create_dir_all(&state.config.upload_dir)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("No se pudo crear el directorio de subida: {e}")})),
            )
        })?;

    let mut saved = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Multipart inválido: {e}")})),
        )
    })? {
        let Some(file_name) = field.file_name().map(|s| s.to_string()) else {
            continue;
        };
        // Sólo el nombre final: evita que un nombre con rutas escape del
        // directorio de subida.
        let Some(file_name) = Path::new(&file_name)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
        else {
            continue;
        };

        let data = field.bytes().await.map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Error leyendo el fichero subido: {e}")})),
            )
        })?;

        let dest = state.config.upload_dir.join(&file_name);
        tokio::fs::write(&dest, &data).await.map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("Error guardando {file_name}: {e}")})),
            )
        })?;
        saved.push(file_name);
    }

    if saved.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No se recibió ningún fichero."})),
        ));
    }

    info!("Subidos {} ficheros; iniciando la reindexación.", saved.len());
    spawn_rebuild(state, false);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": format!("Subidos {} ficheros. Indexación en curso.", saved.len()),
            "filenames": saved,
        })),
    ))
}

#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatPayload>,
) -> Json<ChatResponse> {
    let model_id = payload
        .model_name
        .unwrap_or_else(|| state.config.default_chat_model.clone());
    let user_context = payload.user_context.unwrap_or_default();

    // El lock cubre cambio de modelo + recuperación + generación: un cambio
    // de sesión nunca corre en paralelo con una respuesta en vuelo.
    let mut coord = state.coordinator.lock().await;
    let response = coord
        .answer(
            &payload.message,
            &model_id,
            &user_context,
            payload.is_advisor,
            &state.rules,
        )
        .await;

    Json(ChatResponse { response })
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let coord = state.coordinator.lock().await;
    Json(json!({
        "state": coord.state().label(),
        "message": coord.status_message(),
    }))
}

#[axum::debug_handler]
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

#[axum::debug_handler]
async fn verify_key_handler(
    State(state): State<AppState>,
    Json(payload): Json<VerifyKeyPayload>,
) -> Json<serde_json::Value> {
    let valid = match read_advisor_keys(&state.config.advisor_keys_path) {
        Ok(keys) => keys.iter().any(|k| k == &payload.key),
        Err(err) => {
            error!("Error verificando la clave de asesor: {err}");
            false
        }
    };

    if valid {
        info!("Clave de asesor verificada correctamente.");
    } else {
        warn!("Intento de clave de asesor no válida.");
    }
    Json(json!({"valid": valid}))
}

fn read_advisor_keys(path: &Path) -> anyhow::Result<Vec<String>> {
    let data = std::fs::read_to_string(path)?;
    let parsed: AdvisorKeys = serde_json::from_str(&data)?;
    Ok(parsed.keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claves_de_asesor_se_leen_del_fichero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("advisor_keys.json");
        std::fs::write(&path, r#"{"keys": ["clave-1", "clave-2"]}"#).unwrap();

        let keys = read_advisor_keys(&path).unwrap();
        assert_eq!(keys, vec!["clave-1".to_string(), "clave-2".to_string()]);
    }

    #[test]
    fn fichero_de_claves_ausente_o_roto_es_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_advisor_keys(&dir.path().join("nada.json")).is_err());

        let path = dir.path().join("roto.json");
        std::fs::write(&path, "{").unwrap();
        assert!(read_advisor_keys(&path).is_err());
    }
}
