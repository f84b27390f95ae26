use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::rag::RetrievalCoordinator;
use crate::rules::RulesEngine;

/// Estado compartido de la aplicación. Las reglas son de sólo lectura tras
/// la carga; el coordinador (índice + sesión de modelo) va tras un Mutex
/// asíncrono porque `answer` retiene el lock a través de awaits: el cambio
/// de modelo y las consultas en vuelo se excluyen mutuamente.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub rules: Arc<RulesEngine>,
    pub coordinator: Arc<Mutex<RetrievalCoordinator>>,
}
