use std::sync::Arc;

use alert_engine::recommend::RecommendationComposer;
use alert_engine::store::Store;
use alert_engine::{AlertManager, EngineConfig};

/// Shared state injected into every Axum handler via `State`.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub manager: AlertManager,
}

impl AppState {
    pub fn new<S: Store + 'static>(store: Arc<S>, config: EngineConfig, composer: RecommendationComposer) -> Self {
        let manager = AlertManager::new(config, composer, store.clone(), store.clone(), store.clone());
        Self { store, manager }
    }
}
