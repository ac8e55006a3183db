use std::sync::Arc;

use crate::config::RecommendationConfig;
use crate::services::Orchestrator;
use crate::store::SignalStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(store: Arc<dyn SignalStore>, cfg: RecommendationConfig) -> Self {
        Self {
            orchestrator: Arc::new(Orchestrator::new(store, cfg)),
        }
    }
}
