use std::sync::Arc;

use axum::extract::FromRef;

use crate::config::Settings;
use crate::pipeline::Pipeline;
use crate::services::EventBus;
use crate::webhook::WebhookService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub webhook: Arc<WebhookService>,
    pub pipeline: Pipeline,
    pub events: Arc<EventBus>,
}

impl FromRef<AppState> for Pipeline {
    fn from_ref(state: &AppState) -> Self {
        state.pipeline.clone()
    }
}
