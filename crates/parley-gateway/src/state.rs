use std::sync::Arc;

use parley_agents::ChatPipeline;
use parley_config::AppConfig;
use parley_db::ChatStore;

/// Shared handles for all gateway routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<ChatStore>,
    pub pipeline: Arc<ChatPipeline>,
}
