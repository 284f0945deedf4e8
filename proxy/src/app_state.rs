use std::sync::Arc;
use std::time::Instant;

use router_core::{IdleMonitor, ModelManager, RouterConfig};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ModelManager>,
    pub idle_monitor: Arc<IdleMonitor>,
    pub config: RouterConfig,
    pub http: reqwest::Client,
    pub started_at: Instant,
}
