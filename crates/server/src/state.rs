use std::sync::Arc;

use scraper_pool_core::ContextPool;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ContextPool>,
    pub metrics: Metrics,
}
