use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use scraper_pool_core::PoolStatus;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub pool_size: IntGauge,
    pub pool_available: IntGauge,
    pub pool_busy: IntGauge,
    pub queue_depth: IntGauge,
    pub generation: IntGauge,
    pub requests_total: IntCounter,
    pub requests_failed: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let pool_size = IntGauge::with_opts(Opts::new(
            "scraper_pool_contexts_total",
            "Number of contexts currently in the pool",
        ))?;
        registry.register(Box::new(pool_size.clone()))?;

        let pool_available = IntGauge::with_opts(Opts::new(
            "scraper_pool_contexts_available",
            "Number of idle contexts",
        ))?;
        registry.register(Box::new(pool_available.clone()))?;

        let pool_busy = IntGauge::with_opts(Opts::new(
            "scraper_pool_contexts_busy",
            "Number of contexts currently executing a scrape",
        ))?;
        registry.register(Box::new(pool_busy.clone()))?;

        let queue_depth = IntGauge::with_opts(Opts::new(
            "scraper_pool_queue_depth",
            "Requests waiting for a context",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let generation = IntGauge::with_opts(Opts::new(
            "scraper_pool_browser_generation",
            "Monotone counter bumped on every whole-browser restart",
        ))?;
        registry.register(Box::new(generation.clone()))?;

        let requests_total = IntCounter::with_opts(Opts::new(
            "scraper_pool_requests_total",
            "Total scrape requests processed",
        ))?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_failed = IntCounter::with_opts(Opts::new(
            "scraper_pool_requests_failed",
            "Total scrape requests that failed",
        ))?;
        registry.register(Box::new(requests_failed.clone()))?;

        Ok(Self {
            registry,
            pool_size,
            pool_available,
            pool_busy,
            queue_depth,
            generation,
            requests_total,
            requests_failed,
        })
    }

    pub fn observe_pool(&self, status: &PoolStatus) {
        self.pool_size.set(status.size as i64);
        self.pool_available.set(status.available as i64);
        self.pool_busy.set(status.busy as i64);
        self.queue_depth.set(status.queue_depth as i64);
        self.generation.set(status.generation as i64);
    }

    pub fn encode(&self) -> impl IntoResponse {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();

        let mut buffer = Vec::new();
        match encoder.encode(&families, &mut buffer) {
            Ok(()) => (StatusCode::OK, buffer),
            Err(e) => {
                tracing::error!("failed to encode metrics: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
            }
        }
    }
}
