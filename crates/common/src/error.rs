use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the context pool.
///
/// The pool never retries a user request transparently; callers receive the
/// typed error and decide. The HTTP adapter maps each variant to a status
/// code (see `scraper-pool-server`).
#[derive(Debug, Error)]
pub enum PoolError {
    /// Queue capacity exhausted: queued waiters plus live contexts exceed
    /// the configured backlog cap.
    #[error("pool full: request backlog cap exceeded")]
    PoolFull,

    /// Waited in the queue beyond the configured maximum.
    #[error("no context available after {}s", .0.as_secs())]
    QueueTimeout(Duration),

    /// The per-request execution deadline elapsed. Counted as a normal
    /// error for context health tracking.
    #[error("scrape timed out after {}ms", .0.as_millis())]
    ScrapeTimeout(Duration),

    /// Ordinary scrape failure reported by the browser driver.
    #[error("driver error: {0}")]
    Driver(String),

    /// Browser-process level failure. Triggers a whole-browser restart.
    #[error("browser target closed: {0}; the browser is being restarted")]
    TargetClosed(String),

    /// The scrape was in flight when a whole-browser restart began.
    #[error("scrape aborted by browser restart")]
    BrowserRestarting,

    /// The browser relaunch retry budget is exhausted; the pool fails fast
    /// until an out-of-band restart succeeds.
    #[error("browser unavailable: relaunch retry budget exhausted")]
    BrowserUnavailable,

    /// The pool is shutting down and no longer accepts work.
    #[error("pool is shutting down")]
    Shutdown,

    /// Management operation referenced an unknown context id.
    #[error("context not found: {0}")]
    ContextNotFound(String),

    /// Management operation on a context that is currently executing a
    /// scrape.
    #[error("context is busy")]
    ContextBusy,

    /// Request validation failure (malformed URL, unsupported scheme, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl PoolError {
    /// True for failures that indicate the whole pool (not one request) is
    /// unhealthy.
    pub fn is_pool_unavailable(&self) -> bool {
        matches!(
            self,
            Self::BrowserRestarting | Self::BrowserUnavailable | Self::Shutdown
        )
    }
}
