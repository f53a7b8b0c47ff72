//! The contract between the pool and the browser automation layer.
//!
//! The driver is the only component that talks to the real browser. The pool
//! treats handles as opaque tokens and relies on `TargetClosed` being
//! reported distinctly from ordinary failures to decide when the whole
//! browser must be restarted.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use scraper_pool_common::ScrapeRequest;

/// Opaque handle to a live browser context inside the driver. Valid only
/// until the context is closed or the browser restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverHandle(pub u64);

#[derive(Debug, Error)]
pub enum DriverError {
    /// The browser process (or its CDP connection) is gone. The pool reacts
    /// with a whole-browser restart.
    #[error("browser target closed: {0}")]
    TargetClosed(String),

    /// Ordinary scrape/context failure; counts against context health.
    #[error("{0}")]
    Failed(String),
}

impl DriverError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn target_closed(msg: impl Into<String>) -> Self {
        Self::TargetClosed(msg.into())
    }

    pub fn is_target_closed(&self) -> bool {
        matches!(self, Self::TargetClosed(_))
    }
}

/// Everything the driver needs to materialize one context.
#[derive(Debug, Clone)]
pub struct ContextSpec {
    pub id: Uuid,
    pub proxy: Option<String>,
    /// Directory owned by this context when it is persistent. The driver
    /// decides the on-disk format; the pool only guarantees existence and
    /// exclusivity.
    pub storage_path: Option<PathBuf>,
    pub tags: BTreeSet<String>,
}

/// Driver-level outcome of one scrape step.
#[derive(Debug, Clone, Default)]
pub struct PageResult {
    pub url: String,
    pub status: Option<u16>,
    pub content: Option<String>,
    pub script_result: Option<serde_json::Value>,
    /// Base64-encoded PNG.
    pub screenshot: Option<String>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Launch the underlying browser process. Called once at startup and
    /// again after `shutdown` during a whole-browser restart.
    async fn launch(&self) -> Result<(), DriverError>;

    /// Tear down the browser process. Idempotent.
    async fn shutdown(&self) -> Result<(), DriverError>;

    async fn new_context(&self, spec: &ContextSpec) -> Result<DriverHandle, DriverError>;

    /// Close one context. Idempotent: unknown handles are not an error.
    async fn close_context(&self, handle: DriverHandle) -> Result<(), DriverError>;

    /// Perform one scrape step on the given context: navigate, optionally
    /// evaluate a script, capture a screenshot and return content.
    async fn execute(
        &self,
        handle: DriverHandle,
        request: &ScrapeRequest,
    ) -> Result<PageResult, DriverError>;
}
