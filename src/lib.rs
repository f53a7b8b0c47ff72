//! # Scraper Pool
//!
//! A browser-context pooling service: one externally controlled browser
//! process hosts a bounded set of isolated contexts, and incoming scrape
//! requests are fairly multiplexed onto them with per-context proxy
//! affinity, per-domain rate limiting, health tracking and crash recovery.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use scraper_pool::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_env();
//!
//!     let driver = Arc::new(ChromeDriver::new(config.browser.clone()));
//!     let pool = ContextPool::new(config.pool.clone(), driver);
//!     pool.start().await?;
//!
//!     let result = pool
//!         .scrape(ScrapeRequest::new("https://example.com/"))
//!         .await?;
//!     println!("{}", result.content.unwrap_or_default());
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **`common`**: configuration, request/result contracts, error taxonomy.
//! - **`core`**: the pool manager with selection, queueing, rate limiting,
//!   eviction, recreation and the whole-browser restart protocol.
//! - **`server`**: the thin HTTP adapter and service entry.

/// Re-export of shared types and configuration.
pub use scraper_pool_common as common;

/// Re-export of the pool manager.
pub use scraper_pool_core as core;

/// Re-export of the HTTP adapter and service entry.
pub use scraper_pool_server as server;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::common::{
        AppConfig, BrowserConfig, PoolConfig, PoolError, ProxyEndpoint, ScrapeRequest,
        ScrapeResult, ServerConfig, WaitFor,
    };

    pub use crate::core::{
        BrowserDriver, ChromeDriver, ContextInfo, ContextPool, ContextSpec, DriverError,
        DriverHandle, PageResult, PoolStatus, PROTECTED_TAG,
    };

    pub use crate::server::run_server;
}
