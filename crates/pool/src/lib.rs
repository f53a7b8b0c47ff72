//! Context pool manager: a bounded set of isolated browser contexts behind
//! one externally controlled browser process, multiplexing scrape requests
//! with per-context proxy affinity, per-domain rate limiting, health
//! tracking and crash recovery.

pub mod chrome;
pub mod context;
pub mod driver;
pub mod persist;
pub mod pool;

mod eviction;
mod queue;
mod rate_limiter;

pub use chrome::ChromeDriver;
pub use context::{ContextInfo, ContextStatus, PROTECTED_TAG};
pub use driver::{BrowserDriver, ContextSpec, DriverError, DriverHandle, PageResult};
pub use persist::ContextMeta;
pub use pool::{ContextPool, PoolStatus};
pub use rate_limiter::DomainRateLimiter;
