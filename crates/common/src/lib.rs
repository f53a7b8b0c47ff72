pub mod config;
pub mod domain;
pub mod error;
pub mod proxy;
pub mod request;

pub use config::{AppConfig, BrowserConfig, PoolConfig, ServerConfig};
pub use domain::rate_limit_domain;
pub use error::PoolError;
pub use proxy::ProxyEndpoint;
pub use request::{ScrapeRequest, ScrapeResult, WaitFor};
