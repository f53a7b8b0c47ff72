use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pool-level limits and timings. All fields are overridable from the
/// environment via [`PoolConfig::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard upper bound on live contexts.
    pub max_contexts: usize,

    /// Minimum spacing between requests to the same registrable host from a
    /// single context.
    #[serde(with = "humantime_serde")]
    pub default_domain_delay: Duration,

    /// How long a request may wait in the queue for an eligible context.
    #[serde(with = "humantime_serde")]
    pub max_queue_wait: Duration,

    /// Consecutive error count at which a context is torn down and
    /// recreated.
    pub max_consecutive_errors: u32,

    /// Root directory for persistent context storage and meta files.
    pub persistent_contexts_path: PathBuf,

    /// How long shutdown waits for in-flight scrapes before forcing the
    /// driver down.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_contexts: 10,
            default_domain_delay: Duration::from_millis(1000),
            max_queue_wait: Duration::from_secs(300),
            max_consecutive_errors: 5,
            persistent_contexts_path: PathBuf::from("./data/contexts"),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_contexts: env_parse("MAX_CONTEXTS", defaults.max_contexts),
            default_domain_delay: Duration::from_millis(env_parse(
                "DEFAULT_DOMAIN_DELAY_MS",
                defaults.default_domain_delay.as_millis() as u64,
            )),
            max_queue_wait: Duration::from_secs(env_parse(
                "MAX_QUEUE_WAIT_SECONDS",
                defaults.max_queue_wait.as_secs(),
            )),
            max_consecutive_errors: env_parse(
                "MAX_CONSECUTIVE_ERRORS",
                defaults.max_consecutive_errors,
            ),
            persistent_contexts_path: env::var("PERSISTENT_CONTEXTS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.persistent_contexts_path),
            shutdown_grace: Duration::from_secs(env_parse(
                "SHUTDOWN_GRACE_SECONDS",
                defaults.shutdown_grace.as_secs(),
            )),
        }
    }

    /// Backlog cap: queued waiters plus live contexts may not exceed this.
    pub fn queue_cap(&self) -> usize {
        self.max_contexts * 4
    }
}

/// Settings forwarded to the browser driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub headless: bool,

    /// Run a virtual X display (Xvfb) when not headless. Useful for
    /// containers without a display server.
    pub use_virtual_display: bool,
    pub virtual_display_size: (u32, u32),

    /// Explicit browser binary path. None uses auto-detection.
    pub browser_path: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            use_virtual_display: true,
            virtual_display_size: (1920, 1080),
            browser_path: None,
        }
    }
}

impl BrowserConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            headless: env_parse("BROWSER_HEADLESS", defaults.headless),
            use_virtual_display: env_parse("USE_VIRTUAL_DISPLAY", defaults.use_virtual_display),
            virtual_display_size: env::var("VIRTUAL_DISPLAY_SIZE")
                .ok()
                .and_then(|v| parse_display_size(&v))
                .unwrap_or(defaults.virtual_display_size),
            browser_path: env::var("BROWSER_PATH").ok().map(PathBuf::from),
        }
    }
}

/// HTTP adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: env_parse("PORT", defaults.port),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub browser: BrowserConfig,
    pub server: ServerConfig,
    pub log_level: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            pool: PoolConfig::from_env(),
            browser: BrowserConfig::from_env(),
            server: ServerConfig::from_env(),
            log_level: env::var("LOG_LEVEL").ok(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse a `WIDTHxHEIGHT` display size string.
fn parse_display_size(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.max_contexts, 10);
        assert_eq!(config.default_domain_delay, Duration::from_millis(1000));
        assert_eq!(config.max_queue_wait, Duration::from_secs(300));
        assert_eq!(config.max_consecutive_errors, 5);
        assert_eq!(config.queue_cap(), 40);
    }

    #[test]
    fn display_size_parsing() {
        assert_eq!(parse_display_size("1920x1080"), Some((1920, 1080)));
        assert_eq!(parse_display_size("1280X720"), Some((1280, 720)));
        assert_eq!(parse_display_size("wide"), None);
    }
}
