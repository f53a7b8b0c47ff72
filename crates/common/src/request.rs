//! Request and result contracts for the scrape pipeline.
//!
//! These are the fixed, validated schemas the HTTP adapter deserializes
//! into and the pool consumes. Everything selection-relevant (tags, proxy,
//! domain delay) lives here so the pool never needs to re-parse the wire
//! payload.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::rate_limit_domain;
use crate::error::PoolError;

/// When navigation is considered complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitFor {
    #[default]
    Load,
    Domcontentloaded,
    Networkidle,
}

impl FromStr for WaitFor {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "load" => Ok(Self::Load),
            "domcontentloaded" => Ok(Self::Domcontentloaded),
            "networkidle" => Ok(Self::Networkidle),
            _ => Err(()),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// A single scrape request as accepted by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRequest {
    /// Absolute http(s) URL to navigate to.
    pub url: String,

    /// Tags a context must carry to serve this request. Empty means any
    /// context is eligible.
    #[serde(default)]
    pub required_tags: BTreeSet<String>,

    /// Proxy URL. When the request ends up minting a new context, the proxy
    /// sticks to that context for its whole life.
    #[serde(default)]
    pub proxy: Option<String>,

    /// Override of the same-domain spacing in milliseconds. Persists as the
    /// new spacing for the chosen context+domain until the next override.
    #[serde(default)]
    pub domain_delay: Option<u64>,

    #[serde(default)]
    pub wait_for: WaitFor,

    /// Per-request execution deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,

    #[serde(default = "default_true")]
    pub get_content: bool,

    /// JavaScript evaluated in the page after load; its return value is
    /// reported under `script_result`.
    #[serde(default)]
    pub script: Option<String>,

    #[serde(default)]
    pub screenshot: bool,

    /// Block images/fonts/stylesheets during navigation.
    #[serde(default = "default_true")]
    pub block_resources: bool,

    /// Used only when this request mints a new context.
    #[serde(default)]
    pub persistent: bool,
}

impl ScrapeRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            required_tags: BTreeSet::new(),
            proxy: None,
            domain_delay: None,
            wait_for: WaitFor::default(),
            timeout: default_timeout_ms(),
            get_content: true,
            script: None,
            screenshot: false,
            block_resources: true,
            persistent: false,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_domain_delay_ms(mut self, delay_ms: u64) -> Self {
        self.domain_delay = Some(delay_ms);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn domain_delay(&self) -> Option<Duration> {
        self.domain_delay.map(Duration::from_millis)
    }

    /// Validate the request before admission.
    ///
    /// Checks the URL is absolute http(s) and the timeout is non-zero; the
    /// domain itself is extracted separately by the pool.
    pub fn validate(&self) -> Result<(), PoolError> {
        let domain = rate_limit_domain(&self.url)?;
        if domain.is_empty() {
            return Err(PoolError::InvalidRequest(format!(
                "url has no host: {}",
                self.url
            )));
        }

        let scheme_ok = self.url.starts_with("http://") || self.url.starts_with("https://");
        if !scheme_ok {
            return Err(PoolError::InvalidRequest(format!(
                "unsupported url scheme: {}",
                self.url
            )));
        }

        if self.timeout == 0 {
            return Err(PoolError::InvalidRequest("timeout must be > 0".into()));
        }

        Ok(())
    }
}

/// Outcome of a scrape as returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub success: bool,
    /// Final URL after navigation (redirects followed).
    pub url: String,
    /// HTTP status of the top-level navigation, when observable.
    pub status: Option<u16>,
    pub content: Option<String>,
    pub script_result: Option<serde_json::Value>,
    /// Base64-encoded PNG.
    pub screenshot: Option<String>,
    pub context_id: Uuid,
    /// Time this request spent queued waiting for a context.
    pub queue_wait_ms: u64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let req: ScrapeRequest = serde_json::from_str(r#"{"url":"https://a.example/"}"#).unwrap();
        assert!(req.required_tags.is_empty());
        assert_eq!(req.wait_for, WaitFor::Load);
        assert_eq!(req.timeout, 30_000);
        assert!(req.get_content);
        assert!(!req.screenshot);
        assert!(req.block_resources);
        assert!(!req.persistent);
    }

    #[test]
    fn wait_for_parses_wire_values() {
        let req: ScrapeRequest =
            serde_json::from_str(r#"{"url":"https://a.example/","wait_for":"networkidle"}"#)
                .unwrap();
        assert_eq!(req.wait_for, WaitFor::Networkidle);
        assert_eq!("domcontentloaded".parse(), Ok(WaitFor::Domcontentloaded));
    }

    #[test]
    fn validate_rejects_non_http_schemes() {
        let req = ScrapeRequest::new("ftp://a.example/file");
        assert!(matches!(req.validate(), Err(PoolError::InvalidRequest(_))));
    }

    #[test]
    fn validate_accepts_plain_request() {
        assert!(ScrapeRequest::new("https://a.example/page").validate().is_ok());
    }
}
