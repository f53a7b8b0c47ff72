//! Per-context spacing of requests to the same registrable host.
//!
//! Each context owns one limiter; two contexts may hit the same domain
//! concurrently. The table dies with the context: recreation, even under the
//! same id, starts from an empty table.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct DomainEntry {
    next_allowed: Instant,
    /// Spacing applied to the last request. A per-request override replaces
    /// this and persists for the domain until the next override.
    delay: Duration,
}

#[derive(Debug)]
pub struct DomainRateLimiter {
    default_delay: Duration,
    entries: HashMap<String, DomainEntry>,
}

impl DomainRateLimiter {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            entries: HashMap::new(),
        }
    }

    /// The wall time at which a request to `domain` would be permitted.
    /// Unknown domains are allowed immediately.
    pub fn next_available(&self, domain: &str) -> Instant {
        match self.entries.get(domain) {
            Some(entry) => entry.next_allowed,
            None => Instant::now(),
        }
    }

    /// The spacing that will apply to a request carrying `override_delay`.
    pub fn effective_delay(&self, domain: &str, override_delay: Option<Duration>) -> Duration {
        override_delay
            .or_else(|| self.entries.get(domain).map(|e| e.delay))
            .unwrap_or(self.default_delay)
    }

    /// Record that a request to `domain` just started.
    pub fn mark_used(&mut self, domain: &str, override_delay: Option<Duration>) {
        let delay = self.effective_delay(domain, override_delay);
        self.entries.insert(
            domain.to_string(),
            DomainEntry {
                next_allowed: Instant::now() + delay,
                delay,
            },
        );
    }

    pub fn tracked_domains(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: Duration = Duration::from_millis(1000);

    #[tokio::test]
    async fn unknown_domain_is_available_now() {
        let limiter = DomainRateLimiter::new(DEFAULT);
        assert!(limiter.next_available("a.example") <= Instant::now());
    }

    #[tokio::test]
    async fn mark_used_spaces_out_next_request() {
        let mut limiter = DomainRateLimiter::new(DEFAULT);
        let before = Instant::now();
        limiter.mark_used("a.example", None);

        let next = limiter.next_available("a.example");
        assert!(next >= before + DEFAULT);

        // Other domains remain unaffected.
        assert!(limiter.next_available("b.example") <= Instant::now());
    }

    #[tokio::test]
    async fn override_persists_for_later_requests() {
        let mut limiter = DomainRateLimiter::new(DEFAULT);
        limiter.mark_used("a.example", Some(Duration::from_millis(5000)));

        // A follow-up request with no override inherits the 5s spacing.
        assert_eq!(
            limiter.effective_delay("a.example", None),
            Duration::from_millis(5000)
        );

        // Until the next override replaces it.
        limiter.mark_used("a.example", Some(Duration::from_millis(250)));
        assert_eq!(
            limiter.effective_delay("a.example", None),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn override_applies_per_domain() {
        let mut limiter = DomainRateLimiter::new(DEFAULT);
        limiter.mark_used("a.example", Some(Duration::from_millis(100)));
        assert_eq!(limiter.effective_delay("b.example", None), DEFAULT);
    }
}
