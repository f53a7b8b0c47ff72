//! A managed browser context: the unit of isolation inside the pool.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::driver::{ContextSpec, DriverHandle};
use crate::rate_limiter::DomainRateLimiter;

/// Reserved tag that disables eviction for a context.
pub const PROTECTED_TAG: &str = "protected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Idle,
    Busy,
    Recreating,
    Destroyed,
}

/// Pool-internal state of one context.
///
/// The driver handle is valid only while `status != Destroyed` and while the
/// pool generation it was minted in is still current.
#[derive(Debug)]
pub(crate) struct Context {
    pub id: Uuid,
    pub tags: BTreeSet<String>,
    pub proxy: Option<String>,
    pub persistent: bool,
    pub storage_path: Option<PathBuf>,
    pub status: ContextStatus,
    pub created_at: Instant,
    pub created_at_wall: SystemTime,
    pub last_used_at: Instant,
    pub consecutive_errors: u32,
    pub total_requests: u64,
    pub total_errors: u64,
    pub limiter: DomainRateLimiter,
    pub handle: Option<DriverHandle>,
    /// Pool generation the current handle belongs to.
    pub generation: u64,
}

impl Context {
    pub fn new(
        id: Uuid,
        proxy: Option<String>,
        persistent: bool,
        storage_path: Option<PathBuf>,
        tags: BTreeSet<String>,
        default_domain_delay: Duration,
        generation: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            tags,
            proxy,
            persistent,
            storage_path,
            status: ContextStatus::Recreating,
            created_at: now,
            created_at_wall: SystemTime::now(),
            last_used_at: now,
            consecutive_errors: 0,
            total_requests: 0,
            total_errors: 0,
            limiter: DomainRateLimiter::new(default_domain_delay),
            handle: None,
            generation,
        }
    }

    pub fn is_protected(&self) -> bool {
        self.tags.contains(PROTECTED_TAG)
    }

    pub fn has_tags(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|t| self.tags.contains(t))
    }

    /// Transition idle -> busy and bump the usage timestamp.
    pub fn assign(&mut self) {
        debug_assert_eq!(self.status, ContextStatus::Idle);
        self.status = ContextStatus::Busy;
        self.last_used_at = Instant::now();
    }

    /// Reset driver-facing state after the handle was replaced. The
    /// rate-limit table of the old incarnation is discarded.
    pub fn install_handle(
        &mut self,
        handle: DriverHandle,
        generation: u64,
        default_domain_delay: Duration,
    ) {
        self.handle = Some(handle);
        self.generation = generation;
        self.status = ContextStatus::Idle;
        self.consecutive_errors = 0;
        self.limiter = DomainRateLimiter::new(default_domain_delay);
    }

    pub fn spec(&self) -> ContextSpec {
        ContextSpec {
            id: self.id,
            proxy: self.proxy.clone(),
            storage_path: self.storage_path.clone(),
            tags: self.tags.clone(),
        }
    }

    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            id: self.id,
            tags: self.tags.clone(),
            proxy: self.proxy.clone(),
            persistent: self.persistent,
            status: self.status,
            created_at: self.created_at_wall,
            idle_ms: self.last_used_at.elapsed().as_millis() as u64,
            total_requests: self.total_requests,
            total_errors: self.total_errors,
            consecutive_errors: self.consecutive_errors,
        }
    }
}

/// Externally visible snapshot of a context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextInfo {
    pub id: Uuid,
    pub tags: BTreeSet<String>,
    pub proxy: Option<String>,
    pub persistent: bool,
    pub status: ContextStatus,
    #[serde(with = "humantime_serde")]
    pub created_at: SystemTime,
    pub idle_ms: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub consecutive_errors: u32,
}
