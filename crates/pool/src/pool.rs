//! The context pool orchestrator: admission, selection, assignment, release,
//! recreation and the whole-browser restart protocol.
//!
//! One mutex protects all pool state; selection decisions happen under it.
//! Driver calls (context creation, scrape execution) run without the lock:
//! the chosen context is in `Busy` state, which is the exclusive token, and
//! its driver handle is untouched by anything else. Multiple scrapes execute
//! in parallel on distinct contexts; per context, at most one runs at a
//! time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scraper_pool_common::{rate_limit_domain, PoolConfig, PoolError, ScrapeRequest, ScrapeResult};

use crate::context::{Context, ContextInfo, ContextStatus};
use crate::driver::{BrowserDriver, ContextSpec, DriverError, DriverHandle, PageResult};
use crate::eviction::{find_eviction_candidate, pick_busiest};
use crate::persist::{self, ContextMeta};
use crate::queue::{RequestQueue, Waiter};

/// How often the sweeper expires overdue queued requests. Each waiter also
/// races its own deadline, so this only bounds cleanup of abandoned entries.
const QUEUE_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Relaunch attempts after a browser-level failure, with backoff per
/// attempt.
const RELAUNCH_BACKOFF_SECS: [u64; 3] = [1, 2, 4];

struct PoolState {
    contexts: BTreeMap<Uuid, Context>,
    queue: RequestQueue,
    generation: u64,
    restarting: bool,
    degraded: bool,
    shutting_down: bool,
}

/// Externally visible pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub max_contexts: usize,
    pub available: usize,
    pub busy: usize,
    pub recreating: usize,
    pub queue_depth: usize,
    pub generation: u64,
    pub restarting: bool,
    pub degraded: bool,
}

pub struct ContextPool {
    config: PoolConfig,
    driver: Arc<dyn BrowserDriver>,
    state: Mutex<PoolState>,
    /// Edge-triggered "pool state changed" signal for rate-limit sleepers
    /// and restart watchers.
    changed: Notify,
    in_flight: AtomicUsize,
    /// Back-reference for handing `Arc<Self>` to spawned tasks and leases.
    self_ref: OnceLock<Weak<ContextPool>>,
}

/// Exclusive use of one context for a single scrape. If the caller vanishes
/// at any point while the context is assigned to it (mid-flight, during a
/// residual rate-limit wait, or with a wake-up still sitting unread in its
/// channel) the drop handler returns the context to the pool so the slot is
/// not leaked.
pub(crate) struct Lease {
    pool: Arc<ContextPool>,
    context_id: Uuid,
    handle: DriverHandle,
    generation: u64,
    queue_wait: Duration,
    armed: bool,
}

impl Lease {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pool = self.pool.clone();
        let id = self.context_id;
        let generation = self.generation;
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                let mut state = pool.state.lock().await;
                if state.generation == generation {
                    if let Some(ctx) = state.contexts.get_mut(&id) {
                        if ctx.status == ContextStatus::Busy {
                            debug!(context_id = %id, "caller abandoned scrape; releasing context");
                            ctx.status = ContextStatus::Idle;
                            pool.try_wake(&mut state, id);
                        }
                    }
                }
                drop(state);
                pool.changed.notify_waiters();
            });
        }
    }
}

/// Counts scrapes currently executing in the driver, for shutdown draining.
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Next action decided under the pool lock.
enum Step {
    Dispatch(Lease),
    Create {
        id: Uuid,
        generation: u64,
        spec: ContextSpec,
        evicted_handle: Option<DriverHandle>,
    },
    Enqueue {
        waiter_id: Uuid,
        rx: oneshot::Receiver<Result<Lease, PoolError>>,
    },
    WaitUntil(Instant),
}

impl ContextPool {
    pub fn new(config: PoolConfig, driver: Arc<dyn BrowserDriver>) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            driver,
            state: Mutex::new(PoolState {
                contexts: BTreeMap::new(),
                queue: RequestQueue::new(),
                generation: 0,
                restarting: false,
                degraded: false,
                shutting_down: false,
            }),
            changed: Notify::new(),
            in_flight: AtomicUsize::new(0),
            self_ref: OnceLock::new(),
        });
        pool.self_ref
            .set(Arc::downgrade(&pool))
            .expect("fresh pool has no self reference");
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("pool constructed via ContextPool::new")
    }

    /// Launch the browser, restore persistent contexts recorded on disk and
    /// start the queue sweeper.
    pub async fn start(&self) -> Result<(), PoolError> {
        self.driver
            .launch()
            .await
            .map_err(|e| PoolError::Driver(format!("browser launch failed: {e}")))?;

        let metas = persist::load_all(&self.config.persistent_contexts_path)
            .map_err(|e| PoolError::Driver(format!("failed to scan persistent contexts: {e}")))?;

        for meta in metas {
            {
                let state = self.state.lock().await;
                if state.contexts.len() >= self.config.max_contexts {
                    warn!(
                        context_id = %meta.id,
                        "pool is at capacity; not restoring remaining persistent contexts"
                    );
                    break;
                }
            }
            self.restore_persistent(meta).await;
        }

        let pool = self.self_ref.get().cloned().expect("pool constructed via ContextPool::new");
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(QUEUE_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                let mut state = pool.state.lock().await;
                if state.shutting_down {
                    break;
                }
                let expired = state.queue.expire_due(Instant::now());
                if expired > 0 {
                    debug!(expired, "expired queued requests");
                }
            }
        });

        Ok(())
    }

    async fn restore_persistent(&self, meta: ContextMeta) {
        let storage = persist::storage_dir(&self.config.persistent_contexts_path, meta.id);
        let spec = ContextSpec {
            id: meta.id,
            proxy: meta.proxy.clone(),
            storage_path: Some(storage.clone()),
            tags: meta.tags.clone(),
        };

        match self.driver.new_context(&spec).await {
            Ok(handle) => {
                let mut state = self.state.lock().await;
                let generation = state.generation;
                let mut ctx = Context::new(
                    meta.id,
                    meta.proxy,
                    true,
                    Some(storage),
                    meta.tags,
                    self.config.default_domain_delay,
                    generation,
                );
                ctx.created_at_wall = meta.created_at;
                ctx.install_handle(handle, generation, self.config.default_domain_delay);
                state.contexts.insert(meta.id, ctx);
                info!(context_id = %meta.id, "restored persistent context");
            }
            Err(e) => {
                warn!(context_id = %meta.id, "failed to restore persistent context: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Scraping
    // ------------------------------------------------------------------

    /// Run one scrape: select or wait for an eligible context, dispatch to
    /// the driver, account the outcome.
    pub async fn scrape(&self, request: ScrapeRequest) -> Result<ScrapeResult, PoolError> {
        request.validate()?;
        let domain = rate_limit_domain(&request.url)?;

        let lease = self.acquire(&request, &domain).await?;
        let _guard = InFlightGuard::new(&self.in_flight);

        debug!(
            context_id = %lease.context_id,
            domain = %domain,
            "dispatching scrape"
        );

        let outcome = tokio::time::timeout(
            request.timeout(),
            self.driver.execute(lease.handle, &request),
        )
        .await;

        self.finish(lease, &request, outcome).await
    }

    async fn acquire(
        &self,
        request: &ScrapeRequest,
        domain: &str,
    ) -> Result<Lease, PoolError> {
        let started = Instant::now();
        let queue_deadline = started + self.config.max_queue_wait;

        loop {
            let step = {
                let mut state = self.state.lock().await;
                self.plan_step(&mut state, request, domain, started, queue_deadline)?
            };

            match step {
                Step::Dispatch(lease) => return Ok(lease),

                Step::Create {
                    id,
                    generation,
                    spec,
                    evicted_handle,
                } => {
                    if let Some(handle) = evicted_handle {
                        let _ = self.driver.close_context(handle).await;
                    }
                    // Retry selection whether creation succeeded or not;
                    // failures surface as errors from create_in_driver.
                    self.create_in_driver(id, generation, spec).await?;
                }

                Step::Enqueue { waiter_id, rx } => {
                    // Dropping `rx` (timeout or caller abort) also drops any
                    // lease still buffered in the channel; its guard returns
                    // the context to the pool.
                    match tokio::time::timeout_at(queue_deadline, rx).await {
                        Err(_) => {
                            let mut state = self.state.lock().await;
                            state.queue.cancel(waiter_id);
                            return Err(PoolError::QueueTimeout(self.config.max_queue_wait));
                        }
                        // Waiter entry vanished without a verdict (e.g. a
                        // racing sweep); go around again.
                        Ok(Err(_)) => continue,
                        Ok(Ok(Err(e))) => return Err(e),
                        Ok(Ok(Ok(lease))) => {
                            return self.complete_wake(request, domain, lease, queue_deadline).await;
                        }
                    }
                }

                Step::WaitUntil(until) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(until) => {}
                        _ = self.changed.notified() => {}
                    }
                }
            }
        }
    }

    /// One round of the selection algorithm, executed atomically under the
    /// pool lock.
    fn plan_step(
        &self,
        state: &mut PoolState,
        request: &ScrapeRequest,
        domain: &str,
        started: Instant,
        queue_deadline: Instant,
    ) -> Result<Step, PoolError> {
        if state.shutting_down {
            return Err(PoolError::Shutdown);
        }
        if state.degraded {
            return Err(PoolError::BrowserUnavailable);
        }

        let now = Instant::now();

        let candidate_ids: Vec<Uuid> = state
            .contexts
            .values()
            .filter(|c| {
                c.status == ContextStatus::Idle
                    && c.generation == state.generation
                    && c.handle.is_some()
                    && c.has_tags(&request.required_tags)
            })
            .map(|c| c.id)
            .collect();

        if !candidate_ids.is_empty() {
            let mut ready = Vec::new();
            let mut earliest: Option<Instant> = None;

            for id in &candidate_ids {
                let next = state.contexts[id].limiter.next_available(domain);
                if next <= now {
                    ready.push(*id);
                } else {
                    earliest = Some(earliest.map_or(next, |e| e.min(next)));
                }
            }

            if !ready.is_empty() {
                let best = pick_busiest(ready.iter().map(|id| &state.contexts[id]), now)
                    .expect("ready set is non-empty");
                return Ok(Step::Dispatch(self.dispatch(state, best, request, domain, started)));
            }

            // Every candidate is rate-limited for this domain: sleep until
            // the earliest becomes available or the pool changes shape.
            if now >= queue_deadline {
                return Err(PoolError::QueueTimeout(self.config.max_queue_wait));
            }
            let until = earliest.expect("non-ready candidates exist").min(queue_deadline);
            return Ok(Step::WaitUntil(until));
        }

        // No eligible context. Mint one if there is room.
        if !state.restarting && state.contexts.len() < self.config.max_contexts {
            return Ok(self.plan_create(state, request, None));
        }

        // Full pool. A request that pins a proxy needs a dedicated context,
        // so make room by evicting the least valuable idle context; a plain
        // request queues instead.
        if !state.restarting && request.proxy.is_some() {
            if let Some(victim_id) = find_eviction_candidate(state.contexts.values(), now) {
                let victim = state
                    .contexts
                    .remove(&victim_id)
                    .expect("eviction candidate exists");
                info!(
                    context_id = %victim_id,
                    "evicting idle context to make room for a dedicated-proxy request"
                );
                if victim.persistent {
                    self.forget_persistent(victim_id);
                }
                return Ok(self.plan_create(state, request, victim.handle));
            }
        }

        if state.queue.len() + state.contexts.len() >= self.config.queue_cap() {
            return Err(PoolError::PoolFull);
        }

        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            id: Uuid::new_v4(),
            required_tags: request.required_tags.clone(),
            enqueued_at: started,
            deadline: queue_deadline,
            tx,
        };
        let waiter_id = waiter.id;
        state.queue.push(waiter);
        debug!(waiter_id = %waiter_id, tags = ?request.required_tags, "queued request");
        Ok(Step::Enqueue { waiter_id, rx })
    }

    /// Assign `id` to the current request and mark its rate limiter.
    fn dispatch(
        &self,
        state: &mut PoolState,
        id: Uuid,
        request: &ScrapeRequest,
        domain: &str,
        started: Instant,
    ) -> Lease {
        let generation = state.generation;
        let ctx = state.contexts.get_mut(&id).expect("selected context exists");
        ctx.assign();
        ctx.limiter.mark_used(domain, request.domain_delay());
        ctx.total_requests += 1;
        let handle = ctx.handle.expect("idle context has a handle");

        Lease {
            pool: self.arc(),
            context_id: id,
            handle,
            generation,
            queue_wait: started.elapsed(),
            armed: true,
        }
    }

    /// Insert a placeholder (recreating, occupies a slot) and describe the
    /// driver work needed to finish it.
    fn plan_create(
        &self,
        state: &mut PoolState,
        request: &ScrapeRequest,
        evicted_handle: Option<DriverHandle>,
    ) -> Step {
        let id = Uuid::new_v4();
        let mut tags = request.required_tags.clone();
        if let Some(proxy) = &request.proxy {
            tags.insert(format!("proxy:{proxy}"));
        }
        let storage_path = request
            .persistent
            .then(|| persist::storage_dir(&self.config.persistent_contexts_path, id));

        let ctx = Context::new(
            id,
            request.proxy.clone(),
            request.persistent,
            storage_path,
            tags,
            self.config.default_domain_delay,
            state.generation,
        );
        let spec = ctx.spec();
        let generation = state.generation;
        state.contexts.insert(id, ctx);

        info!(
            context_id = %id,
            total = state.contexts.len(),
            max = self.config.max_contexts,
            "creating context on demand"
        );

        Step::Create {
            id,
            generation,
            spec,
            evicted_handle,
        }
    }

    /// Drive a planned creation to completion: call the driver without the
    /// lock, then finalize or roll back the placeholder.
    async fn create_in_driver(
        &self,
        id: Uuid,
        generation: u64,
        spec: ContextSpec,
    ) -> Result<(), PoolError> {
        match self.driver.new_context(&spec).await {
            Ok(handle) => {
                let persistent = spec.storage_path.is_some();
                let mut state = self.state.lock().await;
                if state.generation != generation || state.shutting_down {
                    state.contexts.remove(&id);
                    let shutting_down = state.shutting_down;
                    drop(state);
                    let _ = self.driver.close_context(handle).await;
                    return if shutting_down {
                        Err(PoolError::Shutdown)
                    } else {
                        Err(PoolError::BrowserRestarting)
                    };
                }
                let Some(ctx) = state.contexts.get_mut(&id) else {
                    drop(state);
                    let _ = self.driver.close_context(handle).await;
                    return Ok(());
                };
                ctx.install_handle(handle, generation, self.config.default_domain_delay);
                let meta = persistent.then(|| self.meta_for(ctx));
                self.try_wake(&mut state, id);
                drop(state);

                if let Some(meta) = meta {
                    self.write_meta(&meta);
                }
                self.changed.notify_waiters();
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.contexts.remove(&id);
                let target_closed = e.is_target_closed();
                if target_closed {
                    self.trigger_restart(&mut state, false);
                }
                drop(state);
                self.changed.notify_waiters();
                warn!(context_id = %id, "context creation failed: {e}");
                if target_closed {
                    Err(PoolError::TargetClosed(e.to_string()))
                } else {
                    Err(PoolError::Driver(e.to_string()))
                }
            }
        }
    }

    /// A queued waiter was paired with a context that is already assigned to
    /// it and arrived holding the armed lease. Absorb any residual
    /// rate-limit delay, bounded by the queue deadline, then mark and go.
    /// Every early return drops the lease, whose guard releases the context.
    async fn complete_wake(
        &self,
        request: &ScrapeRequest,
        domain: &str,
        mut lease: Lease,
        queue_deadline: Instant,
    ) -> Result<Lease, PoolError> {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return Err(PoolError::Shutdown);
                }
                if state.generation != lease.generation {
                    lease.disarm();
                    return Err(PoolError::BrowserRestarting);
                }
                let Some(ctx) = state.contexts.get_mut(&lease.context_id) else {
                    lease.disarm();
                    return Err(PoolError::BrowserRestarting);
                };

                let next = ctx.limiter.next_available(domain);
                if next <= Instant::now() {
                    ctx.last_used_at = Instant::now();
                    ctx.limiter.mark_used(domain, request.domain_delay());
                    ctx.total_requests += 1;
                    return Ok(lease);
                }
                next
            };

            if Instant::now() >= queue_deadline {
                return Err(PoolError::QueueTimeout(self.config.max_queue_wait));
            }
            tokio::time::sleep_until(next.min(queue_deadline)).await;
        }
    }

    /// Account the outcome of one scrape and hand the context onward.
    async fn finish(
        &self,
        mut lease: Lease,
        request: &ScrapeRequest,
        outcome: Result<Result<PageResult, DriverError>, tokio::time::error::Elapsed>,
    ) -> Result<ScrapeResult, PoolError> {
        lease.disarm();
        let mut state = self.state.lock().await;

        // A whole-browser restart happened while we were in flight; the
        // result cannot be trusted and the handle is already gone.
        if state.generation != lease.generation {
            return Err(PoolError::BrowserRestarting);
        }

        match outcome {
            Ok(Ok(page)) => {
                if let Some(ctx) = state.contexts.get_mut(&lease.context_id) {
                    ctx.consecutive_errors = 0;
                    ctx.status = ContextStatus::Idle;
                    self.try_wake(&mut state, lease.context_id);
                }
                drop(state);
                self.changed.notify_waiters();

                let url = if page.url.is_empty() {
                    request.url.clone()
                } else {
                    page.url
                };
                Ok(ScrapeResult {
                    success: true,
                    url,
                    status: page.status,
                    content: page.content,
                    script_result: page.script_result,
                    screenshot: page.screenshot,
                    context_id: lease.context_id,
                    queue_wait_ms: lease.queue_wait.as_millis() as u64,
                    error: None,
                })
            }

            Ok(Err(e)) if e.is_target_closed() => {
                warn!(context_id = %lease.context_id, "scrape hit a dead browser target: {e}");
                self.record_error(&mut state, lease.context_id);
                self.trigger_restart(&mut state, false);
                Err(PoolError::TargetClosed(e.to_string()))
            }

            Ok(Err(e)) => {
                let recreate = self.record_error(&mut state, lease.context_id);
                drop(state);
                self.changed.notify_waiters();
                if recreate {
                    self.spawn_recreate(lease.context_id);
                }
                Err(PoolError::Driver(e.to_string()))
            }

            Err(_elapsed) => {
                let recreate = self.record_error(&mut state, lease.context_id);
                drop(state);
                self.changed.notify_waiters();
                if recreate {
                    self.spawn_recreate(lease.context_id);
                }
                Err(PoolError::ScrapeTimeout(request.timeout()))
            }
        }
    }

    /// Returns true when the context crossed the consecutive-error threshold
    /// and must be recreated.
    fn record_error(&self, state: &mut PoolState, id: Uuid) -> bool {
        let max_consecutive = self.config.max_consecutive_errors;
        let threshold = {
            let Some(ctx) = state.contexts.get_mut(&id) else {
                return false;
            };
            ctx.consecutive_errors += 1;
            ctx.total_errors += 1;

            if ctx.consecutive_errors >= max_consecutive {
                info!(
                    context_id = %id,
                    consecutive_errors = ctx.consecutive_errors,
                    "error threshold reached; scheduling recreation"
                );
                ctx.status = ContextStatus::Recreating;
                true
            } else {
                ctx.status = ContextStatus::Idle;
                false
            }
        };

        if !threshold {
            self.try_wake(state, id);
        }
        threshold
    }

    fn spawn_recreate(&self, id: Uuid) {
        let pool = self.arc();
        tokio::spawn(async move {
            pool.recreate_context(id).await;
        });
    }

    /// Tear down and rebuild one context in place: same id, same tags, same
    /// proxy and persistence, fresh driver handle, empty rate-limit table.
    async fn recreate_context(self: Arc<Self>, id: Uuid) {
        let (spec, old_handle, generation) = {
            let state = self.state.lock().await;
            let Some(ctx) = state.contexts.get(&id) else { return };
            if ctx.status != ContextStatus::Recreating {
                return;
            }
            (ctx.spec(), ctx.handle, state.generation)
        };

        info!(context_id = %id, "recreating context");
        if let Some(handle) = old_handle {
            let _ = self.driver.close_context(handle).await;
        }

        match self.driver.new_context(&spec).await {
            Ok(handle) => {
                let mut state = self.state.lock().await;
                if state.generation != generation {
                    drop(state);
                    let _ = self.driver.close_context(handle).await;
                    return;
                }
                match state.contexts.get_mut(&id) {
                    Some(ctx) => {
                        ctx.install_handle(handle, generation, self.config.default_domain_delay);
                        self.try_wake(&mut state, id);
                        drop(state);
                        self.changed.notify_waiters();
                    }
                    None => {
                        drop(state);
                        let _ = self.driver.close_context(handle).await;
                    }
                }
            }
            Err(e) => {
                warn!(context_id = %id, "recreation failed; freeing the slot: {e}");
                let mut state = self.state.lock().await;
                state.contexts.remove(&id);
                if e.is_target_closed() {
                    self.trigger_restart(&mut state, false);
                }
                drop(state);
                self.changed.notify_waiters();
            }
        }
    }

    /// Pair a freshly idle context with the first queued waiter whose tag
    /// constraints it satisfies. The context is assigned on the waiter's
    /// behalf and handed over as an armed lease, so a waiter that has
    /// already vanished, or vanishes with the wake still unread in its
    /// channel, cannot strand the context in the busy state.
    fn try_wake(&self, state: &mut PoolState, id: Uuid) {
        loop {
            let Some(ctx) = state.contexts.get(&id) else { return };
            if ctx.status != ContextStatus::Idle || ctx.generation != state.generation {
                return;
            }
            let tags = ctx.tags.clone();
            let Some(waiter) = state.queue.take_match(&tags) else {
                return;
            };

            let generation = state.generation;
            let ctx = state.contexts.get_mut(&id).expect("context still present");
            let Some(handle) = ctx.handle else { return };
            ctx.assign();

            let lease = Lease {
                pool: self.arc(),
                context_id: id,
                handle,
                generation,
                queue_wait: waiter.enqueued_at.elapsed(),
                armed: true,
            };

            if let Err(rejected) = waiter.tx.send(Ok(lease)) {
                // Receiver already gone; take the lease back, disarm it and
                // keep scanning.
                if let Ok(mut lease) = rejected {
                    lease.disarm();
                }
                let ctx = state.contexts.get_mut(&id).expect("context still present");
                ctx.status = ContextStatus::Idle;
                continue;
            }
            debug!(context_id = %id, waiter_id = %waiter.id, "woke queued request");
            return;
        }
    }

    // ------------------------------------------------------------------
    // Whole-browser restart
    // ------------------------------------------------------------------

    /// Begin the restart protocol. `force` restarts even a degraded pool
    /// (the out-of-band recovery path).
    fn trigger_restart(&self, state: &mut PoolState, force: bool) {
        if state.restarting || state.shutting_down {
            return;
        }
        if state.degraded && !force {
            return;
        }

        state.restarting = true;
        state.degraded = false;
        state.generation += 1;
        warn!(
            generation = state.generation,
            "restarting browser process; transient contexts will be dropped"
        );

        // Transient contexts die with the browser. Persistent ones become
        // placeholders until the relaunch rebuilds them.
        state.contexts.retain(|_, c| c.persistent);
        for ctx in state.contexts.values_mut() {
            ctx.status = ContextStatus::Recreating;
            ctx.handle = None;
        }

        let pool = self.arc();
        tokio::spawn(async move {
            pool.run_restart().await;
        });
    }

    async fn run_restart(self: Arc<Self>) {
        let _ = self.driver.shutdown().await;

        let mut relaunched = false;
        for (attempt, backoff) in RELAUNCH_BACKOFF_SECS.iter().enumerate() {
            match self.driver.launch().await {
                Ok(()) => {
                    relaunched = true;
                    break;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, "browser relaunch failed: {e}");
                    tokio::time::sleep(Duration::from_secs(*backoff)).await;
                }
            }
        }

        if !relaunched {
            let mut state = self.state.lock().await;
            state.degraded = true;
            state.restarting = false;
            let failed = state.queue.fail_all(|| PoolError::BrowserUnavailable);
            drop(state);
            self.changed.notify_waiters();
            error!(
                failed_waiters = failed,
                "browser could not be relaunched; pool is degraded until an explicit restart"
            );
            return;
        }

        // Rebuild persistent contexts under the new generation, same ids.
        let (generation, specs) = {
            let state = self.state.lock().await;
            let specs: Vec<ContextSpec> = state.contexts.values().map(|c| c.spec()).collect();
            (state.generation, specs)
        };

        for spec in specs {
            match self.driver.new_context(&spec).await {
                Ok(handle) => {
                    let mut state = self.state.lock().await;
                    if state.generation != generation {
                        drop(state);
                        let _ = self.driver.close_context(handle).await;
                        return;
                    }
                    match state.contexts.get_mut(&spec.id) {
                        Some(ctx) => {
                            ctx.install_handle(handle, generation, self.config.default_domain_delay);
                            self.try_wake(&mut state, spec.id);
                        }
                        None => {
                            drop(state);
                            let _ = self.driver.close_context(handle).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(context_id = %spec.id, "failed to rebuild persistent context: {e}");
                    let mut state = self.state.lock().await;
                    state.contexts.remove(&spec.id);
                }
            }
        }

        let mut state = self.state.lock().await;
        state.restarting = false;
        info!(
            generation = state.generation,
            contexts = state.contexts.len(),
            "browser restart complete"
        );
        drop(state);
        self.changed.notify_waiters();
    }

    /// Explicitly restart the browser and wait for the protocol to finish.
    /// Also the recovery path out of the degraded state.
    pub async fn restart_browser(&self) -> Result<(), PoolError> {
        {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return Err(PoolError::Shutdown);
            }
            self.trigger_restart(&mut state, true);
        }

        loop {
            {
                let state = self.state.lock().await;
                if !state.restarting {
                    return if state.degraded {
                        Err(PoolError::BrowserUnavailable)
                    } else {
                        Ok(())
                    };
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // ------------------------------------------------------------------
    // Context management
    // ------------------------------------------------------------------

    /// Explicitly create a context. On a full pool the least valuable idle
    /// context is evicted first; with nothing evictable this fails.
    pub async fn create_context(
        &self,
        proxy: Option<String>,
        persistent: bool,
        tags: BTreeSet<String>,
    ) -> Result<ContextInfo, PoolError> {
        let (id, generation, spec, evicted_handle) = {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return Err(PoolError::Shutdown);
            }
            if state.degraded {
                return Err(PoolError::BrowserUnavailable);
            }
            if state.restarting {
                return Err(PoolError::BrowserRestarting);
            }

            let mut evicted_handle = None;
            if state.contexts.len() >= self.config.max_contexts {
                let victim_id = find_eviction_candidate(state.contexts.values(), Instant::now())
                    .ok_or(PoolError::PoolFull)?;
                let victim = state
                    .contexts
                    .remove(&victim_id)
                    .expect("eviction candidate exists");
                info!(context_id = %victim_id, "evicting idle context to make room");
                if victim.persistent {
                    self.forget_persistent(victim_id);
                }
                evicted_handle = victim.handle;
            }

            let id = Uuid::new_v4();
            let mut tags = tags;
            if let Some(proxy) = &proxy {
                tags.insert(format!("proxy:{proxy}"));
            }
            let storage_path = persistent
                .then(|| persist::storage_dir(&self.config.persistent_contexts_path, id));
            let ctx = Context::new(
                id,
                proxy,
                persistent,
                storage_path,
                tags,
                self.config.default_domain_delay,
                state.generation,
            );
            let spec = ctx.spec();
            let generation = state.generation;
            state.contexts.insert(id, ctx);
            (id, generation, spec, evicted_handle)
        };

        if let Some(handle) = evicted_handle {
            let _ = self.driver.close_context(handle).await;
        }

        self.create_in_driver(id, generation, spec).await?;

        let state = self.state.lock().await;
        state
            .contexts
            .get(&id)
            .map(|c| c.info())
            .ok_or_else(|| PoolError::ContextNotFound(id.to_string()))
    }

    /// Destroy a context. Idempotent: removing an unknown id reports
    /// `Ok(false)` rather than an error. Persistent storage directories are
    /// preserved; the meta file is removed so the context is not
    /// reconstructed on the next start.
    pub async fn remove_context(&self, id: Uuid) -> Result<bool, PoolError> {
        let (handle, persistent) = {
            let mut state = self.state.lock().await;
            match state.contexts.get(&id) {
                None => return Ok(false),
                Some(ctx)
                    if matches!(ctx.status, ContextStatus::Busy | ContextStatus::Recreating) =>
                {
                    return Err(PoolError::ContextBusy);
                }
                Some(_) => {}
            }
            let ctx = state.contexts.remove(&id).expect("checked above");
            (ctx.handle, ctx.persistent)
        };

        if persistent {
            self.forget_persistent(id);
        }
        if let Some(handle) = handle {
            let _ = self.driver.close_context(handle).await;
        }

        info!(context_id = %id, "destroyed context");
        self.changed.notify_waiters();
        Ok(true)
    }

    pub async fn add_tags(
        &self,
        id: Uuid,
        tags: impl IntoIterator<Item = String>,
    ) -> Result<ContextInfo, PoolError> {
        let (info, meta) = {
            let mut state = self.state.lock().await;
            let ctx = state
                .contexts
                .get_mut(&id)
                .ok_or_else(|| PoolError::ContextNotFound(id.to_string()))?;
            ctx.tags.extend(tags);
            let info = ctx.info();
            let meta = ctx.persistent.then(|| self.meta_for(ctx));
            // New tags may satisfy queued waiters.
            self.try_wake(&mut state, id);
            (info, meta)
        };

        if let Some(meta) = meta {
            self.write_meta(&meta);
        }
        self.changed.notify_waiters();
        Ok(info)
    }

    pub async fn remove_tags(
        &self,
        id: Uuid,
        tags: impl IntoIterator<Item = String>,
    ) -> Result<ContextInfo, PoolError> {
        let (info, meta) = {
            let mut state = self.state.lock().await;
            let ctx = state
                .contexts
                .get_mut(&id)
                .ok_or_else(|| PoolError::ContextNotFound(id.to_string()))?;
            for tag in tags {
                ctx.tags.remove(&tag);
            }
            let info = ctx.info();
            let meta = ctx.persistent.then(|| self.meta_for(ctx));
            (info, meta)
        };

        if let Some(meta) = meta {
            self.write_meta(&meta);
        }
        Ok(info)
    }

    pub async fn get_context(&self, id: Uuid) -> Option<ContextInfo> {
        let state = self.state.lock().await;
        state.contexts.get(&id).map(|c| c.info())
    }

    /// All contexts, sorted by id.
    pub async fn list_contexts(&self) -> Vec<ContextInfo> {
        let state = self.state.lock().await;
        state.contexts.values().map(|c| c.info()).collect()
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let mut available = 0;
        let mut busy = 0;
        let mut recreating = 0;
        for ctx in state.contexts.values() {
            match ctx.status {
                ContextStatus::Idle => available += 1,
                ContextStatus::Busy => busy += 1,
                ContextStatus::Recreating => recreating += 1,
                ContextStatus::Destroyed => {}
            }
        }

        PoolStatus {
            size: state.contexts.len(),
            max_contexts: self.config.max_contexts,
            available,
            busy,
            recreating,
            queue_depth: state.queue.len(),
            generation: state.generation,
            restarting: state.restarting,
            degraded: state.degraded,
        }
    }

    /// Stop accepting work, cancel waiters, drain in-flight scrapes up to
    /// the grace period, then force the driver down.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            let cancelled = state.queue.fail_all(|| PoolError::Shutdown);
            if cancelled > 0 {
                info!(cancelled, "cancelled queued requests for shutdown");
            }
        }
        self.changed.notify_waiters();

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "grace period elapsed; forcing driver shutdown");
        }
        let _ = self.driver.shutdown().await;
        info!("pool shutdown complete");
    }

    // ------------------------------------------------------------------
    // Persistence helpers
    // ------------------------------------------------------------------

    fn meta_for(&self, ctx: &Context) -> ContextMeta {
        ContextMeta {
            id: ctx.id,
            proxy: ctx.proxy.clone(),
            tags: ctx.tags.clone(),
            created_at: ctx.created_at_wall,
        }
    }

    fn write_meta(&self, meta: &ContextMeta) {
        if let Err(e) = persist::write_meta(&self.config.persistent_contexts_path, meta) {
            warn!(context_id = %meta.id, "failed to write context meta: {e}");
        }
    }

    fn forget_persistent(&self, id: Uuid) {
        if let Err(e) = persist::remove_meta(&self.config.persistent_contexts_path, id) {
            warn!(context_id = %id, "failed to remove context meta: {e}");
        }
    }
}
