//! Eviction scoring: which idle context to sacrifice when room must be made.
//!
//! Lower score = more evictable. Protected contexts score infinity and are
//! never candidates; busy and recreating contexts are not candidates at all.
//! The same score, inverted, drives selection among ready candidates ("best
//! to keep is best to use").

use tokio::time::Instant;
use uuid::Uuid;

use crate::context::{Context, ContextStatus};

/// Weight of idle time: each idle second costs this much score.
const IDLE_WEIGHT: f64 = 0.01;

/// Weight of consecutive errors.
const ERROR_WEIGHT: f64 = 0.5;

/// Score one context. Monotonically increasing in `total_requests`
/// (investment bias), decreasing in idle time and consecutive errors.
pub(crate) fn eviction_score(ctx: &Context, now: Instant) -> f64 {
    if ctx.is_protected() {
        return f64::INFINITY;
    }

    let idle_seconds = now.saturating_duration_since(ctx.last_used_at).as_secs_f64();

    (1.0 + ctx.total_requests as f64).ln()
        - IDLE_WEIGHT * idle_seconds
        - ERROR_WEIGHT * f64::from(ctx.consecutive_errors)
}

/// Pick the idle context to evict: lowest score, ties broken by keeping the
/// younger context (the older one is evicted). Returns None when nothing is
/// evictable.
pub(crate) fn find_eviction_candidate<'a, I>(contexts: I, now: Instant) -> Option<Uuid>
where
    I: Iterator<Item = &'a Context>,
{
    let mut best: Option<(&Context, f64)> = None;

    for ctx in contexts {
        if ctx.status != ContextStatus::Idle || ctx.is_protected() {
            continue;
        }

        let score = eviction_score(ctx, now);
        let replace = match best {
            None => true,
            Some((cur, cur_score)) => {
                score < cur_score || (score == cur_score && ctx.created_at < cur.created_at)
            }
        };
        if replace {
            best = Some((ctx, score));
        }
    }

    best.map(|(ctx, _)| ctx.id)
}

/// Pick the best ready candidate to serve a request: highest score, ties
/// broken by the oldest `last_used_at` to spread load.
pub(crate) fn pick_busiest<'a, I>(candidates: I, now: Instant) -> Option<Uuid>
where
    I: Iterator<Item = &'a Context>,
{
    let mut best: Option<(&Context, f64)> = None;

    for ctx in candidates {
        let score = eviction_score(ctx, now);
        let replace = match best {
            None => true,
            Some((cur, cur_score)) => {
                score > cur_score || (score == cur_score && ctx.last_used_at < cur.last_used_at)
            }
        };
        if replace {
            best = Some((ctx, score));
        }
    }

    best.map(|(ctx, _)| ctx.id)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::context::PROTECTED_TAG;

    fn ctx(tags: &[&str]) -> Context {
        let mut c = Context::new(
            Uuid::new_v4(),
            None,
            false,
            None,
            tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            Duration::from_millis(1000),
            0,
        );
        c.status = ContextStatus::Idle;
        c
    }

    #[tokio::test]
    async fn protected_scores_infinity() {
        let c = ctx(&[PROTECTED_TAG]);
        assert_eq!(eviction_score(&c, Instant::now()), f64::INFINITY);
    }

    #[tokio::test]
    async fn warm_context_outscores_cold_one() {
        let now = Instant::now();
        let mut warm = ctx(&[]);
        warm.total_requests = 500;
        let cold = ctx(&[]);

        assert!(eviction_score(&warm, now) > eviction_score(&cold, now));
    }

    #[tokio::test]
    async fn errors_lower_the_score() {
        let now = Instant::now();
        let healthy = ctx(&[]);
        let mut flaky = ctx(&[]);
        flaky.consecutive_errors = 4;

        assert!(eviction_score(&flaky, now) < eviction_score(&healthy, now));
    }

    #[tokio::test]
    async fn idle_time_lowers_the_score() {
        let now = Instant::now();
        let mut stale = ctx(&[]);
        stale.last_used_at = now - Duration::from_secs(600);
        let fresh = ctx(&[]);

        assert!(eviction_score(&stale, now) < eviction_score(&fresh, now));
    }

    #[tokio::test]
    async fn eviction_never_picks_protected_or_busy() {
        let now = Instant::now();
        let protected = ctx(&[PROTECTED_TAG]);
        let mut busy = ctx(&[]);
        busy.status = ContextStatus::Busy;
        let mut victim = ctx(&[]);
        victim.total_requests = 100;

        let contexts = [protected, busy, victim];
        let picked = find_eviction_candidate(contexts.iter(), now).unwrap();
        assert_eq!(picked, contexts[2].id);
    }

    #[tokio::test]
    async fn eviction_tie_break_keeps_the_younger() {
        let now = Instant::now();
        let mut older = ctx(&[]);
        older.created_at = now - Duration::from_secs(100);
        older.last_used_at = now;
        let mut younger = ctx(&[]);
        younger.last_used_at = now;

        let contexts = [younger, older];
        let picked = find_eviction_candidate(contexts.iter(), now).unwrap();
        assert_eq!(picked, contexts[1].id);
    }

    #[tokio::test]
    async fn selection_prefers_the_invested_context() {
        let now = Instant::now();
        let mut warm = ctx(&[]);
        warm.total_requests = 50;
        let cold = ctx(&[]);

        let contexts = [cold, warm];
        let picked = pick_busiest(contexts.iter(), now).unwrap();
        assert_eq!(picked, contexts[1].id);
    }
}
