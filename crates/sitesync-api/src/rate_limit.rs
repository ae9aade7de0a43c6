//! Per-client request budgets for the sync endpoints.
//!
//! Each client id owns one budget record holding a counter per endpoint; the
//! window restarts on the first request after it elapses.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Budgets tracked before expired ones are swept
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEndpoint {
    Batch,
    Changes,
}

impl SyncEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Batch => "sync_batch",
            Self::Changes => "sync_changes",
        }
    }
}

/// Requests one client made in its current window
#[derive(Debug, Clone, Copy)]
struct ClientBudget {
    window_start: Instant,
    batch: u32,
    changes: u32,
}

impl ClientBudget {
    const fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            batch: 0,
            changes: 0,
        }
    }

    fn used(&mut self, endpoint: SyncEndpoint) -> &mut u32 {
        match endpoint {
            SyncEndpoint::Batch => &mut self.batch,
            SyncEndpoint::Changes => &mut self.changes,
        }
    }
}

#[derive(Default)]
struct Outcomes {
    allowed: AtomicU64,
    limited: AtomicU64,
}

impl Outcomes {
    fn record(&self, allowed: bool) {
        let counter = if allowed { &self.allowed } else { &self.limited };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Allowed/limited totals since startup, served on `/healthz`
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitMetricsSnapshot {
    pub batch_allowed: u64,
    pub batch_limited: u64,
    pub changes_allowed: u64,
    pub changes_limited: u64,
}

/// Fixed-window limiter keyed by the `x-client-id` of the caller
#[derive(Clone)]
pub struct EndpointRateLimiter {
    budgets: Arc<Mutex<HashMap<String, ClientBudget>>>,
    window: Duration,
    batch_limit: u32,
    changes_limit: u32,
    batch: Arc<Outcomes>,
    changes: Arc<Outcomes>,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.batch_rate_limit_per_window,
            config.changes_rate_limit_per_window,
        )
    }

    fn new(window: Duration, batch_limit: u32, changes_limit: u32) -> Self {
        Self {
            budgets: Arc::new(Mutex::new(HashMap::new())),
            window,
            batch_limit,
            changes_limit,
            batch: Arc::new(Outcomes::default()),
            changes: Arc::new(Outcomes::default()),
        }
    }

    /// Charge one request to the client's budget for `endpoint`.
    pub async fn check(&self, endpoint: SyncEndpoint, client_id: &str) -> Result<(), AppError> {
        let now = Instant::now();
        let mut budgets = self.budgets.lock().await;
        if budgets.len() >= SWEEP_THRESHOLD && !budgets.contains_key(client_id) {
            budgets.retain(|_, budget| now.duration_since(budget.window_start) < self.window);
        }

        let budget = budgets
            .entry(client_id.to_string())
            .or_insert_with(|| ClientBudget::fresh(now));
        if now.duration_since(budget.window_start) >= self.window {
            *budget = ClientBudget::fresh(now);
        }
        let window_start = budget.window_start;

        let used = budget.used(endpoint);
        let allowed = *used < self.limit(endpoint);
        if allowed {
            *used += 1;
        }
        drop(budgets);
        self.outcomes(endpoint).record(allowed);

        if allowed {
            return Ok(());
        }
        let remaining = self.window.saturating_sub(now.duration_since(window_start));
        let retry_after_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        tracing::warn!(
            endpoint = endpoint.label(),
            client = client_fingerprint(client_id),
            retry_after_secs,
            "Rate limit exceeded"
        );
        Err(AppError::too_many_requests(
            format!("rate limit exceeded for {}", endpoint.label()),
            retry_after_secs,
        ))
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            batch_allowed: self.batch.allowed.load(Ordering::Relaxed),
            batch_limited: self.batch.limited.load(Ordering::Relaxed),
            changes_allowed: self.changes.allowed.load(Ordering::Relaxed),
            changes_limited: self.changes.limited.load(Ordering::Relaxed),
        }
    }

    const fn limit(&self, endpoint: SyncEndpoint) -> u32 {
        match endpoint {
            SyncEndpoint::Batch => self.batch_limit,
            SyncEndpoint::Changes => self.changes_limit,
        }
    }

    fn outcomes(&self, endpoint: SyncEndpoint) -> &Outcomes {
        match endpoint {
            SyncEndpoint::Batch => &self.batch,
            SyncEndpoint::Changes => &self.changes,
        }
    }
}

/// Stable log-safe stand-in for a client id
pub fn client_fingerprint(client_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    client_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn each_client_has_its_own_budget_per_endpoint() {
        let limiter = EndpointRateLimiter::new(Duration::from_secs(60), 2, 1);

        limiter.check(SyncEndpoint::Batch, "client-a").await.unwrap();
        limiter.check(SyncEndpoint::Batch, "client-a").await.unwrap();
        let err = limiter
            .check(SyncEndpoint::Batch, "client-a")
            .await
            .unwrap_err();
        match err {
            AppError::TooManyRequests(_, retry_after) => assert!((1..=60).contains(&retry_after)),
            other => panic!("expected a rate limit error, got {other:?}"),
        }

        limiter.check(SyncEndpoint::Batch, "client-b").await.unwrap();
        limiter.check(SyncEndpoint::Changes, "client-a").await.unwrap();
        assert!(limiter
            .check(SyncEndpoint::Changes, "client-a")
            .await
            .is_err());

        let metrics = limiter.metrics_snapshot();
        assert_eq!(metrics.batch_allowed, 3);
        assert_eq!(metrics.batch_limited, 1);
        assert_eq!(metrics.changes_allowed, 1);
        assert_eq!(metrics.changes_limited, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn budget_refills_after_the_window() {
        let limiter = EndpointRateLimiter::new(Duration::from_millis(40), 1, 1);

        limiter.check(SyncEndpoint::Batch, "client-a").await.unwrap();
        assert!(limiter.check(SyncEndpoint::Batch, "client-a").await.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        limiter.check(SyncEndpoint::Batch, "client-a").await.unwrap();
    }
}
