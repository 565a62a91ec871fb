//! Distributed stats store
//!
//! When several gateway replicas must agree on load and cooldown, the
//! per-deployment counters live in a shared store behind the
//! [`StatsBackend`] contract. Counters need at-least-once observation,
//! not exactness: strategies tolerate small skew. EWMA updates use a
//! compare-and-swap loop; minute counters are keyed by
//! `{deployment_id}:{minute_key}` with hash-tag braces so the window and
//! its counter land on the same shard.

use super::stats::{DeploymentStats, HISTORY_SIZE, StatsStore, minute_key};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Atomic primitives expected from a shared key/value store
///
/// The production backend is an external store with scripted atomic
/// operations; tests and single-node setups use [`InMemoryStatsBackend`].
#[async_trait]
pub trait StatsBackend: Send + Sync + fmt::Debug {
    /// Atomically add `by` and return the new value
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;

    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<f64>>;

    /// Write a value unconditionally
    async fn set(&self, key: &str, value: f64) -> Result<()>;

    /// Write `new` only when the current value equals `expected`
    async fn compare_and_swap(&self, key: &str, expected: Option<f64>, new: f64) -> Result<bool>;

    /// Attach a time-to-live to a key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// In-memory backend: one mutex-guarded map
///
/// Shared via `Arc` it stands in for an external store in tests, letting
/// several gateway instances observe one set of counters.
#[derive(Debug, Default)]
pub struct InMemoryStatsBackend {
    values: Mutex<HashMap<String, f64>>,
}

impl InMemoryStatsBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatsBackend for InMemoryStatsBackend {
    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut values = self.values.lock();
        let entry = values.entry(key.to_string()).or_insert(0.0);
        *entry += by as f64;
        Ok(*entry as i64)
    }

    async fn get(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.values.lock().get(key).copied())
    }

    async fn set(&self, key: &str, value: f64) -> Result<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<f64>, new: f64) -> Result<bool> {
        let mut values = self.values.lock();
        let current = values.get(key).copied();
        let matches = match (current, expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => (current - expected).abs() < f64::EPSILON,
            _ => false,
        };
        if matches {
            values.insert(key.to_string(), new);
        }
        Ok(matches)
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
        // TTL is a storage concern; the in-memory stand-in never expires.
        Ok(())
    }
}

fn key_active(id: &str) -> String {
    format!("{{{id}}}:active")
}

fn key_counter(id: &str, counter: &str) -> String {
    format!("{{{id}}}:{counter}")
}

fn key_minute(id: &str, minute: &str, counter: &str) -> String {
    format!("{{{id}}}:{minute}:{counter}")
}

/// Stats store backed by a shared key/value store
///
/// Counters, EWMA, and cooldown are shared; latency/TTFT histories stay
/// replica-local (they feed local tie-breaks only).
pub struct DistributedStatsStore {
    backend: Arc<dyn StatsBackend>,
    ewma_alpha: f64,
    histories: Mutex<HashMap<String, LocalHistories>>,
}

#[derive(Debug, Default, Clone)]
struct LocalHistories {
    latency: VecDeque<f64>,
    ttft: VecDeque<f64>,
    outcomes: VecDeque<bool>,
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, value: T) {
    if buffer.len() == HISTORY_SIZE {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

impl fmt::Debug for DistributedStatsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedStatsStore")
            .field("ewma_alpha", &self.ewma_alpha)
            .finish_non_exhaustive()
    }
}

impl DistributedStatsStore {
    /// Wrap a backend with the given EWMA smoothing factor
    pub fn new(backend: Arc<dyn StatsBackend>, ewma_alpha: f64) -> Self {
        Self {
            backend,
            ewma_alpha,
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// CAS loop folding one latency sample into the shared EWMA
    async fn update_ewma(&self, deployment_id: &str, latency_ms: f64) {
        let key = key_counter(deployment_id, "ewma");
        for _ in 0..8 {
            let current = match self.backend.get(&key).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(deployment_id, %err, "ewma read failed");
                    return;
                }
            };
            let next = match current {
                None => latency_ms,
                Some(ewma) => (1.0 - self.ewma_alpha) * ewma + self.ewma_alpha * latency_ms,
            };
            match self.backend.compare_and_swap(&key, current, next).await {
                Ok(true) => return,
                Ok(false) => continue,
                Err(err) => {
                    warn!(deployment_id, %err, "ewma swap failed");
                    return;
                }
            }
        }
        warn!(deployment_id, "ewma swap contended, sample dropped");
    }

    async fn incr_or_warn(&self, key: &str, by: i64) {
        if let Err(err) = self.backend.incr(key, by).await {
            warn!(key, %err, "stats increment failed");
        }
    }
}

#[async_trait]
impl StatsStore for DistributedStatsStore {
    async fn start_request(&self, deployment_id: &str) {
        self.incr_or_warn(&key_active(deployment_id), 1).await;
    }

    async fn end_request(&self, deployment_id: &str) {
        let key = key_active(deployment_id);
        match self.backend.incr(&key, -1).await {
            // Clamp under-counted replicas back to zero
            Ok(value) if value < 0 => {
                let _ = self.backend.set(&key, 0.0).await;
            }
            Ok(_) => {}
            Err(err) => warn!(deployment_id, %err, "stats decrement failed"),
        }
    }

    async fn report_success(
        &self,
        deployment_id: &str,
        latency_ms: f64,
        ttft_ms: Option<f64>,
        total_tokens: u64,
    ) {
        let now = Utc::now();
        let minute = minute_key(now);
        self.incr_or_warn(&key_counter(deployment_id, "total"), 1)
            .await;
        self.incr_or_warn(&key_counter(deployment_id, "success"), 1)
            .await;
        let tpm_key = key_minute(deployment_id, &minute, "tpm");
        let rpm_key = key_minute(deployment_id, &minute, "rpm");
        self.incr_or_warn(&tpm_key, total_tokens as i64).await;
        self.incr_or_warn(&rpm_key, 1).await;
        let _ = self.backend.expire(&tpm_key, Duration::from_secs(120)).await;
        let _ = self.backend.expire(&rpm_key, Duration::from_secs(120)).await;
        let _ = self
            .backend
            .set(
                &key_counter(deployment_id, "last_request"),
                now.timestamp() as f64,
            )
            .await;
        self.update_ewma(deployment_id, latency_ms).await;

        let mut histories = self.histories.lock();
        let entry = histories.entry(deployment_id.to_string()).or_default();
        push_bounded(&mut entry.latency, latency_ms);
        if let Some(ttft) = ttft_ms {
            push_bounded(&mut entry.ttft, ttft);
        }
        push_bounded(&mut entry.outcomes, true);
    }

    async fn report_failure(&self, deployment_id: &str) {
        let now = Utc::now();
        let minute = minute_key(now);
        self.incr_or_warn(&key_counter(deployment_id, "total"), 1)
            .await;
        self.incr_or_warn(&key_counter(deployment_id, "failure"), 1)
            .await;
        self.incr_or_warn(&key_minute(deployment_id, &minute, "rpm"), 1)
            .await;
        let _ = self
            .backend
            .set(
                &key_counter(deployment_id, "last_request"),
                now.timestamp() as f64,
            )
            .await;

        let mut histories = self.histories.lock();
        let entry = histories.entry(deployment_id.to_string()).or_default();
        push_bounded(&mut entry.outcomes, false);
    }

    async fn set_cooldown(&self, deployment_id: &str, until: DateTime<Utc>) {
        if let Err(err) = self
            .backend
            .set(
                &key_counter(deployment_id, "cooldown_until"),
                until.timestamp() as f64,
            )
            .await
        {
            warn!(deployment_id, %err, "cooldown write failed");
        }
    }

    async fn penalize_latency(&self, deployment_id: &str, latency_ms: f64) {
        self.update_ewma(deployment_id, latency_ms).await;
        let mut histories = self.histories.lock();
        let entry = histories.entry(deployment_id.to_string()).or_default();
        push_bounded(&mut entry.latency, latency_ms);
    }

    async fn snapshot(&self, deployment_id: &str) -> DeploymentStats {
        let now = Utc::now();
        let minute = minute_key(now);
        let read = |key: String| {
            let backend = Arc::clone(&self.backend);
            async move { backend.get(&key).await.ok().flatten().unwrap_or(0.0) }
        };

        let active = read(key_active(deployment_id)).await;
        let total = read(key_counter(deployment_id, "total")).await;
        let success = read(key_counter(deployment_id, "success")).await;
        let failure = read(key_counter(deployment_id, "failure")).await;
        let ewma = read(key_counter(deployment_id, "ewma")).await;
        let cooldown = read(key_counter(deployment_id, "cooldown_until")).await;
        let tpm = read(key_minute(deployment_id, &minute, "tpm")).await;
        let rpm = read(key_minute(deployment_id, &minute, "rpm")).await;
        let last_request = read(key_counter(deployment_id, "last_request")).await;

        let local = self
            .histories
            .lock()
            .get(deployment_id)
            .cloned()
            .unwrap_or_default();

        DeploymentStats {
            active_requests: active.max(0.0) as u32,
            total_requests: total as u64,
            success_requests: success as u64,
            fail_requests: failure as u64,
            ewma_latency_ms: ewma,
            latency_history: local.latency,
            ttft_history: local.ttft,
            cooldown_until: (cooldown > 0.0)
                .then(|| Utc.timestamp_opt(cooldown as i64, 0).single())
                .flatten(),
            current_minute_key: minute,
            current_minute_tpm: tpm as u64,
            current_minute_rpm: rpm as u64,
            last_request_time: (last_request > 0.0)
                .then(|| Utc.timestamp_opt(last_request as i64, 0).single())
                .flatten(),
            recent_outcomes: local.outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_shared_across_instances() {
        let backend = Arc::new(InMemoryStatsBackend::new());
        let store_a = DistributedStatsStore::new(backend.clone(), 0.1);
        let store_b = DistributedStatsStore::new(backend.clone(), 0.1);

        store_a.start_request("d1").await;
        store_b.start_request("d1").await;
        store_a.report_success("d1", 100.0, None, 50).await;
        store_b.report_success("d1", 300.0, None, 70).await;
        store_a.end_request("d1").await;
        store_b.end_request("d1").await;

        let snapshot = store_a.snapshot("d1").await;
        assert_eq!(snapshot.active_requests, 0);
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.success_requests, 2);
        assert_eq!(snapshot.current_minute_tpm, 120);
        assert_eq!(snapshot.current_minute_rpm, 2);
        // 100 seeded, then 0.9*100 + 0.1*300 = 120
        assert!((snapshot.ewma_latency_ms - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cooldown_visible_to_peers() {
        let backend = Arc::new(InMemoryStatsBackend::new());
        let store_a = DistributedStatsStore::new(backend.clone(), 0.1);
        let store_b = DistributedStatsStore::new(backend, 0.1);

        let until = Utc::now() + chrono::Duration::seconds(60);
        store_a.set_cooldown("d1", until).await;

        let snapshot = store_b.snapshot("d1").await;
        assert!(snapshot.in_cooldown(Utc::now()));
    }

    #[tokio::test]
    async fn test_active_never_goes_negative() {
        let backend = Arc::new(InMemoryStatsBackend::new());
        let store = DistributedStatsStore::new(backend, 0.1);
        store.end_request("d1").await;
        assert_eq!(store.snapshot("d1").await.active_requests, 0);
    }

    #[tokio::test]
    async fn test_cas_backend_contract() {
        let backend = InMemoryStatsBackend::new();
        assert!(backend.compare_and_swap("k", None, 1.0).await.unwrap());
        assert!(!backend.compare_and_swap("k", None, 2.0).await.unwrap());
        assert!(
            backend
                .compare_and_swap("k", Some(1.0), 2.0)
                .await
                .unwrap()
        );
        assert_eq!(backend.get("k").await.unwrap(), Some(2.0));
    }
}
