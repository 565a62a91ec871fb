//! Per-deployment runtime statistics
//!
//! Stats are exclusively owned by a [`StatsStore`]; every mutation runs
//! under the store's lock (or through the distributed backend). No hook,
//! strategy, or provider call ever executes while the lock is held:
//! callers copy a snapshot out, decide outside, and apply updates back
//! under the lock.

use super::deployment::DeploymentConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Ring-buffer size for latency/TTFT histories and the outcome window
pub const HISTORY_SIZE: usize = 10;

/// Minimum observations before the failure-rate trigger can fire
pub const FAILURE_RATE_MIN_REQUESTS: usize = 5;

/// Wall-clock minute key, `YYYY-MM-DD-HH-MM`
pub fn minute_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d-%H-%M").to_string()
}

/// Mutable per-deployment state
#[derive(Debug, Clone)]
pub struct DeploymentStats {
    /// Requests currently in flight
    pub active_requests: u32,
    /// Lifetime request count; always `success + failure`
    pub total_requests: u64,
    /// Lifetime success count
    pub success_requests: u64,
    /// Lifetime failure count
    pub fail_requests: u64,
    /// Smoothed end-to-end latency in milliseconds; meaningful only once
    /// `latency_history` is non-empty
    pub ewma_latency_ms: f64,
    /// Recent latency samples, FIFO, bounded by [`HISTORY_SIZE`]
    pub latency_history: VecDeque<f64>,
    /// Recent time-to-first-token samples, FIFO, bounded by [`HISTORY_SIZE`]
    pub ttft_history: VecDeque<f64>,
    /// Deployment is unavailable while `now < cooldown_until`
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Minute the current TPM/RPM counters belong to
    pub current_minute_key: String,
    /// Tokens consumed in the current minute
    pub current_minute_tpm: u64,
    /// Requests issued in the current minute
    pub current_minute_rpm: u64,
    /// Last time any outcome was recorded
    pub last_request_time: Option<DateTime<Utc>>,
    /// Recent outcome window (true = success), for the failure-rate trigger
    pub recent_outcomes: VecDeque<bool>,
}

impl Default for DeploymentStats {
    fn default() -> Self {
        Self {
            active_requests: 0,
            total_requests: 0,
            success_requests: 0,
            fail_requests: 0,
            ewma_latency_ms: 0.0,
            latency_history: VecDeque::with_capacity(HISTORY_SIZE),
            ttft_history: VecDeque::with_capacity(HISTORY_SIZE),
            cooldown_until: None,
            current_minute_key: String::new(),
            current_minute_tpm: 0,
            current_minute_rpm: 0,
            last_request_time: None,
            recent_outcomes: VecDeque::with_capacity(HISTORY_SIZE),
        }
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, value: T) {
    if buffer.len() == HISTORY_SIZE {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

impl DeploymentStats {
    /// Reset minute counters whenever the wall-clock minute changed
    fn roll_minute(&mut self, now: DateTime<Utc>) {
        let key = minute_key(now);
        if self.current_minute_key != key {
            self.current_minute_key = key;
            self.current_minute_tpm = 0;
            self.current_minute_rpm = 0;
        }
    }

    /// Record a latency sample and fold it into the EWMA
    ///
    /// The first sample seeds the EWMA directly; afterwards
    /// `ewma <- (1 - alpha) * ewma + alpha * sample`.
    fn observe_latency(&mut self, latency_ms: f64, alpha: f64) {
        if self.latency_history.is_empty() {
            self.ewma_latency_ms = latency_ms;
        } else {
            self.ewma_latency_ms = (1.0 - alpha) * self.ewma_latency_ms + alpha * latency_ms;
        }
        push_bounded(&mut self.latency_history, latency_ms);
    }

    fn record_success(
        &mut self,
        latency_ms: f64,
        ttft_ms: Option<f64>,
        total_tokens: u64,
        alpha: f64,
        now: DateTime<Utc>,
    ) {
        self.roll_minute(now);
        self.total_requests += 1;
        self.success_requests += 1;
        self.current_minute_tpm += total_tokens;
        self.current_minute_rpm += 1;
        self.last_request_time = Some(now);
        self.observe_latency(latency_ms, alpha);
        if let Some(ttft) = ttft_ms {
            push_bounded(&mut self.ttft_history, ttft);
        }
        push_bounded(&mut self.recent_outcomes, true);
    }

    fn record_failure(&mut self, now: DateTime<Utc>) {
        self.roll_minute(now);
        self.total_requests += 1;
        self.fail_requests += 1;
        self.current_minute_rpm += 1;
        self.last_request_time = Some(now);
        push_bounded(&mut self.recent_outcomes, false);
    }

    /// Whether the deployment is cooling down at `now`
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Minute counters projected onto `now`; stale counters read as zero
    pub fn minute_counters(&self, now: DateTime<Utc>) -> (u64, u64) {
        if self.current_minute_key == minute_key(now) {
            (self.current_minute_tpm, self.current_minute_rpm)
        } else {
            (0, 0)
        }
    }

    /// Failure rate over the recent window, `None` below the minimum
    pub fn failure_rate(&self) -> Option<f64> {
        if self.recent_outcomes.len() < FAILURE_RATE_MIN_REQUESTS {
            return None;
        }
        let failures = self.recent_outcomes.iter().filter(|ok| !**ok).count();
        Some(failures as f64 / self.recent_outcomes.len() as f64)
    }

    /// Whether any latency sample has been observed
    pub fn has_latency_samples(&self) -> bool {
        !self.latency_history.is_empty()
    }
}

/// Candidate eligibility per the routing invariant
///
/// Eligible iff not cooling down, and the projected minute counters stay
/// within the configured budgets (a limit of 0 disables its check).
/// Tag filtering happens in the router prelude, which owns the static
/// deployment view.
pub fn is_eligible(
    config: &DeploymentConfig,
    stats: &DeploymentStats,
    input_tokens: u64,
    now: DateTime<Utc>,
) -> bool {
    if stats.in_cooldown(now) {
        return false;
    }
    let (tpm, rpm) = stats.minute_counters(now);
    if config.tpm_limit > 0 && tpm + input_tokens > config.tpm_limit {
        return false;
    }
    if config.rpm_limit > 0 && rpm + 1 > config.rpm_limit {
        return false;
    }
    true
}

/// Store contract for per-deployment state
///
/// Two implementations: [`LocalStatsStore`] for a single gateway, and a
/// distributed variant when multiple replicas must agree on load and
/// cooldown. `start`/`end` must balance along every control path.
#[async_trait]
pub trait StatsStore: Send + Sync + fmt::Debug {
    /// Increment the in-flight counter
    async fn start_request(&self, deployment_id: &str);

    /// Decrement the in-flight counter, clamped at zero
    async fn end_request(&self, deployment_id: &str);

    /// Record a completed request with its measurements
    async fn report_success(
        &self,
        deployment_id: &str,
        latency_ms: f64,
        ttft_ms: Option<f64>,
        total_tokens: u64,
    );

    /// Record a failed request; cooldown decisions live in the cooldown
    /// policy, not here
    async fn report_failure(&self, deployment_id: &str);

    /// Force the deployment out of rotation until the given instant
    async fn set_cooldown(&self, deployment_id: &str, until: DateTime<Utc>);

    /// Append a synthetic latency sample (timeout penalty)
    async fn penalize_latency(&self, deployment_id: &str, latency_ms: f64);

    /// Immutable copy of the current state
    async fn snapshot(&self, deployment_id: &str) -> DeploymentStats;
}

/// In-process stats store: one map behind a read/write lock
///
/// Mutators take the exclusive lock; `snapshot` copies under the shared
/// lock. No await point ever runs while a lock is held.
pub struct LocalStatsStore {
    inner: RwLock<HashMap<String, DeploymentStats>>,
    ewma_alpha: f64,
}

impl fmt::Debug for LocalStatsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStatsStore")
            .field("deployments", &self.inner.read().len())
            .field("ewma_alpha", &self.ewma_alpha)
            .finish()
    }
}

impl LocalStatsStore {
    /// Create a store with the given EWMA smoothing factor
    pub fn new(ewma_alpha: f64) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ewma_alpha,
        }
    }

    fn with_entry(&self, deployment_id: &str, apply: impl FnOnce(&mut DeploymentStats)) {
        let mut inner = self.inner.write();
        apply(inner.entry(deployment_id.to_string()).or_default());
    }
}

impl Default for LocalStatsStore {
    fn default() -> Self {
        Self::new(0.1)
    }
}

#[async_trait]
impl StatsStore for LocalStatsStore {
    async fn start_request(&self, deployment_id: &str) {
        self.with_entry(deployment_id, |stats| {
            stats.active_requests += 1;
        });
    }

    async fn end_request(&self, deployment_id: &str) {
        self.with_entry(deployment_id, |stats| {
            stats.active_requests = stats.active_requests.saturating_sub(1);
        });
    }

    async fn report_success(
        &self,
        deployment_id: &str,
        latency_ms: f64,
        ttft_ms: Option<f64>,
        total_tokens: u64,
    ) {
        let now = Utc::now();
        let alpha = self.ewma_alpha;
        self.with_entry(deployment_id, |stats| {
            stats.record_success(latency_ms, ttft_ms, total_tokens, alpha, now);
        });
    }

    async fn report_failure(&self, deployment_id: &str) {
        let now = Utc::now();
        self.with_entry(deployment_id, |stats| {
            stats.record_failure(now);
        });
    }

    async fn set_cooldown(&self, deployment_id: &str, until: DateTime<Utc>) {
        self.with_entry(deployment_id, |stats| {
            stats.cooldown_until = Some(until);
        });
    }

    async fn penalize_latency(&self, deployment_id: &str, latency_ms: f64) {
        let alpha = self.ewma_alpha;
        self.with_entry(deployment_id, |stats| {
            stats.observe_latency(latency_ms, alpha);
        });
    }

    async fn snapshot(&self, deployment_id: &str) -> DeploymentStats {
        self.inner
            .read()
            .get(deployment_id)
            .cloned()
            .unwrap_or_default()
    }
}
