//! Pooled per-request plugin context

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-request value carrier threaded through every hook
///
/// One request owns one context for its whole lifetime; the pipeline
/// returns it to the pool after PostHooks. The key/value mapping is the
/// only inter-plugin channel; plugins document the keys they publish
/// and consume, there is no global schema.
#[derive(Debug)]
pub struct PluginContext {
    /// Effective request id
    pub request_id: String,
    /// Requested (client-facing) model
    pub model: String,
    /// Provider type of the selected deployment, late-bound
    pub provider: String,
    /// Selected deployment id, late-bound
    pub deployment_id: Option<String>,
    /// Opaque auth principal
    pub principal: Option<String>,
    /// Monotonic start instant, for latency math
    pub started_at: Option<Instant>,
    /// Wall-clock start, for telemetry
    pub start_time: Option<DateTime<Utc>>,
    /// Whether this request streams
    pub streaming: bool,
    /// Cancellation/deadline handle for the current request
    pub cancellation: CancellationToken,
    /// Absolute deadline, when bounded
    pub deadline: Option<Instant>,
    data: RwLock<AHashMap<String, serde_json::Value>>,
    in_use: AtomicBool,
}

impl PluginContext {
    fn new() -> Self {
        Self {
            request_id: String::new(),
            model: String::new(),
            provider: String::new(),
            deployment_id: None,
            principal: None,
            started_at: None,
            start_time: None,
            streaming: false,
            cancellation: CancellationToken::new(),
            deadline: None,
            data: RwLock::new(AHashMap::new()),
            in_use: AtomicBool::new(false),
        }
    }

    /// Publish a value for downstream plugins
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.data.write().insert(key.into(), value);
    }

    /// Read a value published by an upstream plugin
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.data.read().get(key).cloned()
    }

    /// Remove a value
    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.data.write().remove(key)
    }

    /// Number of published keys
    pub fn data_len(&self) -> usize {
        self.data.read().len()
    }

    /// Time remaining until the deadline
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Clear every field, keeping allocated capacity
    fn reset(&mut self) {
        self.request_id.clear();
        self.model.clear();
        self.provider.clear();
        self.deployment_id = None;
        self.principal = None;
        self.started_at = None;
        self.start_time = None;
        self.streaming = false;
        self.cancellation = CancellationToken::new();
        self.deadline = None;
        self.data.write().clear();
    }
}

/// Lock-free pool of plugin contexts
///
/// A pooled context never serves two requests at once: the sentinel bit
/// flips on acquire and release, and a double release is a logged no-op.
#[derive(Debug)]
pub struct ContextPool {
    pool: ArrayQueue<Box<PluginContext>>,
}

impl ContextPool {
    /// Create a pool retaining at most `capacity` idle contexts
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Loan a context out; fields are reset and the sentinel set
    pub fn acquire(&self) -> Box<PluginContext> {
        let mut ctx = match self.pool.pop() {
            Some(ctx) => ctx,
            None => Box::new(PluginContext::new()),
        };
        ctx.reset();
        ctx.in_use.store(true, Ordering::Release);
        ctx
    }

    /// Return a context; double release is a logged no-op
    pub fn release(&self, mut ctx: Box<PluginContext>) {
        if !ctx.in_use.swap(false, Ordering::AcqRel) {
            warn!("plugin context released twice, dropping");
            return;
        }
        ctx.reset();
        // Pool full: let the allocation drop
        let _ = self.pool.push(ctx);
    }

    /// Idle contexts currently pooled
    pub fn idle(&self) -> usize {
        self.pool.len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(128)
    }
}
