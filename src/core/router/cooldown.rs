//! Failure classification and cooldown policy
//!
//! Cooldown is a one-way, time-based signal: it never closes early on a
//! successful probe. Half-open probing is deliberately absent because
//! LLM backends recover in bursts where a single probe says nothing.

use super::error::CooldownReason;
use super::stats::StatsStore;
use crate::utils::error::{ErrorKind, GatewayError};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

/// Synthetic latency sample appended on timeouts, in milliseconds
pub const TIMEOUT_PENALTY_LATENCY_MS: f64 = 1_000_000.0;

/// Failure rate above which the rate-based trigger fires
pub const FAILURE_RATE_THRESHOLD: f64 = 0.5;

/// Applies the cooldown policy to reported failures
#[derive(Debug, Clone)]
pub struct CooldownManager {
    period: Duration,
}

impl CooldownManager {
    /// Create a manager applying the given cooldown period
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Configured cooldown period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Classify an error into an immediate-cooldown reason, if any
    ///
    /// Client-fault errors (invalid request, context length, content
    /// policy) are not the deployment's doing and never trigger
    /// cooldown; they only count toward the failure rate.
    pub fn immediate_reason(error: &GatewayError) -> Option<CooldownReason> {
        match error.kind() {
            ErrorKind::RateLimit => Some(CooldownReason::RateLimit),
            ErrorKind::Authentication => Some(CooldownReason::AuthError),
            ErrorKind::NotFound => Some(CooldownReason::NotFound),
            ErrorKind::Timeout => match error {
                // User cancellation is not a deployment fault
                GatewayError::Cancelled(_) => None,
                _ => Some(CooldownReason::Timeout),
            },
            _ => None,
        }
    }

    /// Record a failure and apply the cooldown policy
    ///
    /// Returns the reason when the deployment was cooled.
    pub async fn on_failure(
        &self,
        store: &dyn StatsStore,
        deployment_id: &str,
        error: &GatewayError,
    ) -> Option<CooldownReason> {
        store.report_failure(deployment_id).await;

        if let Some(reason) = Self::immediate_reason(error) {
            if reason == CooldownReason::Timeout {
                store
                    .penalize_latency(deployment_id, TIMEOUT_PENALTY_LATENCY_MS)
                    .await;
            }
            self.apply(store, deployment_id, reason).await;
            return Some(reason);
        }

        // Rate-based trigger over the sliding outcome window
        let snapshot = store.snapshot(deployment_id).await;
        if let Some(rate) = snapshot.failure_rate() {
            if rate > FAILURE_RATE_THRESHOLD {
                self.apply(store, deployment_id, CooldownReason::HighFailureRate)
                    .await;
                return Some(CooldownReason::HighFailureRate);
            }
        }

        debug!(deployment_id, error = %error, "transient failure recorded");
        None
    }

    /// Cool a deployment down immediately
    pub async fn apply(
        &self,
        store: &dyn StatsStore,
        deployment_id: &str,
        reason: CooldownReason,
    ) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.period).unwrap_or(chrono::Duration::seconds(60));
        store.set_cooldown(deployment_id, until).await;
        info!(
            deployment_id,
            reason = reason.as_str(),
            until = %until,
            "deployment cooling down"
        );
    }
}
