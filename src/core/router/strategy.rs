//! Deployment selection
//!
//! The shared prelude fetches eligible candidates (cooldown, minute
//! budgets, and tag filters applied against live stats), then hands off
//! to the strategy-specific picker. Strategies never cache the registry.

use super::deployment::{Deployment, DeploymentId};
use super::distributed::StatsBackend;
use super::error::RouterError;
use super::registry::DeploymentRegistry;
use super::stats::{StatsStore, is_eligible};
use super::strategy_impl::{
    Candidate, least_busy, lowest_cost, lowest_latency, lowest_tpm_rpm, round_robin,
    simple_shuffle, tag_filter,
};
use crate::config::router::RoutingStrategyConfig;
use crate::utils::error::GatewayError;
use chrono::Utc;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Completion-size guess used by cost projection when the request does
/// not bound its output
const DEFAULT_EXPECTED_OUTPUT_TOKENS: u64 = 256;

/// Runtime routing strategy
#[derive(Debug, Clone)]
pub enum RoutingStrategy {
    /// Weighted random selection
    SimpleShuffle,
    /// Per-model monotonic counter
    RoundRobin,
    /// Smallest EWMA latency first
    LowestLatency,
    /// Fewest in-flight requests first
    LeastBusy,
    /// Smallest current-minute TPM ratio first
    LowestTpmRpm,
    /// Cheapest projected cost first
    LowestCost,
    /// Strict tag intersection, then a secondary strategy
    TagBased {
        /// Strategy applied after tag filtering
        secondary: Box<RoutingStrategy>,
    },
}

impl From<&RoutingStrategyConfig> for RoutingStrategy {
    fn from(config: &RoutingStrategyConfig) -> Self {
        match config {
            RoutingStrategyConfig::SimpleShuffle => RoutingStrategy::SimpleShuffle,
            RoutingStrategyConfig::RoundRobin => RoutingStrategy::RoundRobin,
            RoutingStrategyConfig::LowestLatency => RoutingStrategy::LowestLatency,
            RoutingStrategyConfig::LeastBusy => RoutingStrategy::LeastBusy,
            RoutingStrategyConfig::LowestTpmRpm => RoutingStrategy::LowestTpmRpm,
            RoutingStrategyConfig::LowestCost => RoutingStrategy::LowestCost,
            RoutingStrategyConfig::TagBased { secondary } => RoutingStrategy::TagBased {
                secondary: Box::new(RoutingStrategy::from(secondary.as_ref())),
            },
        }
    }
}

/// Routing engine: prelude plus strategy dispatch
pub struct Router {
    registry: Arc<DeploymentRegistry>,
    stats: Arc<dyn StatsStore>,
    strategy: RoutingStrategy,
    /// Local per-model round-robin counters
    round_robin_counters: DashMap<String, AtomicU64>,
    /// Shared counter backend; preserves round-robin fairness across
    /// gateway replicas when present
    shared_counters: Option<Arc<dyn StatsBackend>>,
    default_provider: Option<String>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("strategy", &self.strategy)
            .field("default_provider", &self.default_provider)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router over a registry and stats store
    pub fn new(
        registry: Arc<DeploymentRegistry>,
        stats: Arc<dyn StatsStore>,
        strategy: RoutingStrategy,
    ) -> Self {
        Self {
            registry,
            stats,
            strategy,
            round_robin_counters: DashMap::new(),
            shared_counters: None,
            default_provider: None,
        }
    }

    /// Keep round-robin counters in a shared store (builder pattern)
    pub fn with_shared_counters(mut self, backend: Arc<dyn StatsBackend>) -> Self {
        self.shared_counters = Some(backend);
        self
    }

    /// Place this provider type first among candidates (builder pattern)
    pub fn with_default_provider(mut self, provider_type: Option<String>) -> Self {
        self.default_provider = provider_type;
        self
    }

    /// Pick one deployment for the request
    pub async fn pick(
        &self,
        model: &str,
        request_tags: &[String],
        input_tokens: u64,
    ) -> Result<Deployment, RouterError> {
        self.pick_excluding(model, request_tags, input_tokens, &[])
            .await
    }

    /// Pick one deployment, skipping the given ids (retry path)
    pub async fn pick_excluding(
        &self,
        model: &str,
        request_tags: &[String],
        input_tokens: u64,
        exclude: &[DeploymentId],
    ) -> Result<Deployment, RouterError> {
        let candidates = self
            .eligible_candidates(model, request_tags, input_tokens, exclude)
            .await?;
        let index = self
            .dispatch(&self.strategy, model, request_tags, input_tokens, &candidates)
            .await?;
        let chosen = candidates[index].deployment.clone();
        debug!(
            model,
            deployment_id = %chosen.id,
            provider = %chosen.provider_type(),
            "deployment selected"
        );
        Ok(chosen)
    }

    /// Shared prelude: registry snapshot, tag filter, live eligibility,
    /// default-provider re-sort
    async fn eligible_candidates(
        &self,
        model: &str,
        request_tags: &[String],
        input_tokens: u64,
        exclude: &[DeploymentId],
    ) -> Result<Vec<Candidate>, RouterError> {
        let mut deployments = self.registry.deployments_for(model);
        if deployments.is_empty() {
            return Err(RouterError::NoAvailableDeployment(model.to_string()));
        }
        deployments.retain(|d| !exclude.contains(&d.id));
        if deployments.is_empty() {
            return Err(RouterError::NoAvailableDeployment(model.to_string()));
        }

        // Static tag filter; the tag-based strategy applies its own
        // intersection semantics instead.
        if !request_tags.is_empty() && !matches!(self.strategy, RoutingStrategy::TagBased { .. }) {
            deployments.retain(|d| d.config.has_all_tags(request_tags));
            if deployments.is_empty() {
                return Err(RouterError::NoDeploymentsMatchTags(model.to_string()));
            }
        }

        let now = Utc::now();
        let mut candidates = Vec::with_capacity(deployments.len());
        for deployment in deployments {
            let stats = self.stats.snapshot(&deployment.id).await;
            if is_eligible(&deployment.config, &stats, input_tokens, now) {
                candidates.push(Candidate { deployment, stats });
            }
        }
        if candidates.is_empty() {
            return Err(RouterError::NoAvailableDeployment(model.to_string()));
        }

        // Stable re-sort: preferred provider first, before tie-breaks
        if let Some(preferred) = &self.default_provider {
            candidates.sort_by_key(|c| c.deployment.provider_type() != preferred);
        }

        Ok(candidates)
    }

    async fn dispatch(
        &self,
        strategy: &RoutingStrategy,
        model: &str,
        request_tags: &[String],
        input_tokens: u64,
        candidates: &[Candidate],
    ) -> Result<usize, RouterError> {
        let index = match strategy {
            RoutingStrategy::SimpleShuffle => simple_shuffle(candidates),
            RoutingStrategy::RoundRobin => {
                let counter = self.next_round_robin(model).await;
                round_robin(counter, candidates)
            }
            RoutingStrategy::LowestLatency => lowest_latency(candidates),
            RoutingStrategy::LeastBusy => least_busy(candidates),
            RoutingStrategy::LowestTpmRpm => lowest_tpm_rpm(candidates),
            RoutingStrategy::LowestCost => {
                lowest_cost(candidates, input_tokens, DEFAULT_EXPECTED_OUTPUT_TOKENS)
            }
            RoutingStrategy::TagBased { secondary } => {
                let kept = tag_filter(candidates, request_tags);
                if kept.is_empty() {
                    return Err(RouterError::NoDeploymentsMatchTags(model.to_string()));
                }
                let filtered: Vec<Candidate> =
                    kept.iter().map(|&i| candidates[i].clone()).collect();
                let inner = Box::pin(self.dispatch(
                    secondary,
                    model,
                    request_tags,
                    input_tokens,
                    &filtered,
                ))
                .await?;
                kept[inner]
            }
        };
        Ok(index)
    }

    /// Advance the per-model round-robin counter
    ///
    /// In distributed mode the counter lives in the shared store so
    /// fairness holds across replicas; skipping unhealthy candidates is
    /// local and never rewinds it.
    async fn next_round_robin(&self, model: &str) -> u64 {
        if let Some(backend) = &self.shared_counters {
            match backend.incr(&format!("roundrobin:{model}"), 1).await {
                Ok(value) => return (value - 1).max(0) as u64,
                Err(err) => {
                    warn!(model, %err, "shared round-robin counter unavailable, using local");
                }
            }
        }
        self.round_robin_counters
            .entry(model.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl From<RouterError> for GatewayError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::ModelNotFound(model) => GatewayError::ModelNotFound(model),
            RouterError::NoAvailableDeployment(model) => GatewayError::NoAvailableDeployment(model),
            RouterError::NoDeploymentsMatchTags(model) => {
                GatewayError::NoDeploymentsMatchTags(model)
            }
            RouterError::DeploymentNotFound(id) => GatewayError::NoAvailableDeployment(id),
        }
    }
}
