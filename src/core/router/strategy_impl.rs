//! Routing strategy pickers
//!
//! Pure selection policies over candidate snapshots. Each picker takes
//! the eligible candidates (cooldown, budgets, and tags already applied
//! by the prelude) and returns the index of its choice. Deterministic
//! given the same inputs, except where randomness is explicit.

use super::deployment::Deployment;
use super::stats::DeploymentStats;
use rand::Rng;

/// An eligible deployment paired with its stats snapshot
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The deployment
    pub deployment: Deployment,
    /// Stats copied out of the store at selection time
    pub stats: DeploymentStats,
}

/// Weighted reservoir pick (simple-shuffle)
///
/// Each candidate draws a key `r^(1/w)` with `w = max(weight, 1)` and
/// `r` uniform in (0, 1]; the largest key wins. Equal weights fall back
/// to a uniform draw.
pub fn simple_shuffle(candidates: &[Candidate]) -> usize {
    debug_assert!(!candidates.is_empty());
    if candidates.len() == 1 {
        return 0;
    }

    let mut rng = rand::thread_rng();
    let first_weight = candidates[0].deployment.config.weight.max(1);
    let all_equal = candidates
        .iter()
        .all(|c| c.deployment.config.weight.max(1) == first_weight);
    if all_equal {
        return rng.gen_range(0..candidates.len());
    }

    let mut best = 0;
    let mut best_key = f64::MIN;
    for (index, candidate) in candidates.iter().enumerate() {
        let weight = candidate.deployment.config.weight.max(1) as f64;
        let r: f64 = rng.gen_range(f64::EPSILON..=1.0);
        let key = r.powf(1.0 / weight);
        if key > best_key {
            best_key = key;
            best = index;
        }
    }
    best
}

/// Round-robin pick from a monotonic counter value
pub fn round_robin(counter: u64, candidates: &[Candidate]) -> usize {
    debug_assert!(!candidates.is_empty());
    (counter % candidates.len() as u64) as usize
}

/// Smallest EWMA latency; ties broken by in-flight count, then id
///
/// Candidates with no samples get a virtual latency of zero so new
/// deployments are probed.
pub fn lowest_latency(candidates: &[Candidate]) -> usize {
    debug_assert!(!candidates.is_empty());
    let mut best = 0;
    for index in 1..candidates.len() {
        let challenger = &candidates[index];
        let incumbent = &candidates[best];
        let challenger_key = (
            virtual_latency(&challenger.stats),
            challenger.stats.active_requests,
            challenger.deployment.id.as_str(),
        );
        let incumbent_key = (
            virtual_latency(&incumbent.stats),
            incumbent.stats.active_requests,
            incumbent.deployment.id.as_str(),
        );
        if challenger_key.partial_cmp(&incumbent_key) == Some(std::cmp::Ordering::Less) {
            best = index;
        }
    }
    best
}

fn virtual_latency(stats: &DeploymentStats) -> f64 {
    if stats.has_latency_samples() {
        stats.ewma_latency_ms
    } else {
        0.0
    }
}

/// Fewest in-flight requests; ties broken by EWMA latency, then id
pub fn least_busy(candidates: &[Candidate]) -> usize {
    debug_assert!(!candidates.is_empty());
    let mut best = 0;
    for index in 1..candidates.len() {
        let challenger = &candidates[index];
        let incumbent = &candidates[best];
        let challenger_key = (
            challenger.stats.active_requests,
            challenger.stats.ewma_latency_ms,
            challenger.deployment.id.as_str(),
        );
        let incumbent_key = (
            incumbent.stats.active_requests,
            incumbent.stats.ewma_latency_ms,
            incumbent.deployment.id.as_str(),
        );
        if challenger_key.partial_cmp(&incumbent_key) == Some(std::cmp::Ordering::Less) {
            best = index;
        }
    }
    best
}

/// Smallest current-minute TPM ratio; unlimited deployments read as zero
pub fn lowest_tpm_rpm(candidates: &[Candidate]) -> usize {
    debug_assert!(!candidates.is_empty());
    let ratio = |candidate: &Candidate| -> f64 {
        let limit = candidate.deployment.config.tpm_limit;
        if limit == 0 {
            0.0
        } else {
            candidate.stats.current_minute_tpm as f64 / limit as f64
        }
    };

    let mut best = 0;
    for index in 1..candidates.len() {
        let challenger = (ratio(&candidates[index]), candidates[index].deployment.id.as_str());
        let incumbent = (ratio(&candidates[best]), candidates[best].deployment.id.as_str());
        if challenger.partial_cmp(&incumbent) == Some(std::cmp::Ordering::Less) {
            best = index;
        }
    }
    best
}

/// Cheapest projected cost for this request
///
/// `projected = input_tokens * prompt_rate + expected_output * completion_rate`,
/// with per-1k rates from the deployment config.
pub fn lowest_cost(candidates: &[Candidate], input_tokens: u64, expected_output: u64) -> usize {
    debug_assert!(!candidates.is_empty());
    let projected = |candidate: &Candidate| -> f64 {
        let config = &candidate.deployment.config;
        input_tokens as f64 / 1000.0 * config.cost_per_1k_prompt
            + expected_output as f64 / 1000.0 * config.cost_per_1k_completion
    };

    let mut best = 0;
    for index in 1..candidates.len() {
        let challenger = (projected(&candidates[index]), candidates[index].deployment.id.as_str());
        let incumbent = (projected(&candidates[best]), candidates[best].deployment.id.as_str());
        if challenger.partial_cmp(&incumbent) == Some(std::cmp::Ordering::Less) {
            best = index;
        }
    }
    best
}

/// Tag filter for the tag-based strategy
///
/// Keeps candidates whose tags intersect the request tags; when the
/// intersection is empty everywhere, prefers candidates tagged
/// `default`. Returns indices into the input slice.
pub fn tag_filter(candidates: &[Candidate], request_tags: &[String]) -> Vec<usize> {
    if request_tags.is_empty() {
        return (0..candidates.len()).collect();
    }

    let intersecting: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.deployment.config.has_any_tag(request_tags))
        .map(|(index, _)| index)
        .collect();
    if !intersecting.is_empty() {
        return intersecting;
    }

    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.deployment.config.has_tag("default"))
        .map(|(index, _)| index)
        .collect()
}
