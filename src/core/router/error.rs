//! Router error and cooldown trigger types

/// Why a deployment entered cooldown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownReason {
    /// Rate limit (429), immediate cooldown
    RateLimit,
    /// Authentication error (401), immediate cooldown
    AuthError,
    /// Model not found upstream (404), immediate cooldown
    NotFound,
    /// Timeout (408/504), immediate cooldown plus a penalty latency sample
    Timeout,
    /// Failure rate over the recent window exceeded the threshold
    HighFailureRate,
    /// Manual exclusion by an operator
    Manual,
}

impl CooldownReason {
    /// Label used in logs and telemetry
    pub fn as_str(&self) -> &'static str {
        match self {
            CooldownReason::RateLimit => "rate_limit",
            CooldownReason::AuthError => "auth_error",
            CooldownReason::NotFound => "not_found",
            CooldownReason::Timeout => "timeout",
            CooldownReason::HighFailureRate => "high_failure_rate",
            CooldownReason::Manual => "manual",
        }
    }
}

/// Errors surfaced by routing operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouterError {
    /// Model not present in the registry
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// No deployment survived the eligibility filters
    #[error("No available deployment for model: {0}")]
    NoAvailableDeployment(String),

    /// Deployments exist but none matches the requested tags
    #[error("No deployments match tags for model: {0}")]
    NoDeploymentsMatchTags(String),

    /// Deployment id not present in the registry
    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),
}
