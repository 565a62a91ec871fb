//! Error types for the gateway core
//!
//! Every failure that crosses a module boundary is a [`GatewayError`].
//! Provider-side failures carry enough classification for the router to
//! decide between retry, fallback, and cooldown without inspecting
//! provider-native payloads.

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
///
/// Variants are `Clone` so an error can be recorded in a fallback event
/// and still be surfaced to the caller.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication rejected by the upstream provider
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Upstream rate limit (429)
    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    /// Malformed or unacceptable client request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Model unknown upstream (404)
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Request or connection timeout (408/504)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transient upstream failure (5xx, connection reset)
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Prompt exceeds the model context window
    #[error("Context length exceeded: {0}")]
    ContextLength(String),

    /// Content rejected by the provider's policy filter
    #[error("Content policy violation: {0}")]
    ContentPolicy(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No deployment is registered for the requested model, or all are
    /// cooled down or over budget
    #[error("No available deployment for model: {0}")]
    NoAvailableDeployment(String),

    /// Deployments exist but none carries the requested tags
    #[error("No deployments match tags for model: {0}")]
    NoDeploymentsMatchTags(String),

    /// Caller-side rate limit (gateway budget, not the provider's)
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// The client cancelled the request or its deadline expired
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// A provider stream failed mid-flight and recovery was not possible
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal errors (pool exhaustion, stats store failure)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

/// Error classification used by routing and cooldown decisions
///
/// Classification, not type names: several `GatewayError` variants can
/// collapse onto one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Never retried, immediate cooldown, surfaced as 401
    Authentication,
    /// Cools the deployment immediately; retried elsewhere
    RateLimit,
    /// Surfaced to the client without retry
    InvalidRequest,
    /// Model unknown upstream; immediate cooldown
    NotFound,
    /// Penalty latency sample, immediate cooldown, retry allowed
    Timeout,
    /// Counted toward failure rate; retry allowed
    ServiceUnavailable,
    /// Surfaced without retry
    ContextLength,
    /// Surfaced without retry
    ContentPolicy,
    /// Logged with full payload, retried like transient
    Internal,
}

impl ErrorKind {
    /// Short machine-readable label used in telemetry payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ContextLength => "context_length",
            ErrorKind::ContentPolicy => "content_policy",
            ErrorKind::Internal => "internal",
        }
    }
}

impl GatewayError {
    /// Classify the error for routing decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Authentication(_) => ErrorKind::Authentication,
            GatewayError::RateLimited(_) | GatewayError::RateLimitExceeded(_) => {
                ErrorKind::RateLimit
            }
            GatewayError::InvalidRequest(_) | GatewayError::Validation(_) => {
                ErrorKind::InvalidRequest
            }
            GatewayError::ModelNotFound(_)
            | GatewayError::NoAvailableDeployment(_)
            | GatewayError::NoDeploymentsMatchTags(_) => ErrorKind::NotFound,
            GatewayError::Timeout(_) | GatewayError::Cancelled(_) => ErrorKind::Timeout,
            GatewayError::ProviderUnavailable(_) | GatewayError::StreamInterrupted(_) => {
                ErrorKind::ServiceUnavailable
            }
            GatewayError::ContextLength(_) => ErrorKind::ContextLength,
            GatewayError::ContentPolicy(_) => ErrorKind::ContentPolicy,
            _ => ErrorKind::Internal,
        }
    }

    /// Map an upstream HTTP status to the corresponding error
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let msg = message.into();
        match status {
            400 => GatewayError::InvalidRequest(msg),
            401 | 403 => GatewayError::Authentication(msg),
            404 => GatewayError::ModelNotFound(msg),
            408 | 504 => GatewayError::Timeout(msg),
            413 => GatewayError::ContextLength(msg),
            422 => GatewayError::InvalidRequest(msg),
            429 => GatewayError::RateLimited(msg),
            500 | 502 | 503 => GatewayError::ProviderUnavailable(msg),
            _ => GatewayError::Internal(format!("HTTP {status}: {msg}")),
        }
    }

    /// HTTP status to surface to the client, consistent with the OpenAI
    /// wire contract
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Authentication => 401,
            ErrorKind::RateLimit => 429,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 504,
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::ContextLength => 400,
            ErrorKind::ContentPolicy => 400,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether the selection loop may try another deployment
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimit
                | ErrorKind::Timeout
                | ErrorKind::ServiceUnavailable
                | ErrorKind::Internal
                | ErrorKind::NotFound
        ) && !matches!(
            self,
            GatewayError::Cancelled(_)
                | GatewayError::NoAvailableDeployment(_)
                | GatewayError::NoDeploymentsMatchTags(_)
        )
    }

    /// Whether the error is fatal to the whole request regardless of
    /// remaining attempts (auth errors bubble up)
    pub fn is_request_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Authentication
                | ErrorKind::InvalidRequest
                | ErrorKind::ContextLength
                | ErrorKind::ContentPolicy
        ) || matches!(self, GatewayError::Cancelled(_))
    }

    /// Wire-format error object `{ "error": { message, type, code } }`
    pub fn to_wire_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind().as_str(),
                "code": self.http_status(),
            }
        })
    }
}
