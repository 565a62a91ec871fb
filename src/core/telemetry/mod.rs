//! Unified telemetry payload
//!
//! One record per request, assembled by the orchestrator and handed to
//! the registered callbacks. Content scrubbing runs before the payload
//! leaves the builder; the payload is immutable afterwards and callbacks
//! receive shared references they must not mutate.

pub mod callbacks;
pub mod redaction;

pub use callbacks::{BatchingCallback, CallbackManager, LoggingCallback, TelemetryCallback, TelemetrySink};
pub use redaction::{ScrubConfig, redact_headers, scrub_string, scrub_value};

use crate::core::types::Usage;
use crate::utils::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What kind of call the payload describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Chat completion
    Chat,
    /// Embedding
    Embedding,
}

/// Final request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadStatus {
    /// Request produced a response
    Success,
    /// Request surfaced an error
    Failure,
}

/// One rerouting transition recorded during the selection loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackEvent {
    /// Deployment the attempt failed on
    pub from_deployment: String,
    /// Deployment the request moved to, when one was available
    pub to_deployment: Option<String>,
    /// The error that caused the transition
    pub error: String,
    /// Whether the follow-up attempt succeeded
    pub success: bool,
}

/// The unified per-request telemetry record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardLoggingPayload {
    /// Effective request id
    pub id: String,
    /// Call type
    pub call_type: CallType,
    /// Final status
    pub status: PayloadStatus,
    /// Model the client asked for
    pub requested_model: String,
    /// Provider-native model actually invoked
    pub actual_model: Option<String>,
    /// Provider type of the serving deployment
    pub provider: Option<String>,
    /// Serving deployment id
    pub deployment_id: Option<String>,
    /// Provider base URL, when known
    pub api_base: Option<String>,
    /// Prompt-side token count
    pub prompt_tokens: u32,
    /// Completion-side token count
    pub completion_tokens: u32,
    /// Total token count
    pub total_tokens: u32,
    /// Projected request cost in dollars
    pub cost: f64,
    /// Request start
    pub start_time: DateTime<Utc>,
    /// Request end
    pub end_time: DateTime<Utc>,
    /// First streamed delta; set iff at least one delta was observed
    pub completion_start_time: Option<DateTime<Utc>>,
    /// Opaque API key handle
    pub api_key_id: Option<String>,
    /// Opaque end-user handle
    pub user_id: Option<String>,
    /// Error message, on failure
    pub error: Option<String>,
    /// Error classification label, on failure
    pub error_kind: Option<String>,
    /// Whether the cache plugin served this request
    pub cache_hit: bool,
    /// Cache key, when the cache plugin computed one
    pub cache_key: Option<String>,
    /// Request routing tags
    pub request_tags: Vec<String>,
    /// Rerouting transitions, in order
    pub fallback_events: Vec<FallbackEvent>,
    /// Scrubbed free-form metadata
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Builder assembling the payload from orchestrator state
#[derive(Debug)]
pub struct PayloadBuilder {
    payload: StandardLoggingPayload,
    scrub: ScrubConfig,
}

impl PayloadBuilder {
    /// Start a payload for a request
    pub fn new(request_id: impl Into<String>, call_type: CallType, requested_model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            payload: StandardLoggingPayload {
                id: request_id.into(),
                call_type,
                status: PayloadStatus::Success,
                requested_model: requested_model.into(),
                actual_model: None,
                provider: None,
                deployment_id: None,
                api_base: None,
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                cost: 0.0,
                start_time: now,
                end_time: now,
                completion_start_time: None,
                api_key_id: None,
                user_id: None,
                error: None,
                error_kind: None,
                cache_hit: false,
                cache_key: None,
                request_tags: Vec::new(),
                fallback_events: Vec::new(),
                metadata: HashMap::new(),
            },
            scrub: ScrubConfig::default(),
        }
    }

    /// Override the scrub configuration
    pub fn scrub_config(mut self, scrub: ScrubConfig) -> Self {
        self.scrub = scrub;
        self
    }

    /// Record the window the request ran in
    pub fn timing(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.payload.start_time = start;
        self.payload.end_time = end;
        self
    }

    /// Record the first streamed delta
    pub fn completion_start(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.payload.completion_start_time = at;
        self
    }

    /// Record the serving deployment
    pub fn deployment(
        mut self,
        deployment_id: impl Into<String>,
        provider: impl Into<String>,
        actual_model: impl Into<String>,
        api_base: Option<String>,
    ) -> Self {
        self.payload.deployment_id = Some(deployment_id.into());
        self.payload.provider = Some(provider.into());
        self.payload.actual_model = Some(actual_model.into());
        self.payload.api_base = api_base;
        self
    }

    /// Record token usage
    pub fn usage(mut self, usage: Option<Usage>) -> Self {
        if let Some(usage) = usage {
            self.payload.prompt_tokens = usage.prompt_tokens;
            self.payload.completion_tokens = usage.completion_tokens;
            self.payload.total_tokens = usage.total_tokens;
        }
        self
    }

    /// Record the projected cost
    pub fn cost(mut self, cost: f64) -> Self {
        self.payload.cost = cost;
        self
    }

    /// Record the auth principals
    pub fn principals(mut self, api_key_id: Option<String>, user_id: Option<String>) -> Self {
        self.payload.api_key_id = api_key_id;
        self.payload.user_id = user_id;
        self
    }

    /// Record the request tags
    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.payload.request_tags = tags;
        self
    }

    /// Record cache plugin results
    pub fn cache(mut self, hit: bool, key: Option<String>) -> Self {
        self.payload.cache_hit = hit;
        self.payload.cache_key = key;
        self
    }

    /// Record the final error, flipping the status to failure
    pub fn failure(mut self, error: &GatewayError) -> Self {
        self.payload.status = PayloadStatus::Failure;
        self.payload.error = Some(error.to_string());
        self.payload.error_kind = Some(error.kind().as_str().to_string());
        self
    }

    /// Append one fallback transition
    pub fn fallback_event(mut self, event: FallbackEvent) -> Self {
        self.payload.fallback_events.push(event);
        self
    }

    /// Attach free-form metadata (scrubbed at build time)
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.metadata.insert(key.into(), value);
        self
    }

    /// Scrub and seal the payload
    pub fn build(mut self) -> StandardLoggingPayload {
        for value in self.payload.metadata.values_mut() {
            redaction::scrub_value(value, &self.scrub);
        }
        if let Some(error) = self.payload.error.take() {
            self.payload.error = Some(redaction::scrub_string(&error, &self.scrub));
        }
        self.payload
    }
}
