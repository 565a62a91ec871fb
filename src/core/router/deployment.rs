//! Deployment descriptors
//!
//! A deployment is one concrete `(provider, model, credentials)` target,
//! the unit selected by routing. Descriptors are immutable: created at
//! registration, removed at deregistration, never mutated in place. All
//! mutable state lives in the stats store.

use crate::core::providers::ProviderHandle;

/// Deployment identifier, unique across the gateway
pub type DeploymentId = String;

/// Static per-deployment configuration
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    /// Weight for weighted random selection
    pub weight: u32,
    /// Tags for tag-based routing (`production`, `fast`, `default`, ...)
    pub tags: Vec<String>,
    /// Tokens-per-minute budget (0 disables the check)
    pub tpm_limit: u64,
    /// Requests-per-minute budget (0 disables the check)
    pub rpm_limit: u64,
    /// Cost per 1k prompt tokens, in dollars
    pub cost_per_1k_prompt: f64,
    /// Cost per 1k completion tokens, in dollars
    pub cost_per_1k_completion: f64,
    /// Maximum concurrent in-flight requests (0 = unlimited)
    pub max_concurrency: u32,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            weight: 1,
            tags: Vec::new(),
            tpm_limit: 0,
            rpm_limit: 0,
            cost_per_1k_prompt: 0.0,
            cost_per_1k_completion: 0.0,
            max_concurrency: 0,
        }
    }
}

impl DeploymentConfig {
    /// Whether the deployment carries the given tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether the deployment carries all of the given tags
    pub fn has_all_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.has_tag(tag))
    }

    /// Whether the deployment carries any of the given tags
    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        tags.iter().any(|tag| self.has_tag(tag))
    }
}

/// A concrete provider deployment
#[derive(Debug, Clone)]
pub struct Deployment {
    /// Stable unique identifier
    pub id: DeploymentId,
    /// Provider-native model name (`gpt-4-turbo`, `azure/gpt-4`, ...)
    pub model_name: String,
    /// Client-facing alias; routing key when set
    pub alias: Option<String>,
    /// Provider base URL; must pass SSRF validation before registration
    pub api_base: Option<String>,
    /// Executable provider handle with its type tag and capabilities
    pub provider: ProviderHandle,
    /// Static configuration
    pub config: DeploymentConfig,
}

impl Deployment {
    /// Create a deployment with default configuration
    pub fn new(
        id: impl Into<DeploymentId>,
        model_name: impl Into<String>,
        provider: ProviderHandle,
    ) -> Self {
        Self {
            id: id.into(),
            model_name: model_name.into(),
            alias: None,
            api_base: None,
            provider,
            config: DeploymentConfig::default(),
        }
    }

    /// Set the client-facing alias (builder pattern)
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the provider base URL (builder pattern)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    /// Set the configuration (builder pattern)
    pub fn with_config(mut self, config: DeploymentConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the tags (builder pattern)
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.config.tags = tags;
        self
    }

    /// Model key used by the registry: alias if set, else the native name
    pub fn routing_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.model_name)
    }

    /// Provider type tag
    pub fn provider_type(&self) -> &str {
        &self.provider.provider_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::providers::{AdapterCapabilities, CompletionService, ProviderHandle};
    use crate::core::types::{ChatRequest, EmbeddingRequest, EmbeddingResponse, RequestContext};
    use crate::utils::error::{GatewayError, Result};
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Debug)]
    struct NullService;

    #[async_trait]
    impl CompletionService for NullService {
        async fn chat(
            &self,
            _ctx: &RequestContext,
            _request: &ChatRequest,
        ) -> Result<crate::core::providers::ProviderResult> {
            Err(GatewayError::Internal("unused".into()))
        }

        async fn embed(
            &self,
            _ctx: &RequestContext,
            _request: &EmbeddingRequest,
        ) -> Result<EmbeddingResponse> {
            Err(GatewayError::Internal("unused".into()))
        }
    }

    fn handle() -> ProviderHandle {
        ProviderHandle::new(
            "openai",
            AdapterCapabilities {
                chat: true,
                streaming: true,
                embeddings: false,
            },
            Arc::new(NullService),
        )
    }

    #[test]
    fn test_routing_key_prefers_alias() {
        let plain = Deployment::new("d1", "gpt-4-turbo", handle());
        assert_eq!(plain.routing_key(), "gpt-4-turbo");

        let aliased = Deployment::new("d2", "gpt-4-turbo", handle()).with_alias("gpt-4");
        assert_eq!(aliased.routing_key(), "gpt-4");
    }

    #[test]
    fn test_tag_helpers() {
        let deployment = Deployment::new("d1", "gpt-4", handle())
            .with_tags(vec!["fast".into(), "production".into()]);
        assert!(deployment.config.has_tag("fast"));
        assert!(deployment.config.has_all_tags(&["fast".into()]));
        assert!(
            !deployment
                .config
                .has_all_tags(&["fast".into(), "cheap".into()])
        );
        assert!(
            deployment
                .config
                .has_any_tag(&["cheap".into(), "production".into()])
        );
    }
}
