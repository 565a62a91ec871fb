//! Deployment registry
//!
//! The only source of truth for "what deployments exist for this model".
//! Strategies never cache its contents; queries return snapshots copied
//! under a read lock.

use super::deployment::{Deployment, DeploymentId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Catalog of `model -> ordered deployments`
///
/// The model key is the deployment alias when set, otherwise the
/// provider-native model name. Registration appends, deregistration
/// removes by id. A generation counter bumps on every change so
/// in-flight retries can observe that the catalog moved underneath them.
#[derive(Debug, Default)]
pub struct DeploymentRegistry {
    models: RwLock<HashMap<String, Vec<Deployment>>>,
    generation: AtomicU64,
}

impl DeploymentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deployment under its routing key
    pub fn register(&self, deployment: Deployment) {
        let key = deployment.routing_key().to_string();
        let mut models = self.models.write();
        models.entry(key.clone()).or_default().push(deployment);
        drop(models);
        self.generation.fetch_add(1, Ordering::Relaxed);
        info!(model = %key, "registered deployment");
    }

    /// Register after validating the base URL against SSRF policy
    pub fn register_checked(
        &self,
        deployment: Deployment,
        policy: &crate::config::ssrf::SsrfPolicy,
    ) -> Result<(), String> {
        if let Some(api_base) = &deployment.api_base {
            crate::config::ssrf::validate_base_url(api_base, policy)?;
        }
        self.register(deployment);
        Ok(())
    }

    /// Remove a deployment by id; returns whether anything was removed
    pub fn deregister(&self, deployment_id: &str) -> bool {
        let mut models = self.models.write();
        let mut removed = false;
        models.retain(|_, deployments| {
            let before = deployments.len();
            deployments.retain(|d| d.id != deployment_id);
            removed |= deployments.len() != before;
            !deployments.is_empty()
        });
        drop(models);
        if removed {
            self.generation.fetch_add(1, Ordering::Relaxed);
            debug!(deployment_id, "deregistered deployment");
        }
        removed
    }

    /// Snapshot of the deployments serving a model
    pub fn deployments_for(&self, model: &str) -> Vec<Deployment> {
        self.models.read().get(model).cloned().unwrap_or_default()
    }

    /// Look up one deployment by id
    pub fn deployment(&self, deployment_id: &str) -> Option<Deployment> {
        self.models
            .read()
            .values()
            .flatten()
            .find(|d| d.id == deployment_id)
            .cloned()
    }

    /// All model keys currently served
    pub fn models(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.models.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// All registered deployment ids
    pub fn deployment_ids(&self) -> Vec<DeploymentId> {
        self.models
            .read()
            .values()
            .flatten()
            .map(|d| d.id.clone())
            .collect()
    }

    /// Catalog generation, bumped on every register/deregister
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}
