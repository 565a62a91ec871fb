//! Routing engine
//!
//! Deployment catalog, live stats, selection strategies, and the
//! failure-driven cooldown policy.

pub mod cooldown;
pub mod deployment;
pub mod distributed;
pub mod error;
pub mod registry;
pub mod stats;
pub mod strategy;
pub mod strategy_impl;

pub use cooldown::{CooldownManager, TIMEOUT_PENALTY_LATENCY_MS};
pub use deployment::{Deployment, DeploymentConfig, DeploymentId};
pub use distributed::{DistributedStatsStore, InMemoryStatsBackend, StatsBackend};
pub use error::{CooldownReason, RouterError};
pub use registry::DeploymentRegistry;
pub use stats::{DeploymentStats, HISTORY_SIZE, LocalStatsStore, StatsStore, minute_key};
pub use strategy::{Router, RoutingStrategy};
pub use strategy_impl::Candidate;
