//! Stream recovery configuration

use serde::{Deserialize, Serialize};

/// What to do when a provider stream fails mid-flight
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamRecoveryMode {
    /// Surface the error immediately
    #[default]
    Off,
    /// Reissue the original request on another deployment
    Retry,
    /// Continue from the accumulated partial assistant message
    Append,
}

/// Stream recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecoverySettings {
    /// Recovery mode
    #[serde(default)]
    pub mode: StreamRecoveryMode,
    /// Accumulation cap in bytes; 0 disables accumulation (and thereby
    /// recovery for requests that would need it)
    #[serde(default = "default_max_accumulated_bytes")]
    pub max_accumulated_bytes: usize,
}

impl Default for StreamRecoverySettings {
    fn default() -> Self {
        Self {
            mode: StreamRecoveryMode::Off,
            max_accumulated_bytes: default_max_accumulated_bytes(),
        }
    }
}

fn default_max_accumulated_bytes() -> usize {
    262_144
}
