// Control-plane configuration.
//
// Constructed once at startup and dependency-injected; no global state.
// External file loading is the embedder's concern.

use serde::{Deserialize, Serialize};

use overseer_types::DeliverMode;

/// Settings for the plan scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Default fan-out for `parallel` plans whose own cap is 0
    pub max_parallel: u32,
    /// Cap on ping-pong rounds
    pub ping_pong_max_rounds: u32,
    /// Consensus quorum; 0 means strict majority
    pub consensus_quorum: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            ping_pong_max_rounds: 3,
            consensus_quorum: 0,
        }
    }
}

/// Settings for the run engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Ring size for stall detection when the profile leaves it unset
    pub stall_threshold: u32,
    /// Per-gate deadline in seconds
    pub quality_gate_timeout_secs: u64,
    pub default_deliver_mode: DeliverMode,
    /// Expected worker heartbeat tick; silence past twice this fails the run
    pub heartbeat_tick_secs: u64,
    /// Grace period between a cancel publish and force-termination
    pub cancel_grace_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stall_threshold: 5,
            quality_gate_timeout_secs: 120,
            default_deliver_mode: DeliverMode::Patch,
            heartbeat_tick_secs: 30,
            cancel_grace_secs: 5,
        }
    }
}

/// Settings for policy resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Profile applied when a step omits one
    pub default_profile: String,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            default_profile: "default".to_string(),
        }
    }
}

/// Immutable configuration for one control-plane instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverseerConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub policy: PolicySettings,
}
