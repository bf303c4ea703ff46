//! Tunables for the offer coordinator and the node router.
//!
//! Keys use the upper-case names of the deployment configuration surface, so a
//! JSON document such as `{"MAX_ITERATION": 30, "ACK_TIMEOUT": 2000}` can be
//! loaded directly. Missing keys fall back to the defaults below.

use bevy_ecs::prelude::Resource;
use serde::{Deserialize, Serialize};

use crate::ecs::NodeId;
use crate::envelope::BroadcastTopic;
use crate::error::ConfigError;

const DEFAULT_MAX_ITERATION: u32 = 60;
const DEFAULT_ITERATION_INTERVAL_MS: u64 = 1_000;
const DEFAULT_INITIAL_RADIUS_M: u32 = 1_000;
const DEFAULT_RADIUS_STEP_M: u32 = 200;
const DEFAULT_MAX_RADIUS_M: u32 = 1_800;
const DEFAULT_TOO_AWAY_M: u32 = 2_000;
const DEFAULT_DRIVER_RESPONSE_TIMEOUT_MS: u64 = 13_000;
const DEFAULT_SAFE_CANCELATION_WINDOW_MS: u64 = 180_000;

const DEFAULT_ACK_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CANDIDATE_GATHER_TIMEOUT_MS: u64 = 300;

/// Offer coordinator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Resource)]
#[serde(default)]
pub struct DispatchConfig {
    #[serde(rename = "MAX_ITERATION")]
    pub max_iteration: u32,
    #[serde(rename = "ITERATION_INTERVAL")]
    pub iteration_interval_ms: u64,
    #[serde(rename = "INITIAL_RADIUS_SIZE")]
    pub initial_radius_m: u32,
    #[serde(rename = "ADD_RADIUS_SIZE_EACH_ITERATION")]
    pub radius_step_m: u32,
    #[serde(rename = "MAX_RADIUS_SIZE")]
    pub max_radius_m: u32,
    /// Hard distance ceiling applied on top of the iteration radius.
    #[serde(rename = "TOO_AWAY")]
    pub too_away_m: u32,
    #[serde(rename = "DRIVER_RESPONSE_TIMEOUT")]
    pub driver_response_timeout_ms: u64,
    #[serde(rename = "SAFE_CANCELATION_WINDOW")]
    pub safe_cancelation_window_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_iteration: DEFAULT_MAX_ITERATION,
            iteration_interval_ms: DEFAULT_ITERATION_INTERVAL_MS,
            initial_radius_m: DEFAULT_INITIAL_RADIUS_M,
            radius_step_m: DEFAULT_RADIUS_STEP_M,
            max_radius_m: DEFAULT_MAX_RADIUS_M,
            too_away_m: DEFAULT_TOO_AWAY_M,
            driver_response_timeout_ms: DEFAULT_DRIVER_RESPONSE_TIMEOUT_MS,
            safe_cancelation_window_ms: DEFAULT_SAFE_CANCELATION_WINDOW_MS,
        }
    }
}

impl DispatchConfig {
    /// `min(INITIAL_RADIUS + i * STEP, MAX_RADIUS)`.
    pub fn radius_for_iteration(&self, iteration: u32) -> u32 {
        let grown = u64::from(self.initial_radius_m)
            + u64::from(iteration) * u64::from(self.radius_step_m);
        grown.min(u64::from(self.max_radius_m)) as u32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iteration == 0 {
            return Err(ConfigError::Invalid("MAX_ITERATION must be positive".into()));
        }
        if self.iteration_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "ITERATION_INTERVAL must be positive".into(),
            ));
        }
        if self.initial_radius_m > self.max_radius_m {
            return Err(ConfigError::Invalid(format!(
                "INITIAL_RADIUS_SIZE {} exceeds MAX_RADIUS_SIZE {}",
                self.initial_radius_m, self.max_radius_m
            )));
        }
        if self.driver_response_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "DRIVER_RESPONSE_TIMEOUT must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Node-level settings: router timeouts, identity and the republish allow-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    #[serde(rename = "NODE_ID")]
    pub node_id: Option<NodeId>,
    /// Seed for node and connection identifiers.
    #[serde(rename = "SEED")]
    pub seed: u64,
    #[serde(rename = "ACK_TIMEOUT")]
    pub ack_timeout_ms: u64,
    #[serde(rename = "CANDIDATE_GATHER_TIMEOUT")]
    pub candidate_gather_timeout_ms: u64,
    #[serde(rename = "REPUBLISH_EVENTS")]
    pub republish: Vec<BroadcastTopic>,
    #[serde(flatten)]
    pub dispatch: DispatchConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            seed: 0,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            candidate_gather_timeout_ms: DEFAULT_CANDIDATE_GATHER_TIMEOUT_MS,
            republish: vec![BroadcastTopic::RiderPosition, BroadcastTopic::DriverPosition],
            dispatch: DispatchConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatch.validate()?;
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("ACK_TIMEOUT must be positive".into()));
        }
        if self.candidate_gather_timeout_ms >= self.dispatch.iteration_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "CANDIDATE_GATHER_TIMEOUT {} must be shorter than ITERATION_INTERVAL {}",
                self.candidate_gather_timeout_ms, self.dispatch.iteration_interval_ms
            )));
        }
        Ok(())
    }
}
