pub mod broker;
pub mod clock;
pub mod cluster;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod ecs;
pub mod envelope;
pub mod error;
pub mod node;
pub mod registry;
pub mod router;
pub mod runner;
pub mod selector;
pub mod spatial;
pub mod systems;
pub mod telemetry;
pub mod wire;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;
