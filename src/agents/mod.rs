//! Registry of connected worker agents.

pub mod registry;

pub use registry::{AgentRegistration, AgentRegistry, AgentSnapshot, SweepReport};
