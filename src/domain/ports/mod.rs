//! Domain ports: trait seams between the engine and the outside world.

pub mod agent_runtime;

pub use agent_runtime::{AgentRuntime, AgentStream};
