//! Agent runtime adapters.

pub mod claude_code;
pub mod errors;
pub mod mock;

pub use claude_code::{ClaudeCodeConfig, ClaudeCodeRuntime, ENTRYPOINT_ENV, ENTRYPOINT_VALUE};
pub use errors::{exit_code_meaning, AgentError};
pub use mock::{MockAttempt, MockRuntime, MockStep};
