//! Agent runtime port - interface to the external agent CLI.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::adapters::runtime::AgentError;
use crate::domain::models::{AgentMessage, AgentRequest};

/// A handle to one open runtime stream.
///
/// Messages arrive in order on the channel; the stream ends when the
/// channel closes. A mid-stream failure is delivered as the final `Err`
/// item before close.
pub struct AgentStream {
    pub messages: mpsc::Receiver<Result<AgentMessage, AgentError>>,
    /// OS pid of the spawned CLI process, when one exists.
    pub pid: Option<u32>,
}

/// Trait for agent runtime implementations.
///
/// The production implementation spawns the Claude Code CLI; tests use a
/// scripted mock. The runtime owns its subprocess for the duration of the
/// stream and must not outlive a dropped receiver.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Runtime name for logs.
    fn name(&self) -> &'static str;

    /// Check the runtime is installed and reachable.
    async fn probe(&self) -> Result<bool, AgentError>;

    /// Open a message stream for one task attempt.
    async fn start(&self, request: AgentRequest) -> Result<AgentStream, AgentError>;
}
