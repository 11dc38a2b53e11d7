//! Process plumbing: registry, locks, recovery, and isolated runners.

pub mod probe;
pub mod recovery;
pub mod registry;
pub mod runners;
pub mod server_lock;

pub use recovery::{RecoveryReport, RecoveryService};
pub use registry::ProcessRegistry;
pub use runners::{IsolatedRunner, RunnerInfo};
pub use server_lock::{LockError, ServerLock};
