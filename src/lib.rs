//! claude-cto: fire-and-forget execution server for long-running Claude
//! Code tasks.
//!
//! A client submits a task (prompt + working directory + model) and gets
//! an id back; the server persists it, runs the Claude CLI in an isolated
//! subprocess, streams progress into a per-task log and the database
//! cache, and finalizes a terminal outcome. Tasks can be grouped into an
//! orchestration: a DAG where a task starts only after its declared
//! predecessors succeed.

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;
