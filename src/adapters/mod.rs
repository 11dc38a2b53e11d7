//! Adapters: sqlite persistence, the HTTP API, and the agent runtime.

pub mod http;
pub mod runtime;
pub mod sqlite;
