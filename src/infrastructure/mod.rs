//! Infrastructure: configuration, logging, paths, and process plumbing.

pub mod config;
pub mod logging;
pub mod paths;
pub mod process;
pub mod task_logger;

pub use config::{ConfigError, ConfigLoader};
pub use task_logger::TaskLogger;
