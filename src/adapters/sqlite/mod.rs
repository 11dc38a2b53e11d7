//! SQLite persistence adapters.

pub mod connection;
pub mod migrations;
pub mod orchestration_store;
pub mod task_store;

pub use connection::{connect_in_memory, database_path, open_task_db, open_test_db, DatabaseError};
pub use migrations::{all_embedded_migrations, migrate_to_latest, Migration, Migrator};
pub use orchestration_store::SqliteOrchestrationStore;
pub use task_store::SqliteTaskStore;
