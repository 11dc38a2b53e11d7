//! Crash-and-recover behavior: store reconciliation, registry cleanup,
//! and the per-port server lock.

mod common;

use std::sync::Arc;

use claude_cto::adapters::sqlite::{open_test_db, SqliteTaskStore};
use claude_cto::domain::models::{NewTask, TaskStatus};
use claude_cto::infrastructure::process::{ProcessRegistry, RecoveryService, ServerLock};

async fn store() -> SqliteTaskStore {
    SqliteTaskStore::new(open_test_db().await.unwrap())
}

fn input() -> NewTask {
    NewTask::validate("recoverable long running job", "/tmp", None, None).unwrap()
}

#[tokio::test]
async fn crash_and_recover_marks_orphaned_task_failed() {
    let store = store().await;
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ProcessRegistry::new(dir.path().join("registry.json")));

    // Simulate a task left RUNNING by a crashed server: its recorded
    // runner pid is gone.
    let task = store.create_task(&input(), dir.path()).await.unwrap();
    store
        .update_task_status(task.id, TaskStatus::Running)
        .await
        .unwrap();
    store.set_task_pid(task.id, 99_999_990).await.unwrap();
    registry.register_task(task.id, 99_999_990).await;

    let recovery = RecoveryService::new(store.clone(), Arc::clone(&registry), dir.path().join("locks"));
    let report = recovery.recover_on_startup(8200).await.unwrap();
    assert_eq!(report.tasks_marked_failed, 1);

    let task = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("Recovery"));

    // The registry entry is no longer running.
    let entry = registry.task_entry(task.id).await.unwrap();
    assert_ne!(
        entry.status,
        claude_cto::domain::models::ProcessState::Running
    );

    // Second recovery run changes nothing.
    let second = recovery.recover_on_startup(8200).await.unwrap();
    assert_eq!(second.tasks_marked_failed, 0);
    assert_eq!(second.orphaned_processes_killed, 0);
}

#[tokio::test]
async fn registry_survives_restart_and_reconciles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");

    {
        let registry = ProcessRegistry::new(path.clone());
        registry.register_server(8201).await;
        registry.register_task(11, 99_999_989).await;
    }

    // "Restart": a fresh registry over the same file still knows the task.
    let registry = ProcessRegistry::new(path);
    let entry = registry.task_entry(11).await.unwrap();
    assert_eq!(entry.pid, 99_999_989);

    // The dead pid is downgraded during the orphan sweep.
    registry.cleanup_orphans().await;
    let entry = registry.task_entry(11).await.unwrap();
    assert_ne!(
        entry.status,
        claude_cto::domain::models::ProcessState::Running
    );
}

#[tokio::test]
async fn server_lock_is_exclusive_per_port() {
    let dir = tempfile::tempdir().unwrap();
    let lock_dir = dir.path().to_path_buf();

    let first = ServerLock::new(8202, lock_dir.clone());
    first.acquire(false, false).await.unwrap();

    // A second acquire without kill_existing fails while the holder (this
    // process) is alive.
    let second = ServerLock::new(8202, lock_dir.clone());
    assert!(second.acquire(false, false).await.is_err());

    first.release();

    // After release the port is free again.
    let third = ServerLock::new(8202, lock_dir);
    third.acquire(false, false).await.unwrap();
    third.release();
}

#[tokio::test]
async fn stale_locks_are_cleaned_on_recovery() {
    let store = store().await;
    let dir = tempfile::tempdir().unwrap();
    let lock_dir = dir.path().join("locks");
    std::fs::create_dir_all(&lock_dir).unwrap();
    std::fs::write(lock_dir.join("server-8203.pid"), "99999988").unwrap();

    let registry = Arc::new(ProcessRegistry::new(dir.path().join("registry.json")));
    let recovery = RecoveryService::new(store, registry, lock_dir.clone());
    let report = recovery.recover_on_startup(8203).await.unwrap();
    assert_eq!(report.stale_locks_cleaned, 1);
    assert!(!lock_dir.join("server-8203.pid").exists());
}
