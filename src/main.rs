//! claude-cto server entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use claude_cto::adapters::http::{self, AppState};
use claude_cto::adapters::runtime::{ClaudeCodeConfig, ClaudeCodeRuntime};
use claude_cto::adapters::sqlite::{open_task_db, SqliteOrchestrationStore, SqliteTaskStore};
use claude_cto::domain::models::Config;
use claude_cto::domain::ports::AgentRuntime;
use claude_cto::infrastructure::process::{
    IsolatedRunner, ProcessRegistry, RecoveryService, ServerLock,
};
use claude_cto::infrastructure::{logging, paths, ConfigLoader};
use claude_cto::services::{
    CircuitBreakerConfig, CircuitBreakers, MemoryMonitor, Orchestrator, RetryPolicy,
    SoundNotifier, TaskRunner,
};

#[derive(Parser)]
#[command(name = "claude-cto", version, about = "Fire-and-forget task execution server for Claude Code")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server.
    Serve {
        /// Host to bind.
        #[arg(long, env = "SERVER_HOST")]
        host: Option<String>,
        /// Port to bind.
        #[arg(long, env = "SERVER_PORT")]
        port: Option<u16>,
    },
    /// Run a single task to completion (used by isolated runners).
    #[command(hide = true)]
    RunTask {
        #[arg(long)]
        task_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host, port } => serve(host, port).await,
        Commands::RunTask { task_id } => run_task(task_id).await,
    }
}

async fn serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = ConfigLoader::load()?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let port = config.server.port;

    let _log_guard = logging::init(&config.server.log_level, &paths::log_dir(), true)?;
    tracing::info!(port, "starting claude-cto server");

    // Single instance per port.
    let lock = ServerLock::new(port, paths::lock_dir());
    lock.acquire(true, config.server.kill_duplicate_servers)
        .await
        .context("could not acquire server lock")?;

    let result = run_server(&config).await;

    lock.release();
    result
}

async fn run_server(config: &Config) -> Result<()> {
    let port = config.server.port;
    let (task_store, orch_store) = open_stores(config).await?;

    let registry = Arc::new(ProcessRegistry::new(
        paths::app_dir().join("process_registry.json"),
    ));

    // Recovery runs before the API accepts any request.
    if config.server.cleanup_on_startup {
        let recovery =
            RecoveryService::new(task_store.clone(), Arc::clone(&registry), paths::lock_dir());
        let report = recovery.recover_on_startup(port).await?;
        tracing::info!(?report, "startup recovery finished");
    } else {
        registry.register_server(port).await;
    }

    let breakers = Arc::new(CircuitBreakers::new(
        CircuitBreakerConfig {
            failure_threshold: config.retry.circuit_breaker_threshold,
            cooldown_secs: config.retry.circuit_breaker_cooldown_secs,
            enabled: config.retry.circuit_breaker_enabled,
            ..Default::default()
        },
        paths::app_dir().join("circuit_breakers.json"),
    ));
    let policy = RetryPolicy::from_settings(&config.retry, config.task.max_retries);
    let notifier = Arc::new(SoundNotifier::new());
    let monitor = Arc::new(MemoryMonitor::new(config.resources.clone()));
    let sampler = monitor.spawn_sampler();

    let runtime = Arc::new(ClaudeCodeRuntime::new(ClaudeCodeConfig::default()));
    match runtime.probe().await {
        Ok(true) => tracing::info!("claude CLI is available"),
        _ => tracing::warn!("claude CLI not found; tasks will fail until it is installed"),
    }
    let runner = TaskRunner::new(
        task_store.clone(),
        runtime,
        Arc::clone(&registry),
        Arc::clone(&breakers),
        policy,
        notifier,
        Arc::clone(&monitor),
        paths::task_log_dir(),
        paths::log_dir().join("events.log"),
        Some(config.task.task_memory_limit_mb),
    );
    let orchestrator = Orchestrator::new(task_store.clone(), orch_store.clone(), runner.clone());

    let isolated = config
        .task
        .use_isolated_tasks
        .then(|| Arc::new(IsolatedRunner::new(paths::runner_dir(), paths::runner_log_dir())));

    // Periodic sweeps: breaker state cleanup (required; the file grows
    // without bound otherwise) and registry orphan/age collection.
    let cleanup_days = config.task.cleanup_interval_days as i64;
    let sweep_breakers = Arc::clone(&breakers);
    let breaker_sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            sweep_breakers.cleanup_old_states(cleanup_days).await;
        }
    });
    let sweep_registry = Arc::clone(&registry);
    let registry_sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(600));
        loop {
            ticker.tick().await;
            sweep_registry.cleanup_orphans().await;
            sweep_registry.cleanup_old_entries(7).await;
        }
    });

    let state = Arc::new(AppState {
        tasks: task_store,
        orchestrations: orch_store,
        runner,
        orchestrator,
        config: config.clone(),
        task_log_dir: paths::task_log_dir(),
        isolated,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, port)
        .parse()
        .context("invalid host/port")?;
    let serve_result = http::serve(state, addr, shutdown_signal()).await;

    tracing::info!("shutting down");
    sampler.abort();
    breaker_sweep.abort();
    registry_sweep.abort();
    registry.mark_server_stopped().await;

    serve_result.map_err(|e| anyhow::anyhow!("server error: {e}"))
}

/// Run one task in this process and exit. The isolated runner script
/// invokes this; the subprocess opens its own database connections.
async fn run_task(task_id: i64) -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = ConfigLoader::load()?;
    let (task_store, _orch_store) = open_stores(&config).await?;

    let registry = Arc::new(ProcessRegistry::new(
        paths::app_dir().join("process_registry.json"),
    ));
    let breakers = Arc::new(CircuitBreakers::new(
        CircuitBreakerConfig {
            failure_threshold: config.retry.circuit_breaker_threshold,
            cooldown_secs: config.retry.circuit_breaker_cooldown_secs,
            enabled: config.retry.circuit_breaker_enabled,
            ..Default::default()
        },
        paths::app_dir().join("circuit_breakers.json"),
    ));
    let runner = TaskRunner::new(
        task_store,
        Arc::new(ClaudeCodeRuntime::new(ClaudeCodeConfig::default())),
        registry,
        breakers,
        RetryPolicy::from_settings(&config.retry, config.task.max_retries),
        Arc::new(SoundNotifier::new()),
        Arc::new(MemoryMonitor::new(config.resources.clone())),
        paths::task_log_dir(),
        paths::log_dir().join("events.log"),
        Some(config.task.task_memory_limit_mb),
    );

    runner.run(task_id).await;
    Ok(())
}

async fn open_stores(config: &Config) -> Result<(SqliteTaskStore, SqliteOrchestrationStore)> {
    let pool = open_task_db(&config.database)
        .await
        .context("could not open tasks database")?;
    Ok((
        SqliteTaskStore::new(pool.clone()),
        SqliteOrchestrationStore::new(pool),
    ))
}

/// Resolve on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
