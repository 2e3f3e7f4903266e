use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use task_relay::bridge::{self, BridgeState};
use task_relay::config::{CliOverrides, Config, StorageKind};
use task_relay::events::EventBus;
use task_relay::llm::create_provider;
use task_relay::manager::{spawn_janitor, JobManager};
use task_relay::mcp::{run_stdio, McpServer};
use task_relay::runner::{AnswerRunner, RoleLibrary};
use task_relay::store::{LibSqlBackend, Storage};
use task_relay::worker::{
    ArtifactStore, CommandExecutor, ExecutorBackend, UnconfiguredExecutor, WorkerDeps, WorkerPool,
};

#[derive(Parser, Debug)]
#[command(name = "task-relay", version, about = "Task-relay scheduler")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler: workers, HTTP bridge, answer runner, MCP stdio.
    Serve {
        /// Deployment profile.
        #[arg(long, value_name = "dev|staging|prod")]
        profile: Option<String>,

        /// Directory holding profile files and role overrides.
        #[arg(long, value_name = "PATH")]
        config_dir: Option<PathBuf>,

        /// Persistence backend.
        #[arg(long, value_name = "memory|sqlite")]
        storage: Option<String>,

        /// Database file for --storage sqlite.
        #[arg(long, value_name = "PATH")]
        sqlite: Option<PathBuf>,

        /// Control transport (only stdio is supported).
        #[arg(long, default_value = "stdio")]
        transport: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let exit = match cli.cmd {
        Command::Serve {
            profile,
            config_dir,
            storage,
            sqlite,
            transport,
        } => {
            if transport != "stdio" {
                error!(transport, "Unsupported transport");
                std::process::exit(1);
            }
            let overrides = CliOverrides {
                profile,
                config_dir,
                storage,
                sqlite,
            };
            match Config::resolve(&overrides) {
                Ok(config) => serve(config).await,
                Err(e) => {
                    error!("{e}");
                    std::process::exit(1);
                }
            }
        }
    };
    std::process::exit(exit);
}

async fn serve(config: Config) -> i32 {
    info!(
        profile = config.profile.as_str(),
        port = config.bridge.port,
        workers = config.worker.max_concurrency,
        "task-relay v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    // Storage kernel.
    let store: Arc<dyn Storage> = match config.storage {
        StorageKind::Memory => match LibSqlBackend::new_memory().await {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                error!("Failed to open in-memory storage: {e}");
                return 1;
            }
        },
        StorageKind::Sqlite => {
            let Some(path) = config.sqlite_path.clone() else {
                error!("--storage sqlite requires a database path");
                return 1;
            };
            match LibSqlBackend::new_local(&path).await {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    error!("Failed to open database: {e}");
                    return 1;
                }
            }
        }
    };

    let bus = EventBus::default();
    let manager = Arc::new(JobManager::new(store, bus.clone()));
    let artifacts = Arc::new(ArtifactStore::new(config.artifact_root.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Maintenance loop: TTL expiry, stale leases, ask timeouts, cache purge.
    let janitor = spawn_janitor(Arc::clone(&manager), &config, shutdown_rx.clone());

    // Worker pool.
    let executor: Arc<dyn ExecutorBackend> = match &config.worker.executor_command {
        Some(command) => {
            Arc::new(CommandExecutor::new(command.clone()).with_facts(config.facts.clone()))
        }
        None => {
            warn!("No executor command configured; jobs will fail until one is set");
            Arc::new(UnconfiguredExecutor)
        }
    };
    let pool = WorkerPool::spawn(
        WorkerDeps {
            manager: Arc::clone(&manager),
            executor,
            artifacts: Arc::clone(&artifacts),
            config: config.worker.clone(),
        },
        shutdown_rx.clone(),
    );

    // Answer runner (LLM-backed).
    let runner_handle = if config.runner.enabled {
        let roles = match RoleLibrary::load(config.config_dir.as_deref()) {
            Ok(roles) => Arc::new(roles),
            Err(e) => {
                error!("Failed to load role definitions: {e}");
                return 1;
            }
        };
        let llm = match create_provider(&config.runner) {
            Ok(llm) => llm,
            Err(e) => {
                error!("Failed to create LLM provider: {e}");
                return 1;
            }
        };
        let runner = Arc::new(AnswerRunner::new(
            Arc::clone(&manager),
            llm,
            roles,
            config.runner.clone(),
        ));
        Some(runner.spawn(shutdown_rx.clone()))
    } else {
        info!("Answer runner disabled");
        None
    };

    // HTTP bridge.
    let listener = match TcpListener::bind(("127.0.0.1", config.bridge.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = config.bridge.port, "Failed to bind bridge: {e}");
            return 1;
        }
    };
    let bridge_state = BridgeState {
        manager: Arc::clone(&manager),
        config: config.bridge.clone(),
        shutdown: shutdown_rx.clone(),
    };
    let bridge_handle = tokio::spawn(bridge::serve(
        bridge_state,
        listener,
        shutdown_rx.clone(),
    ));

    // MCP control surface over stdio.
    let mcp = McpServer::new(Arc::clone(&manager), artifacts);
    let mcp_shutdown = shutdown_rx.clone();
    let mcp_handle = tokio::spawn(async move { run_stdio(&mcp, mcp_shutdown).await });

    // Run until a signal or stdin EOF ends the process.
    let exit = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            0
        }
        result = mcp_handle => {
            match result {
                Ok(Ok(())) => {
                    info!("MCP transport closed");
                    0
                }
                Ok(Err(e)) => {
                    error!("MCP transport failed: {e}");
                    2
                }
                Err(e) => {
                    error!("MCP task panicked: {e}");
                    2
                }
            }
        }
    };

    let _ = shutdown_tx.send(true);
    pool.join().await;
    janitor.abort();
    if let Some(handle) = runner_handle {
        let _ = handle.await;
    }
    if let Ok(Err(e)) = bridge_handle.await {
        warn!("Bridge shutdown error: {e}");
    }

    info!("task-relay stopped");
    exit
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
