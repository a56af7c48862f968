use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::audit::{
    AuditSink, JsonLinesAuditSink, MemoryAuditSink, StaticUserDirectory, ViolationReporter,
};
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::http::{build_router, HttpServer, RateLimitState};
use gatekeeper::ratelimit::{
    join_background_task, spawn_policy_reloader, AdmissionEngine, ClientIdentifier, CounterStore, MemoryStore,
    PolicyRegistry, PolicyTable, RateLimitAdmin, Reaper,
};

/// Gatekeeper rate limiting service
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Path to a YAML policy table, overriding the configuration
    #[arg(short, long)]
    policies: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Gatekeeper Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatekeeperConfig::load(args.config.as_deref())?;
    if args.policies.is_some() {
        config.rate_limiting.policy_path = args.policies;
    }
    info!(
        http_addr = %config.server.http_addr,
        environment = ?config.environment,
        "Configuration loaded"
    );

    // Policy registry
    let table = match &config.rate_limiting.policy_path {
        Some(path) => PolicyTable::from_file(path)?,
        None => PolicyTable::defaults(),
    };
    info!(policies = table.len(), "Rate limit policies loaded");
    let registry = Arc::new(PolicyRegistry::new(table));

    let cancel = CancellationToken::new();
    let reloader = match (
        &config.rate_limiting.policy_path,
        config.rate_limiting.policy_reload_interval(),
    ) {
        (Some(path), Some(interval)) => Some(spawn_policy_reloader(
            registry.clone(),
            path.clone(),
            interval,
            cancel.clone(),
        )),
        _ => None,
    };

    // Counter store and reaper
    let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
    let reaper = Reaper::spawn(
        store.clone(),
        registry.clone(),
        config.rate_limiting.reap_interval(),
    );

    // Violation reporting
    let sink: Arc<dyn AuditSink> = match &config.audit.log_path {
        Some(path) => Arc::new(JsonLinesAuditSink::open(path).await?),
        None => Arc::new(MemoryAuditSink::new()),
    };
    let users = Arc::new(StaticUserDirectory::new(config.audit.users.clone()));
    let reporter = ViolationReporter::new(sink, users);

    let engine = AdmissionEngine::new(
        registry.clone(),
        ClientIdentifier::from_config(&config.server),
        store.clone(),
    );
    let state = RateLimitState::new(Arc::new(engine), reporter)
        .with_timeout(config.rate_limiting.decision_timeout())
        .with_environment(config.environment);
    let admin = RateLimitAdmin::new(registry, store);

    let server = HttpServer::new(config.server.http_addr, build_router(&state, admin));

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    reaper.shutdown().await;
    cancel.cancel();
    if let Some(reloader) = reloader {
        join_background_task("policy reloader", reloader).await;
    }

    info!("Gatekeeper Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
