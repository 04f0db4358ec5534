use std::sync::Arc;
use std::time::Duration;

use conductor::cache::MemoryCache;
use conductor::config::OrchestratorConfig;
use conductor::orchestrator::Orchestrator;
use conductor::store::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = OrchestratorConfig::default();
    if let Some(secs) = env_u64("CONDUCTOR_HEARTBEAT_SECS") {
        config.heartbeat_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = env_u64("CONDUCTOR_SCHEDULER_SECS") {
        config.scheduler_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = env_u64("CONDUCTOR_CANCEL_GRACE_SECS") {
        config.cancel_grace = Duration::from_secs(secs);
    }

    eprintln!("⚙️  Conductor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Heartbeat interval: {:?}", config.heartbeat_interval);
    eprintln!("   Scheduler interval: {:?}", config.scheduler_interval);
    eprintln!("   Store: in-memory (wire a durable StateStore for production)");

    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let orchestrator = Orchestrator::new(store, cache, config);

    let loops = orchestrator.spawn_loops();
    tracing::info!("Orchestrator running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    for handle in loops {
        handle.abort();
    }
    Ok(())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
