//! Daemon lifecycle
//!
//! Connect to the KV store (degrading to the in-memory fallback when the
//! remote is unreachable), reclaim zombie children from a previous run,
//! start the scheduler loops, and serve until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use tracing::{info, warn};

use kvstore::{FailoverKv, Kv, RedisKv};

use crate::config::Config;
use crate::service::JobService;

/// Shutdown grace for in-flight assistant children
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the KV layer from config
pub async fn connect_kv(config: &Config) -> Arc<dyn Kv> {
    match &config.kv.url {
        Some(url) => match RedisKv::connect(url).await {
            Ok(remote) => {
                info!(%url, "connected to remote kv store");
                Arc::new(FailoverKv::new(Arc::new(remote)))
            }
            Err(e) => {
                warn!(%url, error = %e, "remote kv store unreachable at startup, running on in-memory fallback");
                Arc::new(FailoverKv::memory_only())
            }
        },
        None => {
            info!("no kv url configured, running on in-memory store");
            Arc::new(FailoverKv::memory_only())
        }
    }
}

/// Run the daemon until SIGINT/SIGTERM
pub async fn run(config: Config) -> Result<()> {
    let kv = connect_kv(&config).await;
    let service = JobService::start(kv, config);

    let reclaimed = service
        .reclaim_zombies()
        .await
        .map_err(|e| eyre!("zombie reclamation failed: {}", e))?;
    info!(?reclaimed, "startup reclamation done");

    info!("studiod serving");
    wait_for_shutdown_signal().await?;

    service.shutdown(SHUTDOWN_TIMEOUT).await;
    info!("studiod stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
    }
    Ok(())
}
