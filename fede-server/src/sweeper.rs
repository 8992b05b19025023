use std::time::Duration;

use fede_core::FedeEngine;
use tokio::sync::broadcast;

/// Periodically drop idle sessions until shutdown.
pub async fn run_session_sweeper(engine: FedeEngine, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = engine.evict_idle_sessions();
                if evicted > 0 {
                    tracing::debug!(evicted = evicted, "Evicted idle sessions");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Session sweeper stopping");
                break;
            }
        }
    }
}
