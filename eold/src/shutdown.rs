//! Shutdown handling for graceful daemon termination
//!
//! Brings the station to a safe state before the daemon exits: queued work
//! is dropped, the running operation is cancelled (a running test still
//! makes its devices safe), then the engine drains, makes every device safe
//! and disconnects it.

use eol_engine::ExecutionEngine;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Stop the engine and leave the hardware in its safe state.
///
/// The engine shutdown blocks on the worker thread, so it runs on the
/// blocking pool. If `interrupt` resolves first (a second Ctrl+C, say) the
/// engine is emergency stopped and the shutdown then finishes.
///
/// # Arguments
///
/// * `engine` - The running engine
/// * `interrupt` - Resolves when the operator wants an immediate stop
pub async fn stop_station<F>(engine: Arc<ExecutionEngine>, interrupt: F)
where
    F: Future<Output = ()>,
{
    let dropped = engine.cancel_all();
    if dropped > 0 {
        info!("Dropped {} queued operation(s)", dropped);
    }

    let worker = engine.clone();
    let mut shutdown = tokio::task::spawn_blocking(move || worker.shutdown());

    let finished = tokio::select! {
        biased;
        _ = interrupt => None,
        joined = &mut shutdown => Some(joined),
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            warn!("Shutdown interrupted, tripping emergency stop");
            let report = engine.emergency_stop();
            if !report.is_clean() {
                error!("{} device(s) failed to stop", report.failures.len());
            }
            shutdown.await
        }
    };

    match joined {
        Ok(Ok(())) => info!("Station stopped, all devices safe and disconnected"),
        Ok(Err(e)) => error!("Engine shutdown failed: {}", e),
        Err(e) => error!("Engine shutdown task failed: {}", e),
    }
}
