//! The dispatch loop: find eligible work, claim it, hand it to a
//! supervisor.
//!
//! The loop is deliberately tolerant — any error in a tick is logged and
//! the next tick happens anyway. A daemon that stops dispatching is worse
//! than a daemon that skips a beat.

use std::sync::Arc;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::daemon::Daemon;
use crate::error::PybsError;
use crate::supervisor;

/// Run the dispatch loop until cancelled.
///
/// Starts with a warm-up delay to absorb startup flapping, then ticks:
/// claim as long as claims succeed, sleep one tick interval when the queue
/// has nothing for this node.
pub async fn run(daemon: Arc<Daemon>, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = sleep(daemon.warmup) => {}
    }
    info!(node = %daemon.node, "dispatcher running");

    loop {
        match dispatch_once(&daemon).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => warn!(error = %e, "dispatch tick failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("dispatcher stopped");
                return;
            }
            _ = sleep(daemon.tick) => {}
        }
    }
}

/// One dispatch attempt: refresh the free-CPU count, claim the best
/// eligible job, launch its supervisor. Returns whether a job was claimed.
pub async fn dispatch_once(daemon: &Arc<Daemon>) -> Result<bool, PybsError> {
    let used = daemon
        .capacity
        .used(daemon.store.as_ref(), &daemon.node)
        .await?;
    let free = daemon.capacity.total() - used;
    if free <= 0 {
        return Ok(false);
    }

    let free = free.min(i32::MAX as i64) as i32;
    let Some(job) = daemon.store.claim_next(&daemon.node, free).await? else {
        return Ok(false);
    };

    daemon.capacity.charge(job.ncpus);
    info!(job_id = job.id, name = %job.name, ncpus = job.ncpus, "claimed job");
    supervisor::spawn(daemon, &job);
    Ok(true)
}
