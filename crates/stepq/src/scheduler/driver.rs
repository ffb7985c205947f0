//! The scheduler loop
//!
//! One logical driver per queue: reserve the next runnable task, execute
//! it, repeat. When nothing is runnable the loop parks until the nearest
//! step timer fires, a write pokes it (dispatch, cancel, pipe event), or
//! shutdown is signalled. Program functions run serialized on this loop;
//! parallelism across queues comes from running one loop per queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::executor;
use crate::queue::QueueInner;

pub(crate) async fn run(queue: Arc<QueueInner>, mut shutdown: watch::Receiver<bool>) {
    info!(queue = %queue.id, "scheduler loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match queue.storage.start_next_task(&queue.id).await {
            Ok(Some(picked)) => {
                if picked.has_more {
                    debug!(queue = %queue.id, "more tasks ready after reservation");
                }
                executor::execute(&queue, picked.task, picked.steps).await;
            }
            Ok(None) => {
                let wake = match queue.storage.next_future_task(&queue.id).await {
                    Ok(wake) => wake,
                    Err(e) => {
                        error!(queue = %queue.id, "timer query failed: {e}");
                        Some(1.0)
                    }
                };
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = idle(wake) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                error!(queue = %queue.id, "task reservation failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    info!(queue = %queue.id, "scheduler loop stopped");
}

/// Sleep until the nearest future timer, or forever when there is none.
async fn idle(wake: Option<f64>) {
    match wake {
        Some(seconds) => tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await,
        None => std::future::pending().await,
    }
}
