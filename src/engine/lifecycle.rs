//! Background loop: start, run, shutdown.
//!
//! The loop wakes on two triggers: an offline→online transition from the
//! network monitor, and a fixed-interval timer as a safety net against
//! missed connectivity events. Both go through
//! [`SyncEngine::request_sync`], so they never run two passes at once.

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use super::SyncEngine;

/// Running background loop. Dropping the handle also stops the loop, but
/// without waiting for it.
pub struct SyncHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop. A pass already in flight runs to completion first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            debug!(error = %e, "Sync loop task ended abnormally");
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl SyncEngine {
    /// Spawn the background loop.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let (shutdown, rx) = oneshot::channel();
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move { engine.run(rx).await });
        SyncHandle { shutdown, task }
    }

    #[tracing::instrument(skip(self, shutdown))]
    async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
        let mut network = self.network.watch();
        let mut was_connected = *network.borrow_and_update();
        let mut timer = self.sync_interval.map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });

        info!(interval = ?self.sync_interval, online = was_connected, "Sync loop running");

        // Anything left over from a previous run goes out right away
        if was_connected && self.queue.pending_count().await > 0 {
            self.request_sync().await;
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                changed = network.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connected = *network.borrow_and_update();
                    if connected && !was_connected {
                        info!("Back online, syncing");
                        self.request_sync().await;
                    }
                    was_connected = connected;
                }

                _ = next_tick(&mut timer) => {
                    debug!("Periodic sync");
                    self.request_sync().await;
                }
            }
        }

        info!("Sync loop stopped");
    }
}
