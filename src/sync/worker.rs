//! Background sync worker
//!
//! Drains the queue when connectivity comes back, when the earliest backoff
//! period ends, on a periodic timer while online, and on demand. Read-triggered revalidations run as their own
//! tasks so a slow list call never holds up a drain.

use super::reconciler::Reconciler;
use crate::connectivity::ConnectivityState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Command to send to the sync worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Drain now
    SyncNow,
    /// Refresh one resource in the background
    Revalidate(String),
    Shutdown,
}

pub fn create_command_channel() -> (mpsc::Sender<SyncCommand>, mpsc::Receiver<SyncCommand>) {
    mpsc::channel(100)
}

pub struct SyncWorker {
    reconciler: Arc<Reconciler>,
    command_rx: mpsc::Receiver<SyncCommand>,
    connectivity: watch::Receiver<ConnectivityState>,
    sync_interval: Duration,
}

impl SyncWorker {
    pub fn new(
        reconciler: Arc<Reconciler>,
        command_rx: mpsc::Receiver<SyncCommand>,
        connectivity: watch::Receiver<ConnectivityState>,
        sync_interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            command_rx,
            connectivity,
            sync_interval,
        }
    }

    pub async fn run(mut self) {
        info!("Sync worker started (interval {:?})", self.sync_interval);

        let mut last = *self.connectivity.borrow_and_update();
        let mut sync_interval = tokio::time::interval(self.sync_interval);
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = if last.is_online {
                self.retry_deadline()
            } else {
                None
            };

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::SyncNow) => {
                            self.reconciler.drain().await;
                        }
                        Some(SyncCommand::Revalidate(key)) => {
                            let reconciler = self.reconciler.clone();
                            tokio::spawn(async move {
                                debug!("Revalidating '{}'", key);
                                let _ = reconciler.refresh(&key).await;
                            });
                        }
                        Some(SyncCommand::Shutdown) | None => {
                            info!("Sync worker shutting down");
                            break;
                        }
                    }
                }

                changed = self.connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.connectivity.borrow_and_update();
                    let came_online = state.is_online && !last.is_online;
                    let became_verified = state.verified && !last.verified;
                    last = state;

                    if came_online {
                        info!("Back online, draining queue");
                        self.reconciler.drain().await;
                        self.reconciler.prefetch().await;
                    } else if became_verified {
                        // Actions that required a confirmed connection can go now
                        self.reconciler.drain().await;
                    }
                }

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    debug!("Backoff elapsed, draining queue");
                    self.reconciler.drain().await;
                }

                // Re-arm the backoff timer
                _ = self.reconciler.retry_scheduled() => {}

                _ = sync_interval.tick() => {
                    if last.is_online && !self.reconciler.queue_is_empty() {
                        self.reconciler.try_drain().await;
                    }
                }
            }
        }
    }

    fn retry_deadline(&self) -> Option<Instant> {
        let at = self.reconciler.next_retry_at()?;
        let wait = (at - chrono::Utc::now()).to_std().unwrap_or_default();
        Some(Instant::now() + wait)
    }
}
