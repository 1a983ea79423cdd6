//! Sync scheduler
//!
//! One loop owns every trigger that refreshes the hub:
//!
//! ```text
//!  interval timer per polling source ──┐
//!                                      ├──► hub.invalidate(key) on a tracked task
//!  Invalidator (push, manual) ─────────┘
//! ```
//!
//! Triggers for the same source that overlap collapse in the hub's
//! single-flight, so a push arriving during a poll costs no extra fetch.

use super::cache::SourceKey;
use super::hub::DataSyncHub;
use crate::error::Result;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, info};

/// What caused an invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Poll interval elapsed
    Poll,
    /// Push notification from the host
    Push,
    /// Explicit request from a consumer
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Poll => f.write_str("poll"),
            Trigger::Push => f.write_str("push"),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

/// Request to refresh one source, bypassing its dedupe window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    pub key: SourceKey,
    pub trigger: Trigger,
}

/// Cloneable handle feeding the scheduler's invalidation queue
#[derive(Debug, Clone)]
pub struct Invalidator {
    tx: mpsc::UnboundedSender<Invalidation>,
}

impl Invalidator {
    /// Queue an invalidation
    ///
    /// Returns `false` once the scheduler is gone.
    pub fn invalidate(&self, key: SourceKey, trigger: Trigger) -> bool {
        self.tx.send(Invalidation { key, trigger }).is_ok()
    }
}

/// Drives hub refreshes from poll timers and queued invalidations
pub struct SyncScheduler {
    hub: Arc<DataSyncHub>,
    inbox: mpsc::UnboundedReceiver<Invalidation>,
}

impl SyncScheduler {
    /// Create a scheduler for `hub`
    ///
    /// # Returns
    ///
    /// A tuple of (scheduler, invalidator) where invalidator feeds the queue
    pub fn new(hub: Arc<DataSyncHub>) -> (Self, Invalidator) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { hub, inbox: rx }, Invalidator { tx })
    }

    /// Run until Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run until `shutdown_rx` fires (or its sender is dropped)
    ///
    /// With `None`, behaves like [`run`](Self::run).
    pub async fn run_with_shutdown(self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(mut self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let mut timers = self.poll_timers();
        let mut tasks = JoinSet::new();
        let mut inbox_open = true;

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        };
        tokio::pin!(shutdown);

        info!("Sync scheduler started ({} polled sources)", timers.len());

        loop {
            tokio::select! {
                Some((key, _)) = timers.next(), if !timers.is_empty() => {
                    self.dispatch(&mut tasks, Invalidation { key, trigger: Trigger::Poll });
                }

                received = self.inbox.recv(), if inbox_open => match received {
                    Some(invalidation) => self.dispatch(&mut tasks, invalidation),
                    None => {
                        debug!("All invalidators dropped, polling only");
                        inbox_open = false;
                    }
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Refresh task failed: {}", e);
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(timers);

        // Let in-flight refreshes settle
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Refresh task failed: {}", e);
            }
        }

        info!("Sync scheduler stopped");
        Ok(())
    }

    fn poll_timers(&self) -> StreamMap<SourceKey, IntervalStream> {
        let mut timers = StreamMap::new();

        for key in SourceKey::ALL {
            let policy = self.hub.policy(key);
            if !policy.polls() {
                continue;
            }

            let mut interval = tokio::time::interval(Duration::from_millis(policy.poll_interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timers.insert(key, IntervalStream::new(interval));
        }

        timers
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, invalidation: Invalidation) {
        debug!(
            source = %invalidation.key,
            trigger = %invalidation.trigger,
            "Invalidating source"
        );

        let hub = Arc::clone(&self.hub);
        tasks.spawn(async move {
            hub.invalidate(invalidation.key).await;
        });
    }
}
