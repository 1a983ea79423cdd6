//! Events emitted by the DataSyncHub

use super::cache::SourceKey;
use tokio::sync::mpsc;
use tracing::warn;

/// Why a refresh did not reach the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A fetch started within the dedupe window; the cached value was served
    DedupeWindow,
    /// A fetch was already in flight; the caller joined it
    JoinedInFlight,
}

/// Events emitted by the DataSyncHub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A fetch was started against the backend
    RefreshStarted {
        source: SourceKey,
        /// The dedupe window was bypassed
        forced: bool,
    },

    /// A fetch settled with a fresh value
    RefreshSucceeded { source: SourceKey },

    /// Every attempt failed and the fallback chain was applied
    FallbackApplied {
        source: SourceKey,
        error: String,
        /// Whether a value was replaced (false: last known value kept)
        replaced: bool,
    },

    /// A refresh was answered without a new fetch
    RefreshSkipped { source: SourceKey, reason: SkipReason },
}

/// Send an event, dropping it when the channel is full
pub(crate) fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    // Refreshing never waits on event consumers. A closed channel means
    // nobody listens, which is not worth a warning.
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
        warn!("Sync event channel full, dropping event. Consider increasing event_channel_capacity.");
    }
}
