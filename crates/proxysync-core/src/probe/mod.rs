//! Latency probing
//!
//! The LatencyProbeManager owns one delay record per `(proxy, group)` pair
//! that has at least one listener. Records live exactly as long as their
//! listeners:
//!
//! ```text
//!  register ──► record created / reset to NotTested ──► listeners notified
//!  probe    ──► Testing ──► backend ──► TimedOut | Errored | Measured(ms)
//!  unregister (last listener) ──► record evicted, late results discarded
//! ```
//!
//! A probe runs on its own task. Dropping the caller does not cancel it;
//! removing the listeners does (the result is then discarded).

use crate::config::ProbeConfig;
use crate::model::is_reserved_probe_name;
use crate::topology::ProxyGroup;
use crate::traits::CoreBackend;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Raw values above this are the backend's error sentinel
pub const ERROR_SENTINEL_THRESHOLD: u64 = 100_000;

/// Identifies one delay record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProbeKey {
    pub proxy: String,
    pub group: String,
}

impl ProbeKey {
    pub fn new(proxy: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            proxy: proxy.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for ProbeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.proxy, self.group)
    }
}

/// Latency of one node as seen from one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DelayState {
    NotTested,
    Testing,
    TimedOut,
    Errored,
    Measured(u64),
}

impl DelayState {
    /// Whether a probe has finished for this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DelayState::TimedOut | DelayState::Errored | DelayState::Measured(_)
        )
    }
}

/// Classify a raw delay reported by the backend
///
/// Error sentinels are checked before timeouts, so a sentinel above the
/// timeout still reads as an error.
pub fn classify_delay(value: u64, timeout_ms: u64) -> DelayState {
    if value > ERROR_SENTINEL_THRESHOLD {
        DelayState::Errored
    } else if value == 0 || value >= timeout_ms {
        DelayState::TimedOut
    } else {
        DelayState::Measured(value)
    }
}

/// Notification delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelayUpdate {
    pub key: ProbeKey,
    pub state: DelayState,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Callback receiving every state change of one record
pub type DelayListener = Arc<dyn Fn(&DelayUpdate) + Send + Sync>;

/// Returned by [`LatencyProbeManager::register`], consumed by `unregister`
#[derive(Debug, PartialEq, Eq)]
pub struct ListenerHandle {
    key: ProbeKey,
    id: u64,
}

impl ListenerHandle {
    pub fn key(&self) -> &ProbeKey {
        &self.key
    }
}

/// Result of one [`LatencyProbeManager::probe`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Reserved name, nothing to probe
    Skipped,
    /// A probe for this key is already running
    AlreadyTesting,
    /// The probe finished and its result was applied
    Completed(DelayState),
    /// The probe finished after its record went away
    Discarded(DelayState),
}

struct ProbeRecord {
    generation: u64,
    state: DelayState,
    updated_at: Option<DateTime<Utc>>,
    listeners: HashMap<u64, DelayListener>,
}

impl ProbeRecord {
    fn update(&self, key: &ProbeKey) -> DelayUpdate {
        DelayUpdate {
            key: key.clone(),
            state: self.state,
            updated_at: self.updated_at,
        }
    }

    fn listeners(&self) -> Vec<DelayListener> {
        self.listeners.values().cloned().collect()
    }
}

#[derive(Default)]
struct ProbeTable {
    records: HashMap<ProbeKey, ProbeRecord>,
    /// Running probes, with the record generation each one reports to
    in_flight: HashMap<ProbeKey, Option<u64>>,
    next_id: u64,
}

impl ProbeTable {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn generation(&self, key: &ProbeKey) -> Option<u64> {
        self.records.get(key).map(|record| record.generation)
    }

    /// Release the in-flight slot if `generation` still holds it
    fn release(&mut self, key: &ProbeKey, generation: Option<u64>) {
        if self.in_flight.get(key) == Some(&generation) {
            self.in_flight.remove(key);
        }
    }
}

struct ProbeShared {
    backend: Arc<dyn CoreBackend>,
    default_timeout_ms: u64,
    permits: Option<Semaphore>,
    table: Mutex<ProbeTable>,
}

/// Latency probe manager
///
/// One instance per session; clones share the same records.
#[derive(Clone)]
pub struct LatencyProbeManager {
    shared: Arc<ProbeShared>,
}

impl LatencyProbeManager {
    /// Create a manager probing through `backend`
    ///
    /// `max_concurrent_probes == 0` leaves concurrency unbounded.
    pub fn new(backend: Arc<dyn CoreBackend>, config: &ProbeConfig) -> Self {
        let permits = match config.max_concurrent_probes {
            0 => None,
            n => Some(Semaphore::new(n)),
        };

        Self {
            shared: Arc::new(ProbeShared {
                backend,
                default_timeout_ms: config.default_timeout_ms,
                permits,
                table: Mutex::new(ProbeTable::default()),
            }),
        }
    }

    /// Attach a listener to `(proxy, group)`
    ///
    /// Creates the record if needed and resets it to `NotTested`; every
    /// listener of the record is notified. Returns `None` for reserved
    /// names.
    pub fn register(
        &self,
        proxy: &str,
        group: &str,
        listener: DelayListener,
    ) -> Option<ListenerHandle> {
        if is_reserved_probe_name(proxy) {
            return None;
        }

        let key = ProbeKey::new(proxy, group);
        let (handle, update, listeners) = {
            let mut table = self.lock();
            let id = table.next_id();
            let generation = table.next_id();

            let record = table.records.entry(key.clone()).or_insert_with(|| ProbeRecord {
                generation,
                state: DelayState::NotTested,
                updated_at: None,
                listeners: HashMap::new(),
            });
            record.listeners.insert(id, listener);
            record.state = DelayState::NotTested;
            record.updated_at = None;

            (
                ListenerHandle { key: key.clone(), id },
                record.update(&key),
                record.listeners(),
            )
        };

        debug!(key = %key, "Listener registered");
        notify(&listeners, &update);
        Some(handle)
    }

    /// Detach a listener; the last one evicts the record
    pub fn unregister(&self, handle: ListenerHandle) {
        let mut table = self.lock();

        let evict = match table.records.get_mut(&handle.key) {
            Some(record) => {
                record.listeners.remove(&handle.id);
                record.listeners.is_empty()
            }
            None => false,
        };

        if evict {
            table.records.remove(&handle.key);
            debug!(key = %handle.key, "Last listener gone, record evicted");
        }
    }

    /// Probe `(proxy, group)` once
    ///
    /// `timeout_ms` defaults to the configured probe timeout.
    pub async fn probe(&self, proxy: &str, group: &str, timeout_ms: Option<u64>) -> ProbeOutcome {
        if is_reserved_probe_name(proxy) {
            return ProbeOutcome::Skipped;
        }

        let key = ProbeKey::new(proxy, group);
        let timeout_ms = timeout_ms.unwrap_or(self.shared.default_timeout_ms);

        let (generation, notification) = {
            let mut table = self.lock();

            // A probe started for an evicted record does not block the
            // record that replaced it
            let current = table.generation(&key);
            if table.in_flight.get(&key) == Some(&current) {
                debug!(key = %key, "Probe already running");
                return ProbeOutcome::AlreadyTesting;
            }
            table.in_flight.insert(key.clone(), current);

            match table.records.get_mut(&key) {
                Some(record) => {
                    record.state = DelayState::Testing;
                    record.updated_at = Some(Utc::now());
                    (
                        Some(record.generation),
                        Some((record.update(&key), record.listeners())),
                    )
                }
                None => (None, None),
            }
        };

        if let Some((update, listeners)) = notification {
            notify(&listeners, &update);
        }

        let shared = Arc::clone(&self.shared);
        let task_key = key.clone();
        let task = tokio::spawn(async move { shared.run_probe(task_key, generation, timeout_ms).await });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(key = %key, "Probe task failed: {}", e);
                self.shared.settle(&key, generation, DelayState::Errored)
            }
        }
    }

    /// Probe every probeable member of `group` concurrently
    pub async fn probe_group(
        &self,
        group: &ProxyGroup,
        timeout_ms: Option<u64>,
    ) -> Vec<(String, ProbeOutcome)> {
        let members: Vec<&str> = group
            .members
            .iter()
            .map(|member| member.name.as_str())
            .filter(|name| !is_reserved_probe_name(name))
            .collect();

        info!("Probing {} members of {}", members.len(), group.name());

        let outcomes = join_all(
            members
                .iter()
                .map(|member| self.probe(member, group.name(), timeout_ms)),
        )
        .await;

        members
            .into_iter()
            .map(str::to_string)
            .zip(outcomes)
            .collect()
    }

    /// Current state of `(proxy, group)`, `None` without listeners
    pub fn state(&self, proxy: &str, group: &str) -> Option<DelayUpdate> {
        let key = ProbeKey::new(proxy, group);
        self.lock().records.get(&key).map(|record| record.update(&key))
    }

    pub fn listener_count(&self, proxy: &str, group: &str) -> usize {
        let key = ProbeKey::new(proxy, group);
        self.lock()
            .records
            .get(&key)
            .map_or(0, |record| record.listeners.len())
    }

    /// Number of records currently held
    pub fn tracked(&self) -> usize {
        self.lock().records.len()
    }

    fn lock(&self) -> MutexGuard<'_, ProbeTable> {
        self.shared.lock()
    }
}

impl ProbeShared {
    async fn run_probe(&self, key: ProbeKey, generation: Option<u64>, timeout_ms: u64) -> ProbeOutcome {
        let state = {
            // The semaphore is never closed
            let _permit = match &self.permits {
                Some(permits) => permits.acquire().await.ok(),
                None => None,
            };

            match self.backend.probe_delay(&key.proxy, timeout_ms).await {
                Ok(value) => classify_delay(value, timeout_ms),
                Err(e) if e.is_timeout() => DelayState::TimedOut,
                Err(e) => {
                    debug!(key = %key, "Probe failed: {}", e);
                    DelayState::Errored
                }
            }
        };

        self.settle(&key, generation, state)
    }

    /// Apply a finished probe to its record, if the record is still the one
    /// the probe started for
    fn settle(&self, key: &ProbeKey, generation: Option<u64>, state: DelayState) -> ProbeOutcome {
        let applied = {
            let mut table = self.lock();
            table.release(key, generation);

            match table.records.get_mut(key) {
                Some(record) if Some(record.generation) == generation => {
                    record.state = state;
                    record.updated_at = Some(Utc::now());
                    Some((record.update(key), record.listeners()))
                }
                _ => None,
            }
        };

        match applied {
            Some((update, listeners)) => {
                debug!(key = %key, state = ?state, "Probe finished");
                notify(&listeners, &update);
                ProbeOutcome::Completed(state)
            }
            None => {
                debug!(key = %key, "Record gone, discarding probe result");
                ProbeOutcome::Discarded(state)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProbeTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn notify(listeners: &[DelayListener], update: &DelayUpdate) {
    for listener in listeners {
        listener(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_delay() {
        assert_eq!(classify_delay(120, 10_000), DelayState::Measured(120));
        assert_eq!(classify_delay(9_999, 10_000), DelayState::Measured(9_999));
        assert_eq!(classify_delay(0, 10_000), DelayState::TimedOut);
        assert_eq!(classify_delay(10_000, 10_000), DelayState::TimedOut);
        assert_eq!(classify_delay(150_000, 10_000), DelayState::Errored);
        // Sentinel wins over the timeout check
        assert_eq!(classify_delay(150_000, 200_000), DelayState::Errored);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!DelayState::NotTested.is_terminal());
        assert!(!DelayState::Testing.is_terminal());
        assert!(DelayState::TimedOut.is_terminal());
        assert!(DelayState::Measured(1).is_terminal());
    }

    #[test]
    fn test_probe_key_display() {
        assert_eq!(ProbeKey::new("hk-1", "Auto").to_string(), "hk-1@Auto");
    }
}
