//! Per-source cache cells
//!
//! A [`SourceCell`] holds the last value of one data source together with
//! its refresh bookkeeping. Its refresh path is the only writer:
//!
//! ```text
//!   refresh ──► in flight? ──yes──► join the shared fetch
//!                   │ no
//!                   ▼
//!         started within dedupe window and cached? ──yes──► cached value
//!                   │ no
//!                   ▼
//!         spawn fetch task ──► settle (fresh value | fallback) ──► waiters
//! ```
//!
//! The fetch runs on its own task. Callers that stop waiting only detach;
//! the fetch still settles into the cell.

use super::events::{emit, SkipReason, SyncEvent};
use crate::config::{SourcePolicies, SourcePolicy};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Data sources tracked by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SourceKey {
    Proxies,
    CoreConfig,
    Rules,
    RuleProviders,
    ProxyProviders,
    SystemProxy,
    RunningMode,
    Uptime,
}

impl SourceKey {
    pub const ALL: [SourceKey; 8] = [
        SourceKey::Proxies,
        SourceKey::CoreConfig,
        SourceKey::Rules,
        SourceKey::RuleProviders,
        SourceKey::ProxyProviders,
        SourceKey::SystemProxy,
        SourceKey::RunningMode,
        SourceKey::Uptime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKey::Proxies => "proxies",
            SourceKey::CoreConfig => "core_config",
            SourceKey::Rules => "rules",
            SourceKey::RuleProviders => "rule_providers",
            SourceKey::ProxyProviders => "proxy_providers",
            SourceKey::SystemProxy => "system_proxy",
            SourceKey::RunningMode => "running_mode",
            SourceKey::Uptime => "uptime",
        }
    }

    /// The policy configured for this source
    pub fn policy_in(&self, policies: &SourcePolicies) -> SourcePolicy {
        match self {
            SourceKey::Proxies => policies.proxies,
            SourceKey::CoreConfig => policies.core_config,
            SourceKey::Rules => policies.rules,
            SourceKey::RuleProviders => policies.rule_providers,
            SourceKey::ProxyProviders => policies.proxy_providers,
            SourceKey::SystemProxy => policies.system_proxy,
            SourceKey::RunningMode => policies.running_mode,
            SourceKey::Uptime => policies.uptime,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Freshness of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheState {
    /// Last fetch succeeded within the poll interval
    Fresh,
    /// Last fetch succeeded, but longer ago than the poll interval
    Stale,
    /// A fetch is in flight; the previous value is still served
    Revalidating,
    /// Every attempt of the last fetch failed
    Failed,
}

/// Read-only view of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntryInfo {
    pub key: SourceKey,
    pub state: CacheState,
    pub policy: SourcePolicy,
    pub last_success_at: Option<DateTime<Utc>>,
    pub has_value: bool,
    pub last_error: Option<String>,
}

/// How a refresh treats the dedupe window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshMode {
    /// Serve the cached value when a fetch started within the window
    Deduped,
    /// Always fetch unless one is in flight
    Forced,
}

/// Result of one fetch, retries and fallback chain included
pub(crate) enum FetchOutcome<T> {
    Fresh(T),
    /// `value: None` keeps the last known value
    Fallback { value: Option<T>, error: String },
}

impl<T> FetchOutcome<T> {
    pub(crate) fn fallback(value: T, error: impl fmt::Display) -> Self {
        Self::Fallback {
            value: Some(value),
            error: error.to_string(),
        }
    }

    pub(crate) fn keep_last(error: impl fmt::Display) -> Self {
        Self::Fallback {
            value: None,
            error: error.to_string(),
        }
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, Option<Arc<T>>>>;

struct CellInner<T> {
    value: Option<Arc<T>>,
    state: CacheState,
    last_success_at: Option<DateTime<Utc>>,
    last_success: Option<Instant>,
    last_started: Option<Instant>,
    last_error: Option<String>,
    inflight: Option<SharedFetch<T>>,
}

/// Cache entry of one source plus its single-flight slot
pub(crate) struct SourceCell<T> {
    key: SourceKey,
    policy: SourcePolicy,
    events: mpsc::Sender<SyncEvent>,
    inner: Mutex<CellInner<T>>,
}

enum Plan<T> {
    Cached(Option<Arc<T>>),
    Await(SharedFetch<T>),
}

impl<T: Send + Sync + 'static> SourceCell<T> {
    pub(crate) fn new(key: SourceKey, policy: SourcePolicy, events: mpsc::Sender<SyncEvent>) -> Arc<Self> {
        Arc::new(Self {
            key,
            policy,
            events,
            inner: Mutex::new(CellInner {
                value: None,
                state: CacheState::Stale,
                last_success_at: None,
                last_success: None,
                last_started: None,
                last_error: None,
                inflight: None,
            }),
        })
    }

    pub(crate) fn policy(&self) -> SourcePolicy {
        self.policy
    }

    /// Last known value, never triggers a fetch
    pub(crate) fn value(&self) -> Option<Arc<T>> {
        self.lock().value.clone()
    }

    pub(crate) fn info(&self) -> CacheEntryInfo {
        let inner = self.lock();

        let state = match inner.state {
            CacheState::Fresh if self.is_past_interval(inner.last_success) => CacheState::Stale,
            state => state,
        };

        CacheEntryInfo {
            key: self.key,
            state,
            policy: self.policy,
            last_success_at: inner.last_success_at,
            has_value: inner.value.is_some(),
            last_error: inner.last_error.clone(),
        }
    }

    /// Refresh the cell, sharing any fetch already in flight
    ///
    /// `fetch` is only invoked when a new fetch is started; the future it
    /// returns is spawned and settles into the cell even if every caller
    /// goes away.
    pub(crate) async fn refresh<F, Fut>(self: &Arc<Self>, mode: RefreshMode, fetch: F) -> Option<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchOutcome<T>> + Send + 'static,
    {
        let plan = {
            let mut inner = self.lock();

            if let Some(inflight) = &inner.inflight {
                debug!(source = %self.key, "Joining in-flight fetch");
                emit(
                    &self.events,
                    SyncEvent::RefreshSkipped {
                        source: self.key,
                        reason: SkipReason::JoinedInFlight,
                    },
                );
                Plan::Await(inflight.clone())
            } else if mode == RefreshMode::Deduped
                && inner.value.is_some()
                && self.is_within_dedupe(inner.last_started)
            {
                debug!(source = %self.key, "Fetch started within dedupe window, serving cached value");
                emit(
                    &self.events,
                    SyncEvent::RefreshSkipped {
                        source: self.key,
                        reason: SkipReason::DedupeWindow,
                    },
                );
                Plan::Cached(inner.value.clone())
            } else {
                inner.last_started = Some(Instant::now());
                inner.state = CacheState::Revalidating;

                let shared = self.spawn_fetch(fetch());
                inner.inflight = Some(shared.clone());

                emit(
                    &self.events,
                    SyncEvent::RefreshStarted {
                        source: self.key,
                        forced: mode == RefreshMode::Forced,
                    },
                );
                Plan::Await(shared)
            }
        };

        match plan {
            Plan::Cached(value) => value,
            Plan::Await(shared) => shared.await,
        }
    }

    fn spawn_fetch<Fut>(self: &Arc<Self>, fetch: Fut) -> SharedFetch<T>
    where
        Fut: Future<Output = FetchOutcome<T>> + Send + 'static,
    {
        let cell = Arc::clone(self);
        let key = self.key;

        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(fetch).catch_unwind().await.unwrap_or_else(|_| {
                error!(source = %key, "Fetch panicked");
                FetchOutcome::keep_last("fetch panicked")
            });
            cell.settle(outcome)
        });

        async move {
            match task.await {
                Ok(value) => value,
                Err(e) => {
                    error!(source = %key, "Fetch task failed: {}", e);
                    None
                }
            }
        }
        .boxed()
        .shared()
    }

    fn settle(&self, outcome: FetchOutcome<T>) -> Option<Arc<T>> {
        let (value, event) = {
            let mut inner = self.lock();
            inner.inflight = None;

            match outcome {
                FetchOutcome::Fresh(value) => {
                    let value = Arc::new(value);
                    inner.value = Some(Arc::clone(&value));
                    inner.state = CacheState::Fresh;
                    inner.last_success_at = Some(Utc::now());
                    inner.last_success = Some(Instant::now());
                    inner.last_error = None;

                    (Some(value), SyncEvent::RefreshSucceeded { source: self.key })
                }
                FetchOutcome::Fallback { value, error } => {
                    let replaced = value.is_some();
                    if let Some(value) = value {
                        inner.value = Some(Arc::new(value));
                    }
                    inner.state = CacheState::Failed;
                    inner.last_error = Some(error.clone());

                    warn!(
                        source = %self.key,
                        replaced,
                        "Refresh failed, applying fallback: {}", error
                    );
                    (
                        inner.value.clone(),
                        SyncEvent::FallbackApplied {
                            source: self.key,
                            error,
                            replaced,
                        },
                    )
                }
            }
        };

        emit(&self.events, event);
        value
    }

    fn is_within_dedupe(&self, last_started: Option<Instant>) -> bool {
        last_started.is_some_and(|started| {
            started.elapsed() < Duration::from_millis(self.policy.dedupe_window_ms)
        })
    }

    fn is_past_interval(&self, last_success: Option<Instant>) -> bool {
        self.policy.polls()
            && last_success.is_some_and(|at| {
                at.elapsed() > Duration::from_millis(self.policy.poll_interval_ms)
            })
    }

    fn lock(&self) -> MutexGuard<'_, CellInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
