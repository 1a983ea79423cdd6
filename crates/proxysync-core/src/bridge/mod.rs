//! Push-event bridge
//!
//! Subscribes to the host's change channels and turns every notification
//! into hub invalidations:
//!
//! | channel | invalidates |
//! |---|---|
//! | `TopologyChanged` | proxies |
//! | `ConfigChanged` | core config, proxies |
//!
//! Setup runs on its own task and may still be running when the bridge is
//! torn down. Any subscription acquired after teardown is released on the
//! spot, so every subscription is released exactly once.

pub mod local;

pub use local::LocalEventBus;

use crate::sync::{Invalidator, SourceKey, Trigger};
use crate::traits::{EventChannel, EventHandler, EventSource, Subscription};
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sources a notification on `channel` invalidates
pub fn invalidated_sources(channel: EventChannel) -> &'static [SourceKey] {
    match channel {
        EventChannel::TopologyChanged => &[SourceKey::Proxies],
        EventChannel::ConfigChanged => &[SourceKey::CoreConfig, SourceKey::Proxies],
    }
}

#[derive(Default)]
struct BridgeState {
    torn_down: bool,
    subscriptions: Vec<Subscription>,
}

/// Bridge between an [`EventSource`] and the hub's invalidation queue
pub struct EventBridge {
    state: Arc<Mutex<BridgeState>>,
    setup: Mutex<Option<JoinHandle<()>>>,
}

impl EventBridge {
    /// Start subscribing to every channel in the background
    pub fn start(source: Arc<dyn EventSource>, invalidator: Invalidator) -> Self {
        let state = Arc::new(Mutex::new(BridgeState::default()));

        let setup_state = Arc::clone(&state);
        let setup = tokio::spawn(async move {
            join_all(EventChannel::ALL.into_iter().map(|channel| {
                subscribe_channel(
                    Arc::clone(&source),
                    channel,
                    invalidator.clone(),
                    Arc::clone(&setup_state),
                )
            }))
            .await;
        });

        Self {
            state,
            setup: Mutex::new(Some(setup)),
        }
    }

    /// Wait until every channel has either subscribed or failed
    pub async fn wait_for_setup(&self) {
        let setup = self
            .setup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(setup) = setup {
            if let Err(e) = setup.await {
                warn!("Event bridge setup task failed: {}", e);
            }
        }
    }

    /// Channels currently bound
    pub fn active_channels(&self) -> Vec<EventChannel> {
        lock(&self.state)
            .subscriptions
            .iter()
            .map(Subscription::channel)
            .collect()
    }

    pub fn is_torn_down(&self) -> bool {
        lock(&self.state).torn_down
    }

    /// Release every subscription
    ///
    /// Idempotent. Returns how many subscriptions this call released.
    pub fn teardown(&self) -> usize {
        let subscriptions = {
            let mut state = lock(&self.state);
            if state.torn_down {
                return 0;
            }
            state.torn_down = true;
            std::mem::take(&mut state.subscriptions)
        };

        let released = subscriptions.len();
        for subscription in subscriptions {
            subscription.release();
        }

        info!("Event bridge torn down ({} subscriptions released)", released);
        released
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn subscribe_channel(
    source: Arc<dyn EventSource>,
    channel: EventChannel,
    invalidator: Invalidator,
    state: Arc<Mutex<BridgeState>>,
) {
    if lock(&state).torn_down {
        debug!(channel = %channel, "Torn down before subscribing");
        return;
    }

    let handler: EventHandler = Arc::new(move |channel| {
        for key in invalidated_sources(channel) {
            if !invalidator.invalidate(*key, Trigger::Push) {
                debug!(channel = %channel, "Scheduler gone, dropping push invalidation");
            }
        }
    });

    match source.subscribe(channel, handler).await {
        Ok(subscription) => {
            let late = {
                let mut state = lock(&state);
                if state.torn_down {
                    Some(subscription)
                } else {
                    state.subscriptions.push(subscription);
                    None
                }
            };

            match late {
                Some(subscription) => {
                    debug!(channel = %channel, "Subscribed after teardown, releasing");
                    subscription.release();
                }
                None => debug!(channel = %channel, "Subscribed"),
            }
        }
        Err(e) => {
            warn!(channel = %channel, "Subscription failed, channel disabled: {}", e);
        }
    }
}

fn lock(state: &Mutex<BridgeState>) -> MutexGuard<'_, BridgeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
