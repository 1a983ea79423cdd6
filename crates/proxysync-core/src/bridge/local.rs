//! In-process event bus

use crate::error::Result;
use crate::traits::{EventChannel, EventHandler, EventSource, Subscription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: HashMap<EventChannel, Vec<(u64, EventHandler)>>,
}

/// [`EventSource`] fed by [`emit`](LocalEventBus::emit) calls in the same
/// process
///
/// Clones share the same handlers.
#[derive(Clone, Default)]
pub struct LocalEventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify every handler bound to `channel`
    ///
    /// Returns the number of handlers notified.
    pub fn emit(&self, channel: EventChannel) -> usize {
        let handlers: Vec<EventHandler> = lock(&self.inner)
            .handlers
            .get(&channel)
            .map(|bound| bound.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();

        trace!(channel = %channel, "Emitting to {} handlers", handlers.len());
        for handler in &handlers {
            handler(channel);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, channel: EventChannel) -> usize {
        lock(&self.inner).handlers.get(&channel).map_or(0, Vec::len)
    }
}

#[async_trait]
impl EventSource for LocalEventBus {
    async fn subscribe(&self, channel: EventChannel, handler: EventHandler) -> Result<Subscription> {
        let id = {
            let mut inner = lock(&self.inner);
            inner.next_id += 1;
            let id = inner.next_id;
            inner.handlers.entry(channel).or_default().push((id, handler));
            id
        };

        let bus = Arc::downgrade(&self.inner);
        Ok(Subscription::new(channel, move || {
            if let Some(bus) = bus.upgrade() {
                if let Some(bound) = lock(&bus).handlers.get_mut(&channel) {
                    bound.retain(|(bound_id, _)| *bound_id != id);
                }
            }
        }))
    }
}

fn lock(inner: &Mutex<BusInner>) -> MutexGuard<'_, BusInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
