// # Event Source Trait
//
// Defines the push-notification boundary: named channels on which the host
// announces that something changed.
//
// Notifications carry no payload guarantee beyond "something changed".
// Handlers re-fetch; they never trust inline data.
//
// ## Implementations
//
// - In-process bus: `bridge::LocalEventBus`
// - Test doubles: `tests/common/mod.rs`

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Push channels the host publishes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventChannel {
    /// Proxy topology changed (selection, membership, providers)
    TopologyChanged,
    /// The whole core configuration was reloaded
    ConfigChanged,
}

impl EventChannel {
    /// Every channel, in subscription order
    pub const ALL: [EventChannel; 2] = [EventChannel::TopologyChanged, EventChannel::ConfigChanged];

    /// Wire name of the channel
    pub fn name(&self) -> &'static str {
        match self {
            EventChannel::TopologyChanged => "verge://refresh-proxy-config",
            EventChannel::ConfigChanged => "verge://refresh-clash-config",
        }
    }

    /// Look up a channel by wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|channel| channel.name() == name)
    }
}

impl fmt::Display for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Callback invoked for every notification on a channel
pub type EventHandler = Arc<dyn Fn(EventChannel) + Send + Sync>;

/// Handle binding a channel to a callback
///
/// The binding is released exactly once: either by [`Subscription::release`]
/// or, if that never happens, when the handle is dropped.
pub struct Subscription {
    channel: EventChannel,
    unlisten: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a handle that runs `unlisten` on release
    pub fn new(channel: EventChannel, unlisten: impl FnOnce() + Send + 'static) -> Self {
        Self {
            channel,
            unlisten: Some(Box::new(unlisten)),
        }
    }

    pub fn channel(&self) -> EventChannel {
        self.channel
    }

    /// Release the binding
    pub fn release(mut self) {
        self.unlisten_once();
    }

    fn unlisten_once(&mut self) {
        if let Some(unlisten) = self.unlisten.take() {
            unlisten();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unlisten_once();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.unlisten.is_some())
            .finish()
    }
}

/// Trait for push-notification sources
///
/// Subscribing is asynchronous and may fail, for instance when the
/// transport is not ready yet.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Bind `handler` to `channel`
    ///
    /// # Returns
    ///
    /// - `Ok(Subscription)`: The binding; release it to stop notifications
    /// - `Err(Error::SubscriptionSetup)`: The channel could not be bound
    async fn subscribe(
        &self,
        channel: EventChannel,
        handler: EventHandler,
    ) -> Result<Subscription, crate::Error>;
}
