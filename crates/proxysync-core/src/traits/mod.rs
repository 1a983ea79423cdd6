//! Core traits for the proxysync system
//!
//! This module defines the abstract interfaces at the system boundary.
//!
//! - [`CoreBackend`]: Command endpoints of the core and its host
//! - [`EventSource`]: Push notifications announcing changes

pub mod backend;
pub mod event_source;

pub use backend::CoreBackend;
pub use event_source::{EventChannel, EventHandler, EventSource, Subscription};
