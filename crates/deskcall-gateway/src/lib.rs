//! Signaling and chat relay gateway.
//!
//! Holds no call or media state of its own: it pairs customers with
//! agents, fans events out to a user's connections, and queues events
//! across short disconnects.

#![forbid(unsafe_code)]

pub mod registry;
pub mod ws;

pub use registry::{RegistryConfig, SessionRegistry};
