//! Deskcall client: the real-time support channel subsystem.
//!
//! Five pieces cooperate here, each injected with the others it needs:
//! the [`transport`] event channel, the [`session`] handle (client side of
//! the session registry), the [`engine`] call state machine, the [`media`]
//! resource controller and the [`chat`] relay.

#![forbid(unsafe_code)]

pub mod chat;
pub mod engine;
pub mod media;
pub mod peer;
pub mod session;
pub mod transport;

pub use chat::{ChatEvent, ChatLog, ChatRelay};
pub use engine::{
    transition, CallEngine, CallEvent, CallFailure, CallIdentity, CallState, EngineConfig,
    EngineEvent,
};
pub use media::{DummyCapture, MediaBackend, MediaConstraints, MediaController, MediaResource};
pub use peer::{IceState, PeerFactory, PeerSession, SdpPeer, SdpPeerFactory};
pub use session::SessionHandle;
pub use transport::{ChannelTransport, Transport, TransportEvent, WsTransport};
