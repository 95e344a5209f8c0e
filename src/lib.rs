//! ObsLink - Client for the OBS remote-control websocket protocol
//!
//! Drives the Hello/Identify handshake, correlates requests and batches with
//! their responses, dispatches server-pushed events and signals when a
//! dropped connection should be redialed.

pub mod config;
pub mod events;
pub mod network;
pub mod protocol;

pub use events::{lifecycle, EventDispatcher, ListenerError, ListenerId};
pub use network::{
    BatchOptions, BatchRequest, Connector, ReconnectConfig, Session, SessionConfig, SessionError,
    SessionResult, SessionState, WsConnector,
};
pub use protocol::{EventSubscription, RequestFailure};
