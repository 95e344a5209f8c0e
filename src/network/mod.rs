//! Network module - Drives a session with the server
//!
//! Provides:
//! - Transport abstraction with websocket and in-memory implementations
//! - Handshake state machine
//! - Request/response correlation
//! - Reconnection backoff
//! - The `Session` tying them together

mod correlator;
mod handshake;
mod memory;
mod reconnect;
mod session;
mod transport;

pub use correlator::*;
pub use handshake::*;
pub use memory::*;
pub use reconnect::*;
pub use session::*;
pub use transport::*;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::{EventSubscription, RPC_VERSION};

/// Configuration accepted when a session is created
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Event categories requested in Identify
    pub event_subscriptions: EventSubscription,
    /// RPC version requested in Identify
    pub rpc_version: u32,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_subscriptions: EventSubscription::ALL,
            rpc_version: RPC_VERSION,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_event_subscriptions(mut self, mask: EventSubscription) -> Self {
        self.event_subscriptions = mask;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Backoff bounds for reconnect signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First delay after an abnormal closure, in ms
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Upper bound of the doubling delay, in ms
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }
}
