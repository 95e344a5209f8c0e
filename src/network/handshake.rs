//! Handshake state machine
//!
//! Hello -> Identify -> Identified. The controller only decides what to send
//! and when the session counts as identified; the session owns the socket.

use std::fmt;

use super::session::SessionError;
use crate::protocol::{EventSubscription, Hello, Identified, Identify};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Never connected
    Idle,
    /// Transport is being opened
    SocketConnecting,
    /// Transport open, waiting for the server's Hello
    AwaitingHello,
    /// Identify sent, waiting for Identified
    AwaitingIdentified,
    /// Handshake complete, requests may be sent
    Identified,
    /// Transport closed, by either side
    Closed,
}

impl SessionState {
    /// True while a connection attempt or established session is active
    pub fn is_active(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct HandshakeController {
    password: Option<String>,
    rpc_version: u32,
    event_subscriptions: EventSubscription,
    state: SessionState,
    negotiated_rpc_version: Option<u32>,
}

impl HandshakeController {
    pub fn new(
        password: Option<String>,
        rpc_version: u32,
        event_subscriptions: EventSubscription,
    ) -> Self {
        Self {
            password,
            rpc_version,
            event_subscriptions,
            state: SessionState::AwaitingHello,
            negotiated_rpc_version: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_identified(&self) -> bool {
        self.state == SessionState::Identified
    }

    pub fn negotiated_rpc_version(&self) -> Option<u32> {
        self.negotiated_rpc_version
    }

    /// Build the Identify reply to a Hello.
    ///
    /// Returns `Ok(None)` when a Hello arrives outside of `AwaitingHello`,
    /// and `AuthenticationRequired` when the server sent a challenge but no
    /// password is configured. No Identify is produced in that case.
    pub fn on_hello(&mut self, hello: &Hello) -> Result<Option<Identify>, SessionError> {
        if self.state != SessionState::AwaitingHello {
            tracing::warn!("Ignoring Hello received in state {}", self.state);
            return Ok(None);
        }

        let authentication = match (&hello.authentication, &self.password) {
            (Some(_), None) => {
                self.state = SessionState::Closed;
                return Err(SessionError::AuthenticationRequired);
            }
            (Some(challenge), Some(password)) => Some(challenge.solve(password)),
            (None, _) => None,
        };

        tracing::debug!(
            "Hello from server {} (rpc {}), authentication {}",
            hello.obs_web_socket_version,
            hello.rpc_version,
            if authentication.is_some() { "required" } else { "not required" }
        );

        Ok(Some(Identify {
            rpc_version: self.rpc_version,
            authentication,
            event_subscriptions: Some(self.event_subscriptions),
        }))
    }

    /// Mark the Identify frame as sent
    pub fn identify_sent(&mut self) {
        if self.state == SessionState::AwaitingHello {
            self.state = SessionState::AwaitingIdentified;
        }
    }

    /// Returns true if this Identified completes the handshake
    pub fn on_identified(&mut self, identified: &Identified) -> bool {
        if self.state != SessionState::AwaitingIdentified {
            tracing::warn!("Ignoring Identified received in state {}", self.state);
            return false;
        }
        self.state = SessionState::Identified;
        self.negotiated_rpc_version = Some(identified.negotiated_rpc_version);
        true
    }
}
