//! Session
//!
//! Owns the transport, runs the handshake, correlates requests and routes
//! server events. Inbound frames are processed one at a time by a single
//! task per connection; public calls hand frames to that task through an
//! outbound queue.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::correlator::{BatchOptions, BatchRequest, RequestCorrelator, RequestError};
use super::handshake::{HandshakeController, SessionState};
use super::reconnect::{ReconnectSignal, ReconnectionSupervisor};
use super::transport::{Connector, InboundFrame, Transport, TransportError, WsConnector};
use super::SessionConfig;
use crate::events::{lifecycle, EventDispatcher, ListenerError, ListenerId};
use crate::protocol::{
    self, close_code, CodecError, EventSubscription, Identify, Message, Reidentify,
    RequestFailure,
};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Already connected or connecting")]
    AlreadyConnected,

    #[error("Not identified")]
    NotIdentified,

    #[error("Server requires authentication but no password was supplied")]
    AuthenticationRequired,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed ({code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Request failed: {0}")]
    Request(RequestFailure),

    #[error("Batch returned {received} of {expected} results")]
    IncompleteBatch { expected: usize, received: usize },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<RequestError> for SessionError {
    fn from(error: RequestError) -> Self {
        match error {
            RequestError::Failed(failure) => SessionError::Request(failure),
            RequestError::ConnectionClosed { code, reason } => {
                SessionError::ConnectionClosed { code, reason }
            }
            RequestError::IncompleteBatch { expected, received } => {
                SessionError::IncompleteBatch { expected, received }
            }
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

enum Command {
    Send(String),
    Close { code: u16, reason: String },
}

struct Inner {
    state: SessionState,
    /// Bumped on every connect and disconnect; stale connection tasks compare against it
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Command>>,
    waiter: Option<oneshot::Sender<SessionResult<()>>>,
    negotiated_rpc_version: Option<u32>,
}

struct Shared {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
    correlator: Mutex<RequestCorrelator>,
    events: EventDispatcher,
    reconnect: ReconnectionSupervisor,
    connected: watch::Sender<bool>,
}

/// What the connection task does after handling a frame
enum Action {
    Continue,
    Identify(Identify),
    Fail(SessionError),
}

/// Client session with a single server
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create a session dialing over websockets
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Create a session using a custom connector
    pub fn with_connector(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let reconnect = ReconnectionSupervisor::new(
                config.reconnect,
                Arc::new(move |signal: ReconnectSignal| {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    shared.emit_reconnect_requested(signal);
                }),
            );
            let (connected, _) = watch::channel(false);

            let inner = Inner {
                state: SessionState::Idle,
                generation: 0,
                outbound: None,
                waiter: None,
                negotiated_rpc_version: None,
            };

            Shared {
                config,
                connector,
                inner: Mutex::new(inner),
                correlator: Mutex::new(RequestCorrelator::new()),
                events: EventDispatcher::new(),
                reconnect,
                connected,
            }
        });

        Self { shared }
    }

    /// Connect and complete the handshake.
    ///
    /// Resolves once the server sends Identified; fails on any transport or
    /// handshake error, or if a connection is already active.
    pub async fn connect(&self, url: &str, password: Option<&str>) -> SessionResult<()> {
        let (generation, waiter) = {
            let mut inner = self.shared.lock_inner();
            if inner.state.is_active() {
                return Err(SessionError::AlreadyConnected);
            }
            let (tx, rx) = oneshot::channel();
            inner.generation += 1;
            inner.state = SessionState::SocketConnecting;
            inner.negotiated_rpc_version = None;
            inner.waiter = Some(tx);
            (inner.generation, rx)
        };
        self.shared.reconnect.enable();

        tracing::info!("Connecting to {}", url);

        let mut transport = match self.shared.connector.connect(url).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("Failed to open connection to {}: {}", url, e);
                if self.shared.abandon_attempt(generation) {
                    let payload = json!({ "message": e.to_string() });
                    self.shared
                        .events
                        .emit(lifecycle::CONNECTION_ERROR, Some(&payload));
                    self.shared.reconnect.on_close(close_code::ABNORMAL);
                }
                return Err(e.into());
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let started = {
            let mut inner = self.shared.lock_inner();
            if inner.generation == generation {
                inner.state = SessionState::AwaitingHello;
                inner.outbound = Some(outbound_tx);
                true
            } else {
                false
            }
        };

        if !started {
            // Disconnected while dialing
            let _ = transport.sink.close(close_code::NORMAL, "").await;
        } else {
            self.shared.events.emit(lifecycle::CONNECTION_OPENED, None);
            let handshake = HandshakeController::new(
                password.map(str::to_string),
                self.shared.config.rpc_version,
                self.shared.config.event_subscriptions,
            );
            tokio::spawn(run_connection(
                self.shared.clone(),
                generation,
                transport,
                outbound_rx,
                handshake,
            ));
        }

        waiter.await.unwrap_or_else(|_| {
            Err(SessionError::Connection(
                "connection attempt abandoned".to_string(),
            ))
        })
    }

    /// Close the connection and fail every pending request.
    ///
    /// Disables reconnection; no reconnect signal fires afterwards.
    pub fn disconnect(&self) {
        self.shared.reconnect.disable();

        let (outbound, waiter, was_active) = {
            let mut inner = self.shared.lock_inner();
            let was_active = inner.state.is_active();
            inner.generation += 1;
            inner.state = SessionState::Closed;
            inner.negotiated_rpc_version = None;
            self.shared.connected.send_replace(false);
            (inner.outbound.take(), inner.waiter.take(), was_active)
        };

        let reason = "Client disconnected".to_string();
        if let Some(outbound) = outbound {
            let _ = outbound.send(Command::Close {
                code: close_code::NORMAL,
                reason: reason.clone(),
            });
        }

        let failed = self.shared.lock_correlator().fail_all(RequestError::ConnectionClosed {
            code: close_code::NORMAL,
            reason: reason.clone(),
        });
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(SessionError::ConnectionClosed {
                code: close_code::NORMAL,
                reason: reason.clone(),
            }));
        }

        if was_active {
            tracing::info!("Disconnected, {} pending request(s) failed", failed);
            let payload = json!({ "code": close_code::NORMAL, "reason": reason });
            self.shared
                .events
                .emit(lifecycle::CONNECTION_CLOSED, Some(&payload));
        }
    }

    /// Send a request and wait for its response data
    pub async fn call(&self, request_type: &str, data: Option<Value>) -> SessionResult<Option<Value>> {
        let rx = self
            .shared
            .enqueue(|correlator| correlator.register_request(request_type, data))?;

        match rx.await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(closed_unexpectedly()),
        }
    }

    /// Send a batch and wait for every member's response data, in caller order.
    ///
    /// The first failing member (in server order) fails the whole batch,
    /// whatever `halt_on_failure` says.
    pub async fn call_batch(
        &self,
        requests: Vec<BatchRequest>,
        options: BatchOptions,
    ) -> SessionResult<Vec<Option<Value>>> {
        let rx = self
            .shared
            .enqueue(|correlator| correlator.register_batch(requests, options))?;

        match rx.await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(closed_unexpectedly()),
        }
    }

    /// Update the server-side event subscription without a new handshake
    pub fn reidentify(&self, event_subscriptions: Option<EventSubscription>) -> SessionResult<()> {
        let text = protocol::encode(&Message::Reidentify(Reidentify { event_subscriptions }))?;

        let inner = self.shared.lock_inner();
        let outbound = inner.identified_outbound()?;
        outbound
            .send(Command::Send(text))
            .map_err(|_| closed_unexpectedly())?;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock_inner().state
    }

    /// True only while identified
    pub fn connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Observe changes of `connected`
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn negotiated_rpc_version(&self) -> Option<u32> {
        self.shared.lock_inner().negotiated_rpc_version
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.lock_correlator().len()
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.shared.events
    }

    pub fn on<F>(&self, name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(Option<&Value>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.shared.events.on(name, listener)
    }

    pub fn once<F>(&self, name: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(Option<&Value>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.shared.events.once(name, listener)
    }

    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        self.shared.events.off(name, id)
    }

    pub fn remove_all_listeners(&self, name: Option<&str>) {
        self.shared.events.remove_all_listeners(name)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

fn closed_unexpectedly() -> SessionError {
    SessionError::ConnectionClosed {
        code: close_code::ABNORMAL,
        reason: "Connection task ended".to_string(),
    }
}

impl Inner {
    fn identified_outbound(&self) -> SessionResult<&mpsc::UnboundedSender<Command>> {
        if self.state != SessionState::Identified {
            return Err(SessionError::NotIdentified);
        }
        self.outbound.as_ref().ok_or(SessionError::NotIdentified)
    }
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_correlator(&self) -> MutexGuard<'_, RequestCorrelator> {
        self.correlator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending entry and queue its frame.
    ///
    /// Runs under the state lock so a teardown cannot slip between
    /// registration and queueing and leave the entry unswept.
    fn enqueue<R>(
        &self,
        register: impl FnOnce(&mut RequestCorrelator) -> (String, Message, R),
    ) -> SessionResult<R> {
        let inner = self.lock_inner();
        let outbound = inner.identified_outbound()?;

        let mut correlator = self.lock_correlator();
        let (id, message, rx) = register(&mut *correlator);

        let queued = protocol::encode(&message)
            .map_err(SessionError::from)
            .and_then(|text| {
                outbound
                    .send(Command::Send(text))
                    .map_err(|_| closed_unexpectedly())
            });
        if let Err(e) = queued {
            correlator.cancel(&id);
            return Err(e);
        }

        tracing::debug!("Queued {} {}", message.op_code(), id);
        Ok(rx)
    }

    fn emit_reconnect_requested(&self, signal: ReconnectSignal) {
        // A disconnect may land between the timer firing and this call
        if !self.reconnect.is_enabled() {
            return;
        }
        let payload = json!({
            "delayMs": u64::try_from(signal.delay.as_millis()).unwrap_or(u64::MAX),
            "attempt": signal.attempt,
        });
        self.events.emit(lifecycle::RECONNECT_REQUESTED, Some(&payload));
    }

    /// Reset state after a failed dial. Returns false if superseded.
    fn abandon_attempt(&self, generation: u64) -> bool {
        let mut inner = self.lock_inner();
        if inner.generation != generation {
            return false;
        }
        inner.state = SessionState::Closed;
        inner.outbound = None;
        inner.waiter = None;
        true
    }

    fn set_state(&self, generation: u64, state: SessionState) {
        let mut inner = self.lock_inner();
        if inner.generation == generation {
            inner.state = state;
        }
    }

    fn mark_identified(&self, generation: u64, negotiated_rpc_version: u32) {
        let waiter = {
            let mut inner = self.lock_inner();
            if inner.generation != generation {
                return;
            }
            inner.state = SessionState::Identified;
            inner.negotiated_rpc_version = Some(negotiated_rpc_version);
            self.connected.send_replace(true);
            inner.waiter.take()
        };

        self.reconnect.reset();
        tracing::info!("Identified, negotiated rpc version {}", negotiated_rpc_version);

        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
        let payload = json!({ "negotiatedRpcVersion": negotiated_rpc_version });
        self.events.emit(lifecycle::IDENTIFIED, Some(&payload));
    }

    /// Tear down after the transport closed, unless a disconnect already did
    fn teardown(&self, generation: u64, code: u16, reason: String, error: Option<SessionError>) {
        let waiter = {
            let mut inner = self.lock_inner();
            if inner.generation != generation {
                return;
            }
            inner.state = SessionState::Closed;
            inner.outbound = None;
            inner.negotiated_rpc_version = None;
            self.connected.send_replace(false);
            inner.waiter.take()
        };

        let failed = self.lock_correlator().fail_all(RequestError::ConnectionClosed {
            code,
            reason: reason.clone(),
        });
        tracing::info!(
            "Connection closed ({}): {}, {} pending request(s) failed",
            code,
            reason,
            failed
        );

        if let Some(waiter) = waiter {
            let error = error.unwrap_or_else(|| {
                SessionError::Connection(format!(
                    "closed before identification ({}): {}",
                    code, reason
                ))
            });
            let _ = waiter.send(Err(error));
        }

        let payload = json!({ "code": code, "reason": reason });
        self.events.emit(lifecycle::CONNECTION_CLOSED, Some(&payload));
        self.reconnect.on_close(code);
    }

    fn handle_text(&self, generation: u64, handshake: &mut HandshakeController, text: &str) -> Action {
        let message = match protocol::decode(text) {
            Ok(message) => message,
            Err(CodecError::UnknownOpcode(op)) => {
                tracing::warn!("Ignoring frame with unknown opcode {}", op);
                return Action::Continue;
            }
            Err(e) => {
                tracing::warn!("Ignoring malformed frame: {}", e);
                let payload = json!({ "message": e.to_string() });
                self.events.emit(lifecycle::PARSE_ERROR, Some(&payload));
                return Action::Continue;
            }
        };

        tracing::debug!("Received {}", message.op_code());

        match message {
            Message::Hello(hello) => {
                let payload = serde_json::to_value(&hello).ok();
                self.events.emit(lifecycle::HELLO, payload.as_ref());
                match handshake.on_hello(&hello) {
                    Ok(Some(identify)) => Action::Identify(identify),
                    Ok(None) => Action::Continue,
                    Err(e) => Action::Fail(e),
                }
            }
            Message::Identified(identified) => {
                if handshake.on_identified(&identified) {
                    self.mark_identified(generation, identified.negotiated_rpc_version);
                }
                Action::Continue
            }
            Message::Event(event) if handshake.is_identified() => {
                self.events.emit(&event.event_type, event.event_data.as_ref());
                Action::Continue
            }
            Message::RequestResponse(response) if handshake.is_identified() => {
                self.lock_correlator().resolve_response(response);
                Action::Continue
            }
            Message::RequestBatchResponse(response) if handshake.is_identified() => {
                self.lock_correlator().resolve_batch(response);
                Action::Continue
            }
            Message::Event(_) | Message::RequestResponse(_) | Message::RequestBatchResponse(_) => {
                tracing::debug!("Ignoring frame received before identification");
                Action::Continue
            }
            Message::Identify(_)
            | Message::Reidentify(_)
            | Message::Request(_)
            | Message::RequestBatch(_) => {
                tracing::warn!("Ignoring client-to-server message sent by server");
                Action::Continue
            }
        }
    }
}

/// Per-connection task: processes inbound frames in order and writes queued frames
async fn run_connection(
    shared: Arc<Shared>,
    generation: u64,
    transport: Transport,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    mut handshake: HandshakeController,
) {
    let Transport { mut sink, mut stream } = transport;

    let (code, reason, error) = loop {
        tokio::select! {
            frame = stream.recv() => match frame {
                Some(Ok(InboundFrame::Text(text))) => {
                    match shared.handle_text(generation, &mut handshake, &text) {
                        Action::Continue => {}
                        Action::Identify(identify) => {
                            let sent = match protocol::encode(&Message::Identify(identify)) {
                                Ok(text) => sink.send_text(text).await.map_err(SessionError::from),
                                Err(e) => Err(e.into()),
                            };
                            if let Err(e) = sent {
                                break (close_code::ABNORMAL, e.to_string(), Some(e));
                            }
                            handshake.identify_sent();
                            shared.set_state(generation, SessionState::AwaitingIdentified);
                        }
                        Action::Fail(e) => {
                            tracing::warn!("Handshake failed: {}", e);
                            let reason = e.to_string();
                            let _ = sink.close(close_code::NORMAL, &reason).await;
                            break (close_code::NORMAL, reason, Some(e));
                        }
                    }
                }
                Some(Ok(InboundFrame::Close { code, reason })) => break (code, reason, None),
                Some(Err(e)) => {
                    let payload = json!({ "message": e.to_string() });
                    shared.events.emit(lifecycle::CONNECTION_ERROR, Some(&payload));
                    break (close_code::ABNORMAL, e.to_string(), None);
                }
                None => break (close_code::ABNORMAL, "Transport ended".to_string(), None),
            },
            command = outbound.recv() => match command {
                Some(Command::Send(text)) => {
                    if let Err(e) = sink.send_text(text).await {
                        break (close_code::ABNORMAL, e.to_string(), None);
                    }
                }
                Some(Command::Close { code, reason }) => {
                    // Explicit disconnect already tore the session down
                    let _ = sink.close(code, &reason).await;
                    return;
                }
                None => {
                    let _ = sink.close(close_code::NORMAL, "").await;
                    return;
                }
            },
        }
    };

    shared.teardown(generation, code, reason, error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{MemoryConnector, MemoryListener, MemoryPeer};
    use crate::protocol::{
        AuthenticationChallenge, BatchResult, Event, Hello, Identified, RequestBatchResponse,
        RequestResponse, RequestStatus,
    };
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const URL: &str = "memory://obs";

    fn new_session() -> (Session, MemoryListener) {
        let (connector, listener) = MemoryConnector::new();
        let config = SessionConfig::default().with_event_subscriptions(EventSubscription::SCENES);
        (Session::with_connector(config, Arc::new(connector)), listener)
    }

    /// Play the server side of the handshake, returning the Identify the client sent
    async fn serve_handshake(peer: &mut MemoryPeer, auth: Option<AuthenticationChallenge>) -> Identify {
        peer.send(&Message::Hello(Hello {
            obs_web_socket_version: "5.5.0".to_string(),
            rpc_version: 1,
            authentication: auth,
        }));
        match peer.recv_message().await {
            Some(Message::Identify(identify)) => {
                peer.send(&Message::Identified(Identified {
                    negotiated_rpc_version: 1,
                }));
                identify
            }
            other => panic!("Expected Identify, got {:?}", other),
        }
    }

    async fn connected_session() -> (Session, MemoryPeer, MemoryListener) {
        let (session, mut listener) = new_session();
        let client = session.clone();
        let connect = tokio::spawn(async move { client.connect(URL, None).await });

        let mut peer = listener.accept().await.unwrap();
        serve_handshake(&mut peer, None).await;
        assert_ok!(connect.await.unwrap());
        (session, peer, listener)
    }

    async fn next_request(peer: &mut MemoryPeer) -> protocol::Request {
        match peer.recv_message().await {
            Some(Message::Request(request)) => request,
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    fn ok_response(request: &protocol::Request, data: Value) -> Message {
        Message::RequestResponse(RequestResponse {
            request_type: request.request_type.clone(),
            request_id: request.request_id.clone(),
            request_status: RequestStatus::success(100),
            response_data: Some(data),
        })
    }

    fn record(session: &Session, name: &str) -> Arc<Mutex<Vec<Option<Value>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on(name, move |data| {
            sink.lock().unwrap().push(data.cloned());
            Ok(())
        });
        seen
    }

    #[tokio::test]
    async fn test_connect_identifies() {
        let (session, mut listener) = new_session();
        let client = session.clone();
        let connect = tokio::spawn(async move { client.connect(URL, None).await });

        let mut peer = listener.accept().await.unwrap();
        let identify = serve_handshake(&mut peer, None).await;
        assert_ok!(connect.await.unwrap());

        assert_eq!(identify.rpc_version, 1);
        assert_eq!(identify.authentication, None);
        assert_eq!(identify.event_subscriptions, Some(EventSubscription::SCENES));
        assert!(session.connected());
        assert_eq!(session.state(), SessionState::Identified);
        assert_eq!(session.negotiated_rpc_version(), Some(1));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (session, _peer, _listener) = connected_session().await;
        assert!(matches!(
            session.connect(URL, None).await,
            Err(SessionError::AlreadyConnected)
        ));
        assert!(session.connected());
    }

    #[tokio::test]
    async fn test_connect_while_connecting_fails() {
        let (session, mut listener) = new_session();
        let client = session.clone();
        let first = tokio::spawn(async move { client.connect(URL, None).await });

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(session.state(), SessionState::AwaitingHello);
        assert!(matches!(
            session.connect(URL, None).await,
            Err(SessionError::AlreadyConnected)
        ));

        serve_handshake(&mut peer, None).await;
        assert_ok!(first.await.unwrap());
        assert_eq!(session.state(), SessionState::Identified);
        assert!(session.connected());
    }

    #[tokio::test]
    async fn test_authentication_with_password() {
        let (session, mut listener) = new_session();
        let client = session.clone();
        let connect = tokio::spawn(async move { client.connect(URL, Some("testpassword")).await });

        let mut peer = listener.accept().await.unwrap();
        let identify = serve_handshake(
            &mut peer,
            Some(AuthenticationChallenge {
                challenge: "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=".to_string(),
                salt: "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=".to_string(),
            }),
        )
        .await;

        assert_ok!(connect.await.unwrap());
        assert_eq!(
            identify.authentication.as_deref(),
            Some("6Ih6ZE7fNq2xx1H/86u/cPeVIV79qvAdxBHNoBg2SnE=")
        );
    }

    #[tokio::test]
    async fn test_authentication_required_without_password() {
        let (session, mut listener) = new_session();
        let client = session.clone();
        let connect = tokio::spawn(async move { client.connect(URL, None).await });

        let mut peer = listener.accept().await.unwrap();
        peer.send(&Message::Hello(Hello {
            obs_web_socket_version: "5.5.0".to_string(),
            rpc_version: 1,
            authentication: Some(AuthenticationChallenge {
                challenge: "c".to_string(),
                salt: "s".to_string(),
            }),
        }));

        assert!(matches!(
            connect.await.unwrap(),
            Err(SessionError::AuthenticationRequired)
        ));
        // The only frame the server sees is the normal close, never an Identify
        match peer.recv().await {
            Some(InboundFrame::Close { code, .. }) => assert_eq!(code, close_code::NORMAL),
            other => panic!("Expected close, got {:?}", other),
        }
        assert!(!session.connected());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_call_before_connect_fails() {
        let (session, _listener) = new_session();
        assert!(matches!(
            session.call("GetVersion", None).await,
            Err(SessionError::NotIdentified)
        ));
        assert!(matches!(session.reidentify(None), Err(SessionError::NotIdentified)));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlate_by_id() {
        let (session, mut peer, _listener) = connected_session().await;

        let a = tokio::spawn({
            let session = session.clone();
            async move { session.call("GetVersion", None).await }
        });
        let first = next_request(&mut peer).await;
        let b = tokio::spawn({
            let session = session.clone();
            async move { session.call("GetStats", Some(json!({"x": 1}))).await }
        });
        let second = next_request(&mut peer).await;
        assert_ne!(first.request_id, second.request_id);

        // Answer in reverse order
        peer.send(&ok_response(&second, json!({"for": second.request_type})));
        peer.send(&ok_response(&first, json!({"for": first.request_type})));

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a, Some(json!({"for": first.request_type})));
        assert_eq!(b, Some(json!({"for": second.request_type})));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_failed_call_reports_server_status() {
        let (session, mut peer, _listener) = connected_session().await;

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.call("GetSceneItemId", None).await }
        });
        let request = next_request(&mut peer).await;
        peer.send(&Message::RequestResponse(RequestResponse {
            request_type: request.request_type.clone(),
            request_id: request.request_id.clone(),
            request_status: RequestStatus::failure(600, "Scene not found"),
            response_data: None,
        }));

        match call.await.unwrap() {
            Err(SessionError::Request(failure)) => {
                assert_eq!(failure.code, 600);
                assert_eq!(failure.comment, "Scene not found");
                assert_eq!(failure.request_type, "GetSceneItemId");
            }
            other => panic!("Expected request failure, got {:?}", other),
        }
        assert!(session.connected());
    }

    #[tokio::test]
    async fn test_batch_with_failing_member_rejects() {
        let (session, mut peer, _listener) = connected_session().await;

        let batch = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .call_batch(
                        vec![
                            BatchRequest::new("GetVersion", None),
                            BatchRequest::new("GetInputMute", Some(json!({"inputName": "Mic"}))),
                        ],
                        BatchOptions {
                            halt_on_failure: Some(false),
                            execution_type: Some(protocol::execution_type::SERIAL_REALTIME),
                        },
                    )
                    .await
            }
        });

        let request = match peer.recv_message().await {
            Some(Message::RequestBatch(request)) => request,
            other => panic!("Expected RequestBatch, got {:?}", other),
        };
        assert_eq!(request.halt_on_failure, Some(false));
        assert_eq!(request.execution_type, Some(0));
        assert_eq!(request.requests.len(), 2);

        peer.send(&Message::RequestBatchResponse(RequestBatchResponse {
            request_id: request.request_id.clone(),
            results: vec![
                BatchResult {
                    request_type: "GetVersion".to_string(),
                    request_id: request.requests[0].request_id.clone(),
                    request_status: RequestStatus::success(100),
                    response_data: Some(json!({})),
                },
                BatchResult {
                    request_type: "GetInputMute".to_string(),
                    request_id: request.requests[1].request_id.clone(),
                    request_status: RequestStatus::failure(600, "No source was found"),
                    response_data: None,
                },
            ],
        }));

        match batch.await.unwrap() {
            Err(SessionError::Request(failure)) => {
                assert_eq!(failure.request_type, "GetInputMute");
                assert_eq!(failure.code, 600);
            }
            other => panic!("Expected batch failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let (session, mut peer, _listener) = connected_session().await;
        let closed = record(&session, lifecycle::CONNECTION_CLOSED);

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let session = session.clone();
                tokio::spawn(async move { session.call(&format!("Req{}", i), None).await })
            })
            .collect();
        for _ in 0..3 {
            next_request(&mut peer).await;
        }
        assert_eq!(session.pending_requests(), 3);

        session.disconnect();

        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(SessionError::ConnectionClosed { code: 1000, .. })
            ));
        }
        assert!(!session.connected());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.pending_requests(), 0);
        assert_eq!(closed.lock().unwrap().len(), 1);

        match peer.recv().await {
            Some(InboundFrame::Close { code, .. }) => assert_eq!(code, close_code::NORMAL),
            other => panic!("Expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_without_data_delivers_none() {
        let (session, peer, _listener) = connected_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on("ExitStarted", move |data| {
            let _ = tx.send(data.cloned());
            Ok(())
        });

        peer.send(&Message::Event(Event {
            event_type: "ExitStarted".to_string(),
            event_intent: EventSubscription::GENERAL,
            event_data: None,
        }));

        assert_eq!(rx.recv().await, Some(None));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let (session, mut peer, _listener) = connected_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on(lifecycle::PARSE_ERROR, move |data| {
            let _ = tx.send(data.cloned());
            Ok(())
        });

        peer.send_text("{ definitely not json");
        peer.send_text(r#"{"op":42,"d":{}}"#);
        let diagnostic = rx.recv().await.unwrap().unwrap();
        assert!(diagnostic["message"].is_string());

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.call("GetVersion", None).await }
        });
        let request = next_request(&mut peer).await;
        peer.send(&ok_response(&request, json!({"ok": true})));
        assert_eq!(call.await.unwrap().unwrap(), Some(json!({"ok": true})));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reidentify_sends_mask() {
        let (session, mut peer, _listener) = connected_session().await;

        assert_ok!(session.reidentify(Some(EventSubscription::INPUTS | EventSubscription::UI)));
        match peer.recv_message().await {
            Some(Message::Reidentify(reidentify)) => {
                assert_eq!(
                    reidentify.event_subscriptions,
                    Some(EventSubscription((1 << 3) | (1 << 10)))
                );
            }
            other => panic!("Expected Reidentify, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_requests_reconnect() {
        let (session, mut peer, mut listener) = connected_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on(lifecycle::RECONNECT_REQUESTED, move |data| {
            let _ = tx.send(data.cloned());
            Ok(())
        });

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.call("GetStats", None).await }
        });
        next_request(&mut peer).await;
        peer.close(close_code::SESSION_INVALIDATED, "kicked");

        assert!(matches!(
            call.await.unwrap(),
            Err(SessionError::ConnectionClosed { code: 4011, .. })
        ));
        assert!(!session.connected());

        let signal = rx.recv().await.unwrap().unwrap();
        assert_eq!(signal["delayMs"], 1000);
        assert_eq!(signal["attempt"], 1);

        // Owner redials; a dropped transport counts as abnormal too
        let client = session.clone();
        let connect = tokio::spawn(async move { client.connect(URL, None).await });
        let peer = listener.accept().await.unwrap();
        drop(peer);
        assert_err!(connect.await.unwrap());

        let signal = rx.recv().await.unwrap().unwrap();
        assert_eq!(signal["delayMs"], 2000);
        assert_eq!(signal["attempt"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redial_cancels_pending_reconnect() {
        let (session, peer, mut listener) = connected_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on(lifecycle::RECONNECT_REQUESTED, move |data| {
            let _ = tx.send(data.cloned());
            Ok(())
        });
        let mut connected = session.watch_connected();

        peer.close(close_code::ABNORMAL, "");
        connected.wait_for(|c| !*c).await.unwrap();
        assert!(session.shared.reconnect.is_pending());

        // Owner redials before the 1000 ms signal is due
        let client = session.clone();
        let connect = tokio::spawn(async move { client.connect(URL, None).await });
        let mut peer = listener.accept().await.unwrap();
        serve_handshake(&mut peer, None).await;
        assert_ok!(connect.await.unwrap());
        assert!(!session.shared.reconnect.is_pending());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert!(session.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_signal_dropped_once_disabled() {
        let (session, _peer, _listener) = connected_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on(lifecycle::RECONNECT_REQUESTED, move |data| {
            let _ = tx.send(data.cloned());
            Ok(())
        });

        session.disconnect();
        session.shared.emit_reconnect_requested(ReconnectSignal {
            delay: Duration::from_millis(1000),
            attempt: 1,
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connected_tracks_state_after_disconnect() {
        let (session, _peer, _listener) = connected_session().await;
        let mut connected = session.watch_connected();
        assert!(*connected.borrow_and_update());

        session.disconnect();
        assert!(connected.has_changed().unwrap());
        assert!(!*connected.borrow_and_update());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_reconnect() {
        let (session, peer, _listener) = connected_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on(lifecycle::RECONNECT_REQUESTED, move |data| {
            let _ = tx.send(data.cloned());
            Ok(())
        });
        let mut connected = session.watch_connected();

        peer.close(close_code::ABNORMAL, "");
        connected.wait_for(|c| !*c).await.unwrap();
        session.disconnect();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_normal_close_does_not_request_reconnect() {
        let (session, peer, _listener) = connected_session().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on(lifecycle::CONNECTION_CLOSED, move |data| {
            let _ = tx.send(data.cloned());
            Ok(())
        });

        peer.close(close_code::NORMAL, "bye");
        let closed = rx.recv().await.unwrap();

        assert_eq!(closed, Some(json!({"code": 1000, "reason": "bye"})));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.connected());
        assert!(!session.shared.reconnect.is_pending());
    }

    #[tokio::test]
    async fn test_can_reconnect_after_disconnect() {
        let (session, _peer, mut listener) = connected_session().await;
        session.disconnect();

        let client = session.clone();
        let connect = tokio::spawn(async move { client.connect(URL, None).await });
        let mut peer = listener.accept().await.unwrap();
        serve_handshake(&mut peer, None).await;

        assert_ok!(connect.await.unwrap());
        assert!(session.connected());
    }
}
