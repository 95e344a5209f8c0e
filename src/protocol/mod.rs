//! Protocol module - Defines the wire protocol spoken with the OBS websocket server
//!
//! Every frame is a JSON text message with two top-level fields:
//! - `op`: integer opcode selecting the message variant
//! - `d`: payload object whose shape is fixed per opcode

mod auth;
mod codec;
mod message;

pub use auth::*;
pub use codec::*;
pub use message::*;

/// RPC version requested in Identify
pub const RPC_VERSION: u32 = 1;

/// Default port of the OBS websocket server
pub const DEFAULT_PORT: u16 = 4455;

/// Websocket subprotocol selecting JSON encoding
pub const SUBPROTOCOL: &str = "obswebsocket.json";

/// Websocket close codes observed by the client
pub mod close_code {
    /// Normal closure, never triggers a reconnect
    pub const NORMAL: u16 = 1000;
    /// Connection dropped without a close frame
    pub const ABNORMAL: u16 = 1006;

    pub const UNKNOWN_REASON: u16 = 4000;
    pub const MESSAGE_DECODE_ERROR: u16 = 4002;
    pub const MISSING_DATA_FIELD: u16 = 4003;
    pub const INVALID_DATA_FIELD_TYPE: u16 = 4004;
    pub const INVALID_DATA_FIELD_VALUE: u16 = 4005;
    pub const UNKNOWN_OP_CODE: u16 = 4006;
    pub const NOT_IDENTIFIED: u16 = 4007;
    pub const ALREADY_IDENTIFIED: u16 = 4008;
    pub const AUTHENTICATION_FAILED: u16 = 4009;
    pub const UNSUPPORTED_RPC_VERSION: u16 = 4010;
    pub const SESSION_INVALIDATED: u16 = 4011;
    pub const UNSUPPORTED_FEATURE: u16 = 4012;
}

/// Execution modes for request batches, forwarded to the server untouched
pub mod execution_type {
    pub const NONE: i32 = -1;
    pub const SERIAL_REALTIME: i32 = 0;
    pub const SERIAL_FRAME: i32 = 1;
    pub const PARALLEL: i32 = 2;
}
