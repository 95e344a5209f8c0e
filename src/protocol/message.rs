//! Protocol message definitions
//!
//! Defines every message exchanged with the server. Operation-specific
//! payloads (`requestData`, `responseData`, `eventData`) stay opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::ops::{BitAnd, BitOr};
use thiserror::Error;

/// Opcode carried in the `op` field of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Hello = 0,
    Identify = 1,
    Identified = 2,
    Reidentify = 3,
    Event = 5,
    Request = 6,
    RequestResponse = 7,
    RequestBatch = 8,
    RequestBatchResponse = 9,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        match op {
            0 => Some(OpCode::Hello),
            1 => Some(OpCode::Identify),
            2 => Some(OpCode::Identified),
            3 => Some(OpCode::Reidentify),
            5 => Some(OpCode::Event),
            6 => Some(OpCode::Request),
            7 => Some(OpCode::RequestResponse),
            8 => Some(OpCode::RequestBatch),
            9 => Some(OpCode::RequestBatchResponse),
            _ => None,
        }
    }
}

/// Bitmask selecting which event categories the server pushes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSubscription(pub u32);

impl EventSubscription {
    pub const NONE: Self = Self(0);
    pub const GENERAL: Self = Self(1 << 0);
    pub const CONFIG: Self = Self(1 << 1);
    pub const SCENES: Self = Self(1 << 2);
    pub const INPUTS: Self = Self(1 << 3);
    pub const TRANSITIONS: Self = Self(1 << 4);
    pub const FILTERS: Self = Self(1 << 5);
    pub const OUTPUTS: Self = Self(1 << 6);
    pub const SCENE_ITEMS: Self = Self(1 << 7);
    pub const MEDIA_INPUTS: Self = Self(1 << 8);
    pub const VENDORS: Self = Self(1 << 9);
    pub const UI: Self = Self(1 << 10);
    /// Every low-volume category
    pub const ALL: Self = Self((1 << 11) - 1);
    pub const INPUT_VOLUME_METERS: Self = Self(1 << 16);
    pub const INPUT_ACTIVE_STATE_CHANGED: Self = Self(1 << 17);
    pub const INPUT_SHOW_STATE_CHANGED: Self = Self(1 << 18);
    pub const SCENE_ITEM_TRANSFORM_CHANGED: Self = Self(1 << 19);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventSubscription {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for EventSubscription {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl From<u32> for EventSubscription {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}

/// Challenge attached to Hello when the server requires a password
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationChallenge {
    pub challenge: String,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub obs_web_socket_version: String,
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationChallenge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_subscriptions: Option<EventSubscription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identified {
    pub negotiated_rpc_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reidentify {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_subscriptions: Option<EventSubscription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    pub event_intent: EventSubscription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_type: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

/// Outcome reported by the server for a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStatus {
    pub result: bool,
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl RequestStatus {
    pub fn success(code: i32) -> Self {
        Self {
            result: true,
            code,
            comment: None,
        }
    }

    pub fn failure(code: i32, comment: impl Into<String>) -> Self {
        Self {
            result: false,
            code,
            comment: Some(comment.into()),
        }
    }

    /// Convert a failed status into a `RequestFailure` for `request_type`
    pub fn to_failure(&self, request_type: &str) -> RequestFailure {
        RequestFailure {
            code: self.code,
            comment: self.comment.clone().unwrap_or_default(),
            request_type: request_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_type: String,
    pub request_id: String,
    pub request_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

/// One member of an outgoing batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequestItem {
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatch {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_on_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_type: Option<i32>,
    pub requests: Vec<BatchRequestItem>,
}

/// One member result inside a batch response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub request_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub request_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBatchResponse {
    pub request_id: String,
    pub results: Vec<BatchResult>,
}

/// All possible protocol messages
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    Identify(Identify),
    Identified(Identified),
    Reidentify(Reidentify),
    Event(Event),
    Request(Request),
    RequestResponse(RequestResponse),
    RequestBatch(RequestBatch),
    RequestBatchResponse(RequestBatchResponse),
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Hello(_) => OpCode::Hello,
            Message::Identify(_) => OpCode::Identify,
            Message::Identified(_) => OpCode::Identified,
            Message::Reidentify(_) => OpCode::Reidentify,
            Message::Event(_) => OpCode::Event,
            Message::Request(_) => OpCode::Request,
            Message::RequestResponse(_) => OpCode::RequestResponse,
            Message::RequestBatch(_) => OpCode::RequestBatch,
            Message::RequestBatchResponse(_) => OpCode::RequestBatchResponse,
        }
    }
}

/// Failure reported by the server for a request (`result: false`)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{request_type} failed with code {code}: {comment}")]
pub struct RequestFailure {
    pub code: i32,
    pub comment: String,
    pub request_type: String,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}
