// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Envelope and payload types.
//!
//! One envelope wraps exactly one payload variant. `message_id` is unique
//! per envelope; `trace_id` is carried verbatim onto every envelope that is
//! causally derived from an inbound one.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum schema version this build understands.
pub const WIRE_VERSION: u8 = 1;

// Wire error codes carried in the `Error` payload.
pub const ERR_BAD_HANDSHAKE: u16 = 1;
pub const ERR_UNSUPPORTED_VERSION: u16 = 2;
pub const ERR_INTERNAL: u16 = 3;

/// A single tagged wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub trace_id: Uuid,
    pub payload: Payload,
    /// Unknown TLV fields seen while decoding. Preserved verbatim so a
    /// forwarded envelope round-trips; never interpreted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<UnknownField>,
}

impl Envelope {
    /// New envelope starting a fresh causal chain.
    pub fn new(payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            payload,
            extensions: Vec::new(),
        }
    }

    /// New envelope causally derived from an inbound one: fresh
    /// `message_id`, inherited `trace_id`.
    pub fn derived(trace_id: Uuid, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            trace_id,
            payload,
            extensions: Vec::new(),
        }
    }

    /// Short name of the payload variant, for logs and metrics.
    pub fn kind_name(&self) -> &'static str {
        self.payload.kind_name()
    }
}

/// A TLV field the decoder did not recognize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownField {
    pub tag: u8,
    pub data: Vec<u8>,
}

/// Payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Heartbeat,
    CommandRequest(CommandRequest),
    CommandResponse(CommandResponse),
    Event(Event),
    Error(WireError),
}

impl Payload {
    /// Short name of the variant, for logs and metrics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::HandshakeRequest(_) => "handshake_request",
            Self::HandshakeResponse(_) => "handshake_response",
            Self::Heartbeat => "heartbeat",
            Self::CommandRequest(_) => "command_request",
            Self::CommandResponse(_) => "command_response",
            Self::Event(_) => "event",
            Self::Error(_) => "error",
        }
    }
}

/// First frame from an agent. Anything else before authentication is a
/// protocol violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub bot_id: String,
    /// Chosen by the connecting client; a reconnect with the same id
    /// displaces the previous session.
    pub instance_id: String,
    /// One-time registration token or long-lived API key.
    pub auth_token: String,
    /// Runtime capabilities; authoritative over the definition's advisory
    /// list.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Highest schema version the client can speak.
    #[serde(default = "default_wire_version")]
    pub max_wire_version: u8,
}

fn default_wire_version() -> u8 {
    WIRE_VERSION
}

/// First frame from the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub status: HandshakeStatus,
    pub heartbeat_interval_secs: u32,
    /// Present only when a one-time token was consumed: the freshly minted
    /// long-lived key, shown exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Version both sides will speak for the rest of the session.
    pub wire_version: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeStatus {
    Success,
    AuthFailed,
    Error,
}

impl HandshakeStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Success),
            1 => Some(Self::AuthFailed),
            2 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::AuthFailed => 1,
            Self::Error => 2,
        }
    }
}

/// A command directed at a single instance, correlated by `command_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command_id: Uuid,
    pub command_name: String,
    /// Opaque argument blob (JSON by convention at the admin boundary);
    /// the orchestrator never interprets it.
    #[serde(default)]
    pub arguments: Vec<u8>,
    pub deadline_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: Uuid,
    pub status: CommandStatus,
    #[serde(default)]
    pub result: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Success,
    ExecutionError,
    InvalidArguments,
}

impl CommandStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Success),
            1 => Some(Self::ExecutionError),
            2 => Some(Self::InvalidArguments),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::ExecutionError => 1,
            Self::InvalidArguments => 2,
        }
    }
}

/// Unsolicited notification from an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Protocol-level error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: u16,
    pub message: String,
}
