// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! UBP wire protocol.
//!
//! Defines the envelope exchanged between the orchestrator and its agents,
//! and the two conformant encodings of it:
//!
//! - a canonical length-prefixed binary TLV encoding ([`codec`])
//! - a JSON encoding of the identical schema ([`json`])
//!
//! An encoding is chosen per connection and never mixed mid-stream.
//!
//! Wire format (binary, per frame):
//! ```text
//! +----------------+---------------------------------------------+
//! | Length (4B BE) | version | kind | message_id | trace_id | TLV |
//! +----------------+---------------------------------------------+
//! ```

pub mod codec;
pub mod envelope;
pub mod framing;
pub mod json;

pub use codec::{decode, encode, DecodeError};
pub use envelope::{
    CommandRequest, CommandResponse, CommandStatus, Envelope, Event, HandshakeRequest,
    HandshakeResponse, HandshakeStatus, Payload, UnknownField, WireError, WIRE_VERSION,
};
pub use framing::{frame, FRAME_HEADER_LEN, MAX_FRAME_LEN};
pub use json::WireEncoding;
