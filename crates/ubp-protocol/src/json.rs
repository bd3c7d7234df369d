// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! JSON encoding of the envelope schema.
//!
//! A conformant alternate to the binary TLV codec: the same envelope
//! structure serialized through serde, framed identically. A connection
//! speaks exactly one encoding for its lifetime.

use std::fmt;
use std::str::FromStr;

use crate::codec::{self, DecodeError};
use crate::envelope::Envelope;

/// Which encoding a listener (and every connection it accepts) speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireEncoding {
    #[default]
    Binary,
    Json,
}

impl WireEncoding {
    /// Encode one envelope to a frame body.
    pub fn encode(&self, env: &Envelope) -> Vec<u8> {
        match self {
            Self::Binary => codec::encode(env),
            // Serialization of a structurally valid envelope cannot fail.
            Self::Json => serde_json::to_vec(env).expect("envelope serializes to JSON"),
        }
    }

    /// Decode one frame body.
    pub fn decode(&self, body: &[u8]) -> Result<Envelope, DecodeError> {
        match self {
            Self::Binary => codec::decode(body),
            Self::Json => decode_json(body),
        }
    }
}

impl fmt::Display for WireEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for WireEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown wire encoding: {}", other)),
        }
    }
}

fn decode_json(body: &[u8]) -> Result<Envelope, DecodeError> {
    serde_json::from_slice(body).map_err(|e| {
        if e.is_eof() {
            DecodeError::Truncated
        } else {
            DecodeError::MalformedField("json")
        }
    })
}
