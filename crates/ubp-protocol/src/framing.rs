// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Length-prefixed framing shared by both wire encodings.
//!
//! Each frame is a 4-byte big-endian length followed by one encoded
//! envelope. Transports read the prefix, validate it against
//! [`MAX_FRAME_LEN`], then read exactly that many bytes.

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Prepend the length prefix to an encoded envelope body.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Parse a length prefix.
pub fn body_len(header: [u8; FRAME_HEADER_LEN]) -> usize {
    u32::from_be_bytes(header) as usize
}
