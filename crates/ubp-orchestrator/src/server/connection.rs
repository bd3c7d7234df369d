// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Framed envelope transport over a TCP stream.
//!
//! The stream is split once after accept: the reader half belongs to the
//! session's reader task, the writer half to its writer task. Neither side
//! ever shares the transport, so no write lock is needed.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use ubp_protocol::{framing, DecodeError, Envelope, WireEncoding, FRAME_HEADER_LEN};

/// Split a fresh stream into framed halves.
pub fn split(
    stream: TcpStream,
    encoding: WireEncoding,
    max_frame_len: usize,
) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (
        FrameReader {
            inner: read,
            encoding,
            max_frame_len,
            buf: Vec::with_capacity(4096),
        },
        FrameWriter {
            inner: write,
            encoding,
        },
    )
}

/// Reading side of a connection.
pub struct FrameReader {
    inner: OwnedReadHalf,
    encoding: WireEncoding,
    max_frame_len: usize,
    buf: Vec<u8>,
}

impl FrameReader {
    /// Read one envelope.
    ///
    /// Returns `Ok(None)` if the peer closed the connection cleanly.
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, ConnectionError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ConnectionError::Io(e.to_string())),
        }

        let len = framing::body_len(header);
        if len == 0 {
            return Err(ConnectionError::Protocol("empty frame".into()));
        }
        if len > self.max_frame_len {
            return Err(ConnectionError::Protocol(format!(
                "frame too large: {} > {}",
                len, self.max_frame_len
            )));
        }

        self.buf.clear();
        self.buf.resize(len, 0);
        self.inner
            .read_exact(&mut self.buf)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let env = self.encoding.decode(&self.buf)?;
        Ok(Some(env))
    }
}

/// Writing side of a connection.
pub struct FrameWriter {
    inner: OwnedWriteHalf,
    encoding: WireEncoding,
}

impl FrameWriter {
    /// Write one envelope and flush.
    pub async fn write_envelope(&mut self, env: &Envelope) -> Result<(), ConnectionError> {
        let body = self.encoding.encode(env);
        let framed = framing::frame(&body);
        self.inner
            .write_all(&framed)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        Ok(())
    }

    /// Shut the write side down, letting queued bytes drain.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Connection error types.
#[derive(Debug)]
pub enum ConnectionError {
    Io(String),
    Protocol(String),
    Decode(DecodeError),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(s) => write!(f, "protocol error: {}", s),
            Self::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
