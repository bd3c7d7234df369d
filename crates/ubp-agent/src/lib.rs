// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Reference agent client.
//!
//! The client side of the UBP data plane: connect, handshake, heartbeat,
//! receive commands, send responses and events. Platform adapters build on
//! this; the orchestrator's end-to-end tests drive it directly.
//!
//! ```no_run
//! # async fn demo() -> Result<(), ubp_agent::AgentError> {
//! use ubp_agent::{AgentClient, AgentOptions};
//! use ubp_protocol::CommandStatus;
//!
//! let mut agent = AgentClient::connect(
//!     "127.0.0.1:7780".parse().unwrap(),
//!     AgentOptions::new("bot-1", "instance-1", "token")
//!         .capabilities(["task.execute"]),
//! )
//! .await?;
//!
//! while let Some(command) = agent.next_command().await {
//!     agent
//!         .respond(&command, CommandStatus::Success, b"{}".to_vec(), None)
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use ubp_protocol::{
    framing, CommandRequest, CommandResponse, CommandStatus, Envelope, Event, HandshakeRequest,
    HandshakeResponse, HandshakeStatus, Payload, WireEncoding, FRAME_HEADER_LEN, MAX_FRAME_LEN,
    WIRE_VERSION,
};

const HANDSHAKE_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_QUEUE: usize = 32;

/// Client errors.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("handshake rejected ({status:?}): {message}")]
    HandshakeFailed {
        status: HandshakeStatus,
        message: String,
    },
    #[error("connection closed")]
    Closed,
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Connection options.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub bot_id: String,
    pub instance_id: String,
    pub auth_token: String,
    pub capabilities: Vec<String>,
    pub encoding: WireEncoding,
    /// Send heartbeats automatically at the orchestrator's interval.
    pub auto_heartbeat: bool,
    /// Heartbeat faster (or slower) than the orchestrator asked for.
    pub heartbeat_override: Option<Duration>,
}

impl AgentOptions {
    pub fn new(
        bot_id: impl Into<String>,
        instance_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            instance_id: instance_id.into(),
            auth_token: auth_token.into(),
            capabilities: Vec::new(),
            encoding: WireEncoding::Binary,
            auto_heartbeat: true,
            heartbeat_override: None,
        }
    }

    pub fn capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn encoding(mut self, encoding: WireEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn manual_heartbeat(mut self) -> Self {
        self.auto_heartbeat = false;
        self
    }

    pub fn heartbeat_every(mut self, interval: Duration) -> Self {
        self.heartbeat_override = Some(interval);
        self
    }
}

/// A command delivered to the agent.
#[derive(Debug, Clone)]
pub struct IncomingCommand {
    pub trace_id: Uuid,
    pub request: CommandRequest,
}

/// A connected, authenticated agent session.
#[derive(Debug)]
pub struct AgentClient {
    handshake: HandshakeResponse,
    outgoing: mpsc::Sender<Envelope>,
    commands: mpsc::Receiver<IncomingCommand>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl AgentClient {
    /// Connect and handshake. Fails unless the orchestrator answers
    /// `SUCCESS` in time.
    pub async fn connect(addr: SocketAddr, opts: AgentOptions) -> Result<Self, AgentError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();
        let encoding = opts.encoding;

        let hello = Envelope::new(Payload::HandshakeRequest(HandshakeRequest {
            bot_id: opts.bot_id.clone(),
            instance_id: opts.instance_id.clone(),
            auth_token: opts.auth_token.clone(),
            capabilities: opts.capabilities.clone(),
            max_wire_version: WIRE_VERSION,
        }));
        write_frame(&mut write_half, encoding, &hello).await?;

        let reply = tokio::time::timeout(HANDSHAKE_REPLY_TIMEOUT, read_frame(&mut read_half, encoding))
            .await
            .map_err(|_| AgentError::Protocol("no handshake response".into()))??
            .ok_or(AgentError::Closed)?;

        let handshake = match reply.payload {
            Payload::HandshakeResponse(resp) => resp,
            Payload::Error(err) => {
                return Err(AgentError::Protocol(format!(
                    "orchestrator error {}: {}",
                    err.code, err.message
                )))
            }
            other => {
                return Err(AgentError::Protocol(format!(
                    "unexpected first frame: {}",
                    other.kind_name()
                )))
            }
        };
        if handshake.status != HandshakeStatus::Success {
            return Err(AgentError::HandshakeFailed {
                status: handshake.status,
                message: handshake
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "handshake rejected".into()),
            });
        }

        let (outgoing, outgoing_rx) = mpsc::channel(COMMAND_QUEUE);
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);

        let reader_task = tokio::spawn(reader_loop(read_half, encoding, commands_tx));
        let writer_task = tokio::spawn(writer_loop(write_half, encoding, outgoing_rx));

        let heartbeat_task = if opts.auto_heartbeat {
            let interval = opts.heartbeat_override.unwrap_or(Duration::from_secs(
                u64::from(handshake.heartbeat_interval_secs.max(1)),
            ));
            let tx = outgoing.clone();
            Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if tx.send(Envelope::new(Payload::Heartbeat)).await.is_err() {
                        break;
                    }
                }
            }))
        } else {
            None
        };

        Ok(Self {
            handshake,
            outgoing,
            commands,
            reader_task,
            writer_task,
            heartbeat_task,
        })
    }

    /// The handshake response, including the negotiated wire version.
    pub fn handshake(&self) -> &HandshakeResponse {
        &self.handshake
    }

    /// The long-lived key issued on a one-time-token handshake.
    pub fn issued_api_key(&self) -> Option<&str> {
        self.handshake.issued_api_key.as_deref()
    }

    /// Next command from the orchestrator; `None` once the session closed.
    pub async fn next_command(&mut self) -> Option<IncomingCommand> {
        self.commands.recv().await
    }

    /// Answer a command, preserving its trace id.
    pub async fn respond(
        &self,
        command: &IncomingCommand,
        status: CommandStatus,
        result: Vec<u8>,
        error_message: Option<String>,
    ) -> Result<(), AgentError> {
        let env = Envelope::derived(
            command.trace_id,
            Payload::CommandResponse(CommandResponse {
                command_id: command.request.command_id,
                status,
                result,
                error_message,
            }),
        );
        self.outgoing.send(env).await.map_err(|_| AgentError::Closed)
    }

    /// Send an unsolicited event.
    pub async fn send_event(&self, name: &str, payload: Vec<u8>) -> Result<(), AgentError> {
        let env = Envelope::new(Payload::Event(Event {
            name: name.to_string(),
            payload,
        }));
        self.outgoing.send(env).await.map_err(|_| AgentError::Closed)
    }

    /// Send one heartbeat now (for manual-heartbeat agents).
    pub async fn send_heartbeat(&self) -> Result<(), AgentError> {
        self.outgoing
            .send(Envelope::new(Payload::Heartbeat))
            .await
            .map_err(|_| AgentError::Closed)
    }

    /// Stop the automatic heartbeat loop, simulating a hung agent.
    pub fn stop_heartbeats(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }

    /// Tear the session down.
    pub async fn close(mut self) {
        self.stop_heartbeats();
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    encoding: WireEncoding,
    commands_tx: mpsc::Sender<IncomingCommand>,
) {
    loop {
        match read_frame(&mut read_half, encoding).await {
            Ok(Some(env)) => match env.payload {
                Payload::CommandRequest(request) => {
                    let incoming = IncomingCommand {
                        trace_id: env.trace_id,
                        request,
                    };
                    if commands_tx.send(incoming).await.is_err() {
                        break;
                    }
                }
                Payload::Error(err) => {
                    warn!(code = err.code, message = %err.message, "error from orchestrator");
                }
                other => {
                    debug!(kind = other.kind_name(), "ignoring frame");
                }
            },
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "read loop ended");
                break;
            }
        }
    }
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    encoding: WireEncoding,
    mut outgoing_rx: mpsc::Receiver<Envelope>,
) {
    while let Some(env) = outgoing_rx.recv().await {
        if write_frame(&mut write_half, encoding, &env).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn write_frame(
    write_half: &mut OwnedWriteHalf,
    encoding: WireEncoding,
    env: &Envelope,
) -> Result<(), AgentError> {
    let body = encoding.encode(env);
    write_half.write_all(&framing::frame(&body)).await?;
    write_half.flush().await?;
    Ok(())
}

async fn read_frame(
    read_half: &mut OwnedReadHalf,
    encoding: WireEncoding,
) -> Result<Option<Envelope>, AgentError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_half.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = framing::body_len(header);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(AgentError::Protocol(format!("bad frame length: {}", len)));
    }
    let mut body = vec![0u8; len];
    read_half.read_exact(&mut body).await?;
    encoding
        .decode(&body)
        .map(Some)
        .map_err(|e| AgentError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal orchestrator stand-in: answers the handshake, then sends one
    /// command and records the response.
    async fn fake_server(
        listener: TcpListener,
        handshake_status: HandshakeStatus,
    ) -> Option<CommandResponse> {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read, mut write) = stream.into_split();
        let encoding = WireEncoding::Binary;

        let hello = read_frame(&mut read, encoding).await.unwrap().unwrap();
        let Payload::HandshakeRequest(req) = hello.payload else {
            panic!("expected handshake request first");
        };
        assert_eq!(req.max_wire_version, WIRE_VERSION);

        let reply = Envelope::derived(
            hello.trace_id,
            Payload::HandshakeResponse(HandshakeResponse {
                status: handshake_status,
                heartbeat_interval_secs: 30,
                issued_api_key: Some("issued-key".into()),
                error_message: None,
                wire_version: WIRE_VERSION,
            }),
        );
        write_frame(&mut write, encoding, &reply).await.unwrap();
        if handshake_status != HandshakeStatus::Success {
            return None;
        }

        let command = Envelope::new(Payload::CommandRequest(CommandRequest {
            command_id: Uuid::new_v4(),
            command_name: "t.exec".into(),
            arguments: b"{\"x\":1}".to_vec(),
            deadline_ms: 1000,
        }));
        write_frame(&mut write, encoding, &command).await.unwrap();

        loop {
            let env = read_frame(&mut read, encoding).await.unwrap()?;
            match env.payload {
                Payload::CommandResponse(resp) => {
                    assert_eq!(env.trace_id, command.trace_id);
                    return Some(resp);
                }
                Payload::Heartbeat => continue,
                other => panic!("unexpected frame: {}", other.kind_name()),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_and_serve_one_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(fake_server(listener, HandshakeStatus::Success));

        let mut agent = AgentClient::connect(
            addr,
            AgentOptions::new("b1", "i1", "tok").capabilities(["t.exec"]),
        )
        .await
        .unwrap();
        assert_eq!(agent.issued_api_key(), Some("issued-key"));

        let command = agent.next_command().await.unwrap();
        assert_eq!(command.request.command_name, "t.exec");
        agent
            .respond(&command, CommandStatus::Success, b"{\"y\":2}".to_vec(), None)
            .await
            .unwrap();

        let resp = server.await.unwrap().unwrap();
        assert_eq!(resp.status, CommandStatus::Success);
        assert_eq!(resp.result, b"{\"y\":2}".to_vec());
    }

    #[tokio::test]
    async fn test_handshake_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_server(listener, HandshakeStatus::AuthFailed));

        let err = AgentClient::connect(addr, AgentOptions::new("b1", "i1", "bad"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::HandshakeFailed {
                status: HandshakeStatus::AuthFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_auto_heartbeat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read, mut write) = stream.into_split();
            let encoding = WireEncoding::Binary;
            let hello = read_frame(&mut read, encoding).await.unwrap().unwrap();
            let reply = Envelope::derived(
                hello.trace_id,
                Payload::HandshakeResponse(HandshakeResponse {
                    status: HandshakeStatus::Success,
                    heartbeat_interval_secs: 30,
                    issued_api_key: None,
                    error_message: None,
                    wire_version: WIRE_VERSION,
                }),
            );
            write_frame(&mut write, encoding, &reply).await.unwrap();

            // First post-handshake frame should be a heartbeat.
            let env = read_frame(&mut read, encoding).await.unwrap().unwrap();
            matches!(env.payload, Payload::Heartbeat)
        });

        let _agent = AgentClient::connect(
            addr,
            AgentOptions::new("b1", "i1", "tok").heartbeat_every(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        assert!(server.await.unwrap());
    }
}
