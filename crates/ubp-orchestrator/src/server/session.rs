// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Per-connection session lifecycle.
//!
//! A connection starts handshake-pending: the only acceptable first frame
//! is a `HandshakeRequest`, and it must arrive within the handshake
//! timeout. After authentication the session is `Active` and splits into
//! exactly two tasks: the reader (sole caller of the inbound transition
//! function) and the writer (sole consumer of the outbound lane). A
//! session leaves `Active` through `Draining` (waiters failed, writer
//! flushed) to `Closed`, never backwards.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ubp_protocol::{
    envelope::{ERR_BAD_HANDSHAKE, ERR_INTERNAL, ERR_UNSUPPORTED_VERSION},
    DecodeError, Envelope, HandshakeRequest, HandshakeResponse, HandshakeStatus, Payload,
    WireError, WIRE_VERSION,
};

use super::connection::{self, ConnectionError, FrameReader, FrameWriter};
use super::registry::{CloseReason, InstanceHandle};
use crate::credentials::AuthOutcome;
use crate::server::Orchestrator;
use crate::telemetry::{now_ms, MetricsCollector, OUTCOME_ERROR, OUTCOME_OK};

/// Outbound lane depth per instance.
const OUTBOUND_QUEUE: usize = 64;

/// Drive one accepted connection to completion.
pub(crate) async fn run_connection(orch: Orchestrator, stream: TcpStream, peer: SocketAddr) {
    let config = orch.config().clone();
    let (mut reader, mut writer) =
        connection::split(stream, config.wire_encoding, config.max_frame_len);

    // Handshake-pending phase: exactly one HandshakeRequest, in time.
    let first = match timeout(config.handshake_timeout(), reader.read_envelope()).await {
        Err(_) => {
            debug!(peer = %peer, "handshake timeout, closing without response");
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Ok(Some(env))) => env,
        Ok(Err(ConnectionError::Decode(DecodeError::UnsupportedVersion(version)))) => {
            let reply = Envelope::new(Payload::Error(WireError {
                code: ERR_UNSUPPORTED_VERSION,
                message: format!("unsupported wire version: {}", version),
            }));
            let _ = writer.write_envelope(&reply).await;
            return;
        }
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "unreadable first frame");
            let reply = Envelope::new(Payload::Error(WireError {
                code: ERR_BAD_HANDSHAKE,
                message: "malformed handshake".into(),
            }));
            let _ = writer.write_envelope(&reply).await;
            return;
        }
    };

    if !orch.ingress().admit(&first) {
        warn!(peer = %peer, "handshake frame rejected by ingress policy");
        return;
    }

    let trace_id = first.trace_id;
    let request = match first.payload {
        Payload::HandshakeRequest(request) => request,
        other => {
            warn!(peer = %peer, kind = other.kind_name(), "non-handshake frame before authentication");
            let reply = Envelope::derived(
                trace_id,
                Payload::Error(WireError {
                    code: ERR_BAD_HANDSHAKE,
                    message: "first frame must be a handshake request".into(),
                }),
            );
            let _ = writer.write_envelope(&reply).await;
            return;
        }
    };

    let Some((handle, outbound_rx)) = authenticate(&orch, &mut writer, request, trace_id, peer).await
    else {
        return;
    };

    orch.metrics().instance_connected();

    let writer_task = tokio::spawn(writer_loop(
        writer,
        outbound_rx,
        handle.clone(),
        orch.metrics().clone(),
    ));

    let reason = reader_loop(&orch, &mut reader, &handle).await;
    handle.begin_close(reason);

    // Draining: give the writer the drain window to flush, then finish.
    let _ = timeout(config.drain_timeout(), writer_task).await;
    handle.finish_close();
    orch.registry().remove(&handle);
    orch.metrics().instance_disconnected();

    info!(
        bot_id = %handle.bot_id,
        instance_id = %handle.instance_id,
        reason = handle.close_reason().unwrap_or(CloseReason::Disconnected).as_str(),
        component = "session",
        "session closed"
    );
}

/// Validate the handshake credential, register the instance, and send the
/// success response. Returns `None` when the session must not proceed.
async fn authenticate(
    orch: &Orchestrator,
    writer: &mut FrameWriter,
    request: HandshakeRequest,
    trace_id: Uuid,
    peer: SocketAddr,
) -> Option<(Arc<InstanceHandle>, mpsc::Receiver<Envelope>)> {
    let config = orch.config();

    let outcome = match orch
        .credentials()
        .authenticate(&request.bot_id, &request.auth_token)
    {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(peer = %peer, error = %e, "credential store failure during handshake");
            let reply = Envelope::derived(
                trace_id,
                Payload::Error(WireError {
                    code: ERR_INTERNAL,
                    message: "internal error".into(),
                }),
            );
            let _ = writer.write_envelope(&reply).await;
            return None;
        }
    };

    let issued_api_key = match outcome {
        AuthOutcome::LongLived => None,
        AuthOutcome::Issued(key) => Some(key),
        AuthOutcome::Rejected => {
            let reply = Envelope::derived(
                trace_id,
                Payload::HandshakeResponse(HandshakeResponse {
                    status: HandshakeStatus::AuthFailed,
                    heartbeat_interval_secs: 0,
                    issued_api_key: None,
                    error_message: Some("invalid authentication token".into()),
                    wire_version: WIRE_VERSION,
                }),
            );
            let _ = writer.write_envelope(&reply).await;
            return None;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let handle = InstanceHandle::new(
        request.bot_id.clone(),
        request.instance_id.clone(),
        request.capabilities.iter().cloned().collect(),
        config.heartbeat_interval(),
        now_ms(),
        outbound_tx,
    );

    // A reconnect with the same instance id takes over all indexes; the
    // previous session drains with reason Superseded.
    if let Some(previous) = orch.registry().insert(handle.clone()) {
        info!(
            bot_id = %previous.bot_id,
            instance_id = %previous.instance_id,
            component = "session",
            "displaced by reconnect"
        );
        previous.begin_close(CloseReason::Superseded);
    }

    let response = Envelope::derived(
        trace_id,
        Payload::HandshakeResponse(HandshakeResponse {
            status: HandshakeStatus::Success,
            heartbeat_interval_secs: config.heartbeat_interval_secs,
            issued_api_key,
            error_message: None,
            wire_version: request.max_wire_version.min(WIRE_VERSION),
        }),
    );
    if let Err(e) = writer.write_envelope(&response).await {
        warn!(peer = %peer, error = %e, "failed to send handshake response");
        handle.begin_close(CloseReason::Disconnected);
        orch.registry().remove(&handle);
        return None;
    }

    info!(
        trace_id = %trace_id,
        bot_id = %request.bot_id,
        instance_id = %request.instance_id,
        capabilities = ?request.capabilities,
        event = "bot_connected",
        component = "session",
        "instance active"
    );
    Some((handle, outbound_rx))
}

/// The sole consumer of the instance's inbound frames.
///
/// Keeps reading through a server shutdown so in-flight responses can
/// drain; the post-drain force close arrives via the close signal.
async fn reader_loop(
    orch: &Orchestrator,
    reader: &mut FrameReader,
    handle: &Arc<InstanceHandle>,
) -> CloseReason {
    let mut closed = handle.closed_signal();

    loop {
        tokio::select! {
            result = reader.read_envelope() => match result {
                Ok(Some(env)) => {
                    if !orch.ingress().admit(&env) {
                        warn!(
                            trace_id = %env.trace_id,
                            instance_id = %handle.instance_id,
                            kind = env.kind_name(),
                            component = "session",
                            "envelope rejected by ingress policy"
                        );
                        return CloseReason::ProtocolError;
                    }
                    if let Some(reason) = handle_inbound(orch, handle, env) {
                        return reason;
                    }
                }
                Ok(None) => return CloseReason::Disconnected,
                Err(e) => {
                    warn!(
                        instance_id = %handle.instance_id,
                        error = %e,
                        component = "session",
                        "read failure"
                    );
                    return CloseReason::ProtocolError;
                }
            },
            _ = closed.wait_for(|closed| *closed) => {
                return handle.close_reason().unwrap_or(CloseReason::Disconnected);
            }
        }
    }
}

/// Inbound transition function for an `Active` session.
///
/// Returns `Some(reason)` when the envelope forces the session closed.
fn handle_inbound(
    orch: &Orchestrator,
    handle: &Arc<InstanceHandle>,
    env: Envelope,
) -> Option<CloseReason> {
    let metrics = orch.metrics();
    match env.payload {
        Payload::Heartbeat => {
            handle.touch();
            metrics.envelope("heartbeat", OUTCOME_OK);
            debug!(
                trace_id = %env.trace_id,
                bot_id = %handle.bot_id,
                instance_id = %handle.instance_id,
                component = "session",
                "heartbeat"
            );
            None
        }
        Payload::CommandResponse(resp) => {
            orch.dispatcher().deliver_response(handle, resp, env.trace_id);
            None
        }
        Payload::Event(event) => {
            metrics.envelope("event", OUTCOME_OK);
            // Task progress reports ride the event channel; everything else
            // is logged for subscribers out of scope here.
            if event.name == "task.progress" {
                orch.tasks().apply_progress_event(&event.payload);
            }
            info!(
                trace_id = %env.trace_id,
                bot_id = %handle.bot_id,
                instance_id = %handle.instance_id,
                event_name = %event.name,
                component = "session",
                "event received"
            );
            None
        }
        Payload::Error(err) => {
            metrics.envelope("error", OUTCOME_OK);
            warn!(
                trace_id = %env.trace_id,
                instance_id = %handle.instance_id,
                code = err.code,
                message = %err.message,
                component = "session",
                "error frame from instance"
            );
            None
        }
        Payload::HandshakeRequest(_) => {
            metrics.envelope("handshake_request", OUTCOME_ERROR);
            warn!(
                instance_id = %handle.instance_id,
                component = "session",
                "handshake repeated on active session"
            );
            Some(CloseReason::ProtocolError)
        }
        other @ (Payload::HandshakeResponse(_) | Payload::CommandRequest(_)) => {
            metrics.envelope(other.kind_name(), OUTCOME_ERROR);
            warn!(
                instance_id = %handle.instance_id,
                kind = other.kind_name(),
                component = "session",
                "unexpected frame direction, dropping"
            );
            None
        }
    }
}

/// The sole writer to the transport: drains the outbound lane in FIFO
/// order, flushing what remains once the session starts draining.
async fn writer_loop(
    mut writer: FrameWriter,
    mut outbound: mpsc::Receiver<Envelope>,
    handle: Arc<InstanceHandle>,
    metrics: Arc<MetricsCollector>,
) {
    let mut closed: watch::Receiver<bool> = handle.closed_signal();
    loop {
        tokio::select! {
            env = outbound.recv() => match env {
                Some(env) => {
                    let kind = env.kind_name();
                    if writer.write_envelope(&env).await.is_err() {
                        metrics.envelope(kind, OUTCOME_ERROR);
                        handle.begin_close(CloseReason::Disconnected);
                        break;
                    }
                    metrics.envelope(kind, OUTCOME_OK);
                }
                None => break,
            },
            _ = async {
                loop {
                    if *closed.borrow() {
                        return;
                    }
                    if closed.changed().await.is_err() {
                        return;
                    }
                }
            } => {
                while let Ok(env) = outbound.try_recv() {
                    if writer.write_envelope(&env).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    writer.shutdown().await;
}
