// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Command dispatch and response correlation.
//!
//! "Send this command to an eligible instance and wait for the matching
//! response." The waiter is a one-shot channel installed in the instance's
//! pending table under the command id; it resolves with the response, the
//! deadline, or the instance leaving `Active`. Whatever happens, the entry
//! is removed. Dispatch is never retried at this layer.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use ubp_protocol::{CommandRequest, CommandResponse, Envelope, Payload};

use super::registry::{InstanceHandle, InstanceRegistry};
use crate::telemetry::{MetricsCollector, OUTCOME_DROPPED, OUTCOME_OK};

/// Dispatch failure causes. A response with a non-success status is not a
/// dispatch failure; callers inspect `CommandResponse::status` themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// No `Active` instance of the bot holds the capability.
    NoCapableInstance,
    /// The instance left `Active` while the command was in flight.
    InstanceGone,
    /// Deadline elapsed without a response.
    Timeout,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCapableInstance => write!(f, "no capable instance"),
            Self::InstanceGone => write!(f, "instance gone"),
            Self::Timeout => write!(f, "dispatch timeout"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Routes commands to instances and correlates their responses.
#[derive(Clone)]
pub struct Dispatcher {
    registry: InstanceRegistry,
    metrics: Arc<MetricsCollector>,
    grace_factor: u32,
}

impl Dispatcher {
    pub fn new(registry: InstanceRegistry, metrics: Arc<MetricsCollector>, grace_factor: u32) -> Self {
        Self {
            registry,
            metrics,
            grace_factor,
        }
    }

    /// Pick the instance a dispatch would target right now.
    pub fn select_instance(&self, bot_id: &str, capability: &str) -> Option<Arc<InstanceHandle>> {
        self.registry.select(bot_id, capability, self.grace_factor)
    }

    /// Select an instance of `bot_id` able to service `command_name`, send
    /// the command, and wait for the correlated response until `deadline`.
    pub async fn dispatch(
        &self,
        bot_id: &str,
        command_name: &str,
        arguments: Vec<u8>,
        deadline: Duration,
        trace_id: Uuid,
    ) -> Result<CommandResponse, DispatchError> {
        let handle = self
            .registry
            .select(bot_id, command_name, self.grace_factor)
            .ok_or(DispatchError::NoCapableInstance)?;
        self.dispatch_to(&handle, command_name, arguments, deadline, trace_id)
            .await
    }

    /// Dispatch to a specific instance (used by targeted sends such as
    /// best-effort cancels).
    pub async fn dispatch_to(
        &self,
        handle: &Arc<InstanceHandle>,
        command_name: &str,
        arguments: Vec<u8>,
        deadline: Duration,
        trace_id: Uuid,
    ) -> Result<CommandResponse, DispatchError> {
        let command_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        handle.register_waiter(command_id, tx);
        // Removes the entry if this future is dropped or times out before a
        // completion arrives.
        let mut guard = WaiterGuard {
            handle,
            command_id,
            armed: true,
        };

        let env = Envelope::derived(
            trace_id,
            Payload::CommandRequest(CommandRequest {
                command_id,
                command_name: command_name.to_string(),
                arguments,
                deadline_ms: deadline.as_millis().min(u128::from(u32::MAX)) as u32,
            }),
        );

        debug!(
            trace_id = %trace_id,
            bot_id = %handle.bot_id,
            instance_id = %handle.instance_id,
            command_id = %command_id,
            command_name = %command_name,
            component = "dispatcher",
            "command enqueued"
        );

        let started = Instant::now();
        handle.enqueue(env).await?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => {
                guard.armed = false;
                if outcome.is_ok() {
                    self.metrics
                        .command_latency(command_name, started.elapsed());
                }
                outcome
            }
            // The waiter sender was dropped without a completion; treat as
            // the session vanishing.
            Ok(Err(_)) => {
                guard.armed = false;
                Err(DispatchError::InstanceGone)
            }
            Err(_) => Err(DispatchError::Timeout),
        }
    }

    /// Complete the waiter for an inbound response. Late or duplicate
    /// responses are dropped with a logged warning.
    pub fn deliver_response(&self, handle: &Arc<InstanceHandle>, resp: CommandResponse, trace_id: Uuid) {
        match handle.take_waiter(&resp.command_id) {
            Some(tx) => {
                self.metrics.envelope("command_response", OUTCOME_OK);
                if tx.send(Ok(resp)).is_err() {
                    // Waiter gave up between removal and completion.
                    self.metrics.envelope("command_response", OUTCOME_DROPPED);
                }
            }
            None => {
                warn!(
                    trace_id = %trace_id,
                    instance_id = %handle.instance_id,
                    command_id = %resp.command_id,
                    component = "dispatcher",
                    "dropping response with unknown or expired correlation"
                );
                self.metrics.envelope("command_response", OUTCOME_DROPPED);
            }
        }
    }
}

struct WaiterGuard<'a> {
    handle: &'a Arc<InstanceHandle>,
    command_id: Uuid,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.handle.take_waiter(&self.command_id);
        }
    }
}
