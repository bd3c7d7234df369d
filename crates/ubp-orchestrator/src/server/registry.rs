// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Live-instance registry.
//!
//! Three indexes kept mutually consistent under one lock: by instance id,
//! by bot id, and by declared runtime capability. Capability selection is
//! round-robin over the `Active`, heartbeat-fresh instances, deterministic
//! for a given registry state via a monotonic selection counter.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use ubp_protocol::{CommandResponse, Envelope};

use super::dispatch::DispatchError;

/// Why a session left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the transport or a transport error occurred.
    Disconnected,
    /// No heartbeat within the grace window.
    HeartbeatMiss,
    /// Displaced by a reconnect claiming the same instance id.
    Superseded,
    /// Torn down by an admin operation (deregister or bot deletion).
    AdminClose,
    /// Orchestrator shutdown.
    Shutdown,
    /// Protocol violation after the handshake.
    ProtocolError,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::HeartbeatMiss => "heartbeat_miss",
            Self::Superseded => "superseded",
            Self::AdminClose => "admin_close",
            Self::Shutdown => "shutdown",
            Self::ProtocolError => "protocol_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Active,
    Draining,
    Closed,
}

/// Waiter completion value: the correlated response, or the failure cause.
pub type CommandOutcome = Result<CommandResponse, DispatchError>;

/// Shared state for one authenticated session.
///
/// The reader task, writer task, dispatcher, and sweeper all hold the same
/// `Arc<InstanceHandle>`; the transport itself stays private to the
/// connection tasks.
pub struct InstanceHandle {
    pub bot_id: String,
    pub instance_id: String,
    pub connected_at_ms: u64,
    pub heartbeat_interval: Duration,
    pub capabilities: HashSet<String>,
    last_heartbeat: Mutex<Instant>,
    status: Mutex<InstanceStatus>,
    close_reason: Mutex<Option<CloseReason>>,
    outbound: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<CommandOutcome>>>,
    closed_tx: watch::Sender<bool>,
}

impl InstanceHandle {
    pub fn new(
        bot_id: String,
        instance_id: String,
        capabilities: HashSet<String>,
        heartbeat_interval: Duration,
        connected_at_ms: u64,
        outbound: mpsc::Sender<Envelope>,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            bot_id,
            instance_id,
            connected_at_ms,
            heartbeat_interval,
            capabilities,
            last_heartbeat: Mutex::new(Instant::now()),
            status: Mutex::new(InstanceStatus::Active),
            close_reason: Mutex::new(None),
            outbound,
            pending: Mutex::new(HashMap::new()),
            closed_tx,
        })
    }

    /// Record a heartbeat.
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Milliseconds since the last heartbeat.
    pub fn last_heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// True once `grace_factor * heartbeat_interval` has passed without a
    /// heartbeat.
    pub fn heartbeat_expired(&self, grace_factor: u32) -> bool {
        self.last_heartbeat_age() > self.heartbeat_interval * grace_factor
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.lock()
    }

    pub fn is_active(&self) -> bool {
        self.status() == InstanceStatus::Active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Subscribe to the close signal. The returned receiver observes a
    /// close that happened before the subscription as well.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Queue an envelope on the outbound lane (FIFO per instance).
    pub async fn enqueue(&self, env: Envelope) -> Result<(), DispatchError> {
        self.outbound
            .send(env)
            .await
            .map_err(|_| DispatchError::InstanceGone)
    }

    /// Install a waiter for `command_id`.
    pub fn register_waiter(&self, command_id: Uuid, tx: oneshot::Sender<CommandOutcome>) {
        self.pending.lock().insert(command_id, tx);
    }

    /// Remove and return the waiter for `command_id`, if still installed.
    pub fn take_waiter(&self, command_id: &Uuid) -> Option<oneshot::Sender<CommandOutcome>> {
        self.pending.lock().remove(command_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Transition out of `Active`: record the reason, fail every
    /// outstanding waiter with `InstanceGone`, and wake the connection
    /// tasks. Idempotent; only the first call wins.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        {
            let mut status = self.status.lock();
            if *status != InstanceStatus::Active {
                return false;
            }
            *status = InstanceStatus::Draining;
            *self.close_reason.lock() = Some(reason);
        }

        let waiters: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (_, tx) in waiters {
            let _ = tx.send(Err(DispatchError::InstanceGone));
        }

        self.closed_tx.send_replace(true);
        true
    }

    /// Final transition once the writer has drained.
    pub fn finish_close(&self) {
        *self.status.lock() = InstanceStatus::Closed;
    }
}

#[derive(Default)]
struct Indexes {
    by_instance: HashMap<String, Arc<InstanceHandle>>,
    by_bot: HashMap<String, BTreeSet<String>>,
    by_capability: HashMap<String, BTreeSet<String>>,
}

impl Indexes {
    fn insert(&mut self, handle: Arc<InstanceHandle>) {
        let id = handle.instance_id.clone();
        self.by_bot
            .entry(handle.bot_id.clone())
            .or_default()
            .insert(id.clone());
        for cap in &handle.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(id.clone());
        }
        self.by_instance.insert(id, handle);
    }

    fn remove(&mut self, handle: &Arc<InstanceHandle>) {
        let id = &handle.instance_id;
        if let Some(ids) = self.by_bot.get_mut(&handle.bot_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_bot.remove(&handle.bot_id);
            }
        }
        for cap in &handle.capabilities {
            if let Some(ids) = self.by_capability.get_mut(cap) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_capability.remove(cap);
                }
            }
        }
        self.by_instance.remove(id);
    }
}

/// Concurrent-safe instance index.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    indexes: Arc<RwLock<Indexes>>,
    /// Monotonic selection counter for round-robin tie-breaking.
    rr: Arc<AtomicU64>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. If another session already holds the same
    /// instance id, it is removed from every index and returned so the
    /// caller can close it as superseded. All index updates happen inside
    /// one critical section.
    pub fn insert(&self, handle: Arc<InstanceHandle>) -> Option<Arc<InstanceHandle>> {
        let mut indexes = self.indexes.write();
        let displaced = indexes.by_instance.get(&handle.instance_id).cloned();
        if let Some(previous) = &displaced {
            indexes.remove(previous);
        }
        indexes.insert(handle);
        displaced
    }

    /// Remove `handle` if it is still the registered owner of its instance
    /// id. A displaced session must not unregister its successor.
    pub fn remove(&self, handle: &Arc<InstanceHandle>) -> bool {
        let mut indexes = self.indexes.write();
        match indexes.by_instance.get(&handle.instance_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                indexes.remove(handle);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<InstanceHandle>> {
        self.indexes.read().by_instance.get(instance_id).cloned()
    }

    /// Instances of a bot that are `Active` and heartbeat-fresh.
    pub fn list_by_bot(&self, bot_id: &str, grace_factor: u32) -> Vec<Arc<InstanceHandle>> {
        let indexes = self.indexes.read();
        let Some(ids) = indexes.by_bot.get(bot_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| indexes.by_instance.get(id))
            .filter(|h| h.is_active() && !h.heartbeat_expired(grace_factor))
            .cloned()
            .collect()
    }

    /// All registered handles (any status), for sweeps and shutdown.
    pub fn all(&self) -> Vec<Arc<InstanceHandle>> {
        self.indexes.read().by_instance.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.indexes.read().by_instance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.read().by_instance.is_empty()
    }

    /// Round-robin selection among the eligible instances of `bot_id`
    /// holding `capability`. Draining, closed, and heartbeat-expired
    /// instances are never returned.
    pub fn select(
        &self,
        bot_id: &str,
        capability: &str,
        grace_factor: u32,
    ) -> Option<Arc<InstanceHandle>> {
        let indexes = self.indexes.read();
        let bot_ids = indexes.by_bot.get(bot_id)?;
        let cap_ids = indexes.by_capability.get(capability)?;

        // BTreeSet intersection keeps candidate order deterministic.
        let eligible: Vec<&Arc<InstanceHandle>> = bot_ids
            .intersection(cap_ids)
            .filter_map(|id| indexes.by_instance.get(id))
            .filter(|h| h.is_active() && !h.heartbeat_expired(grace_factor))
            .collect();

        if eligible.is_empty() {
            return None;
        }
        let turn = self.rr.fetch_add(1, Ordering::Relaxed) as usize;
        Some(eligible[turn % eligible.len()].clone())
    }
}
