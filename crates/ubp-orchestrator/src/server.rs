// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Orchestrator core: listeners, sweepers, and shutdown.
//!
//! The root object owns every piece of shared state (no module-global
//! registries): credential store, instance registry, dispatcher, task
//! manager, context store, and metrics. `run` drives the data-plane accept
//! loop, the admin HTTP server, and the maintenance sweeps until shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use ubp_persistence::StateStore;

use crate::config::Config;
use crate::context::ContextStore;
use crate::credentials::CredentialStore;
use crate::tasks::{RetryPolicy, TaskManager};
use crate::telemetry::MetricsCollector;

pub mod connection;
pub mod dispatch;
pub mod registry;
mod session;

pub use dispatch::{DispatchError, Dispatcher};
pub use registry::{CloseReason, InstanceHandle, InstanceRegistry, InstanceStatus};

/// How long the context sweeper sleeps between passes.
const CONTEXT_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Policy hook at envelope ingress.
///
/// Deployments that sign envelopes plug their verifier in here; an
/// envelope that is not admitted closes its session as a protocol
/// violation. The default admits everything.
pub trait IngressPolicy: Send + Sync {
    fn admit(&self, env: &ubp_protocol::Envelope) -> bool;
}

/// Default ingress policy: verification disabled.
pub struct AcceptAll;

impl IngressPolicy for AcceptAll {
    fn admit(&self, _env: &ubp_protocol::Envelope) -> bool {
        true
    }
}

/// The orchestrator. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

struct Shared {
    config: Config,
    store: Arc<dyn StateStore>,
    credentials: CredentialStore,
    registry: InstanceRegistry,
    dispatcher: Dispatcher,
    tasks: TaskManager,
    context: ContextStore,
    metrics: Arc<MetricsCollector>,
    ingress: Arc<dyn IngressPolicy>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    /// Bound addresses, filled in by `run` (useful with port 0).
    data_addr: Mutex<Option<SocketAddr>>,
    admin_addr: Mutex<Option<SocketAddr>>,
}

impl Orchestrator {
    /// Assemble the core from configuration, with verification disabled.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        Self::with_ingress_policy(config, Arc::new(AcceptAll))
    }

    /// Assemble the core with a custom envelope ingress policy.
    pub fn with_ingress_policy(
        config: Config,
        ingress: Arc<dyn IngressPolicy>,
    ) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let store = ubp_persistence::open(config.state_store_url.as_deref())
            .map_err(|e| ServerError::Store(e.to_string()))?;

        let metrics = Arc::new(MetricsCollector::new());
        let registry = InstanceRegistry::new();
        let dispatcher = Dispatcher::new(
            registry.clone(),
            metrics.clone(),
            config.heartbeat_grace_factor,
        );
        let credentials = CredentialStore::new(store.clone());
        let tasks = TaskManager::new(
            store.clone(),
            dispatcher.clone(),
            registry.clone(),
            metrics.clone(),
            config.default_deadline(),
            RetryPolicy::default(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Shared {
                config,
                store,
                credentials,
                registry,
                dispatcher,
                tasks,
                context: ContextStore::new(),
                metrics,
                ingress,
                shutdown_tx,
                running: AtomicBool::new(false),
                data_addr: Mutex::new(None),
                admin_addr: Mutex::new(None),
            }),
        })
    }

    /// Actual data-plane address once `run` has bound it.
    pub fn data_addr(&self) -> Option<SocketAddr> {
        *self.inner.data_addr.lock()
    }

    /// Actual admin HTTP address once `run` has bound it.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        *self.inner.admin_addr.lock()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }

    pub fn context(&self) -> &ContextStore {
        &self.inner.context
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    pub fn ingress(&self) -> &Arc<dyn IngressPolicy> {
        &self.inner.ingress
    }

    /// Subscribe to the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Request shutdown: listeners stop, sessions get the drain window.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Delete a bot definition, invalidate its credentials, and force-close
    /// every live instance of it.
    pub fn delete_bot(&self, bot_id: &str) -> anyhow::Result<bool> {
        let removed = self.inner.credentials.delete_definition(bot_id)?;
        if removed {
            for handle in self.inner.registry.all() {
                if handle.bot_id == bot_id {
                    handle.begin_close(CloseReason::AdminClose);
                }
            }
        }
        Ok(removed)
    }

    /// Serve both surfaces until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let config = &self.inner.config;
        let data_listener = TcpListener::bind(config.listen_address)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", config.listen_address, e)))?;
        let admin_listener = TcpListener::bind(config.admin_listen_address)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", config.admin_listen_address, e)))?;

        *self.inner.data_addr.lock() = data_listener.local_addr().ok();
        *self.inner.admin_addr.lock() = admin_listener.local_addr().ok();

        info!(
            data_plane = %data_listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            admin = %admin_listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            encoding = %config.wire_encoding,
            "orchestrator listening"
        );

        // Admin HTTP server, stopped by the same shutdown signal.
        let router = crate::http::router(self.clone());
        let mut http_shutdown = self.shutdown_signal();
        let http_task = tokio::spawn(async move {
            let result = axum::serve(admin_listener, router)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "admin server error");
            }
        });

        match self.inner.tasks.recover() {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "re-queued interrupted tasks"),
            Err(e) => error!(error = %e, "task recovery failed"),
        }

        self.spawn_heartbeat_sweeper();
        self.spawn_context_sweeper();

        // Data-plane accept loop.
        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                result = data_listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(session::run_connection(self.clone(), stream, peer));
                    }
                    Err(e) => error!(error = %e, "accept error"),
                },
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        drop(data_listener);
        self.drain_sessions().await;
        let _ = http_task.await;

        self.inner.running.store(false, Ordering::SeqCst);
        info!("orchestrator stopped");
        Ok(())
    }

    /// Give sessions the drain window to finish in-flight commands, then
    /// force-close whatever is left.
    async fn drain_sessions(&self) {
        let registry = &self.inner.registry;
        let deadline = Instant::now() + self.inner.config.drain_timeout();

        while Instant::now() < deadline {
            let outstanding: usize = registry.all().iter().map(|h| h.pending_count()).sum();
            if outstanding == 0 {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }

        for handle in registry.all() {
            handle.begin_close(CloseReason::Shutdown);
        }

        // Let the connection tasks unwind.
        let unwind_deadline = Instant::now() + Duration::from_secs(2);
        while !registry.is_empty() && Instant::now() < unwind_deadline {
            sleep(Duration::from_millis(20)).await;
        }
    }

    fn spawn_heartbeat_sweeper(&self) {
        let orch = self.clone();
        let mut shutdown = self.shutdown_signal();
        let period = (self.inner.config.heartbeat_interval() / 2)
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(25));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(period) => {
                        let grace = orch.inner.config.heartbeat_grace_factor;
                        for handle in orch.inner.registry.all() {
                            if handle.is_active() && handle.heartbeat_expired(grace) {
                                orch.inner.metrics.heartbeat_missed();
                                warn!(
                                    bot_id = %handle.bot_id,
                                    instance_id = %handle.instance_id,
                                    age_ms = handle.last_heartbeat_age().as_millis() as u64,
                                    component = "session",
                                    "heartbeat deadline missed"
                                );
                                handle.begin_close(CloseReason::HeartbeatMiss);
                            }
                        }
                    }
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
        });
    }

    fn spawn_context_sweeper(&self) {
        let context = self.inner.context.clone();
        let mut shutdown = self.shutdown_signal();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(CONTEXT_SWEEP_PERIOD) => {
                        context.sweep();
                    }
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
        });
    }
}

/// Server error types.
#[derive(Debug)]
pub enum ServerError {
    Config(String),
    Store(String),
    Bind(String),
    AlreadyRunning,
    Io(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "configuration error: {}", s),
            Self::Store(s) => write!(f, "state store error: {}", s),
            Self::Bind(s) => write!(f, "bind error: {}", s),
            Self::AlreadyRunning => write!(f, "server already running"),
            Self::Io(s) => write!(f, "I/O error: {}", s),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
