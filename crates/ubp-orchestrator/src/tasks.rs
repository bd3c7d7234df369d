// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Asynchronous task manager.
//!
//! The request-reply pattern layered on the dispatcher: `submit` persists a
//! `PENDING` task and returns immediately; one worker per bot drains that
//! bot's queue in submission order, so tasks for a single bot execute
//! sequentially. `NoCapableInstance` and `InstanceGone` are retried with
//! exponential backoff; timeouts and execution errors are not. A task seen
//! in a terminal state stays there.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use tracing::{error, info, warn};
use ubp_persistence::{StateStore, TaskRecord, TaskState};
use ubp_protocol::{CommandRequest, CommandStatus, Envelope, Payload};
use uuid::Uuid;

use crate::server::dispatch::{DispatchError, Dispatcher};
use crate::server::registry::InstanceRegistry;
use crate::telemetry::{now_ms, MetricsCollector};

/// Retry behavior for transient dispatch failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
    NotFound,
}

#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    store: Arc<dyn StateStore>,
    dispatcher: Dispatcher,
    registry: InstanceRegistry,
    metrics: Arc<MetricsCollector>,
    dispatch_deadline: Duration,
    retry: RetryPolicy,
    /// Per-bot FIFO queues. A map entry exists iff a worker is running for
    /// that bot.
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    /// Serializes task read-modify-write so state transitions are atomic.
    transitions: Mutex<()>,
    /// task_id -> instance currently executing it, for best-effort cancels.
    running_on: Mutex<HashMap<String, String>>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        dispatcher: Dispatcher,
        registry: InstanceRegistry,
        metrics: Arc<MetricsCollector>,
        dispatch_deadline: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                store,
                dispatcher,
                registry,
                metrics,
                dispatch_deadline,
                retry,
                queues: Mutex::new(HashMap::new()),
                transitions: Mutex::new(()),
                running_on: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Persist a task and queue it for its bot. Returns the pending record.
    pub fn submit(
        &self,
        bot_id: String,
        command_name: String,
        arguments: Vec<u8>,
    ) -> Result<TaskRecord> {
        let task = TaskRecord {
            task_id: format!("task-{}", Uuid::new_v4().simple()),
            bot_id: bot_id.clone(),
            command_name,
            arguments,
            state: TaskState::Pending,
            progress: 0,
            result: None,
            error: None,
            submitted_at_ms: now_ms(),
            started_at_ms: None,
            completed_at_ms: None,
            retries_remaining: self.inner.retry.max_retries,
        };
        self.inner.store.put_task(&task)?;
        self.enqueue(&bot_id, task.task_id.clone());

        info!(
            task_id = %task.task_id,
            bot_id = %task.bot_id,
            command_name = %task.command_name,
            component = "tasks",
            "task submitted"
        );
        Ok(task)
    }

    /// Push a task onto its bot's queue, spinning a worker up if needed.
    fn enqueue(&self, bot_id: &str, task_id: String) {
        let mut queues = self.inner.queues.lock();
        match queues.get_mut(bot_id) {
            Some(queue) => queue.push_back(task_id),
            None => {
                queues.insert(bot_id.to_string(), VecDeque::from([task_id]));
                tokio::spawn(run_worker(self.inner.clone(), bot_id.to_string()));
            }
        }
        drop(queues);
        self.inner.metrics.task_enqueued();
    }

    /// Re-queue tasks interrupted by a restart: Pending tasks resume in
    /// submission order; Running tasks are dispatched again, since no
    /// instance survives a restart. Returns the number recovered.
    pub fn recover(&self) -> Result<usize> {
        let mut interrupted: Vec<TaskRecord> = self
            .inner
            .store
            .list_tasks(Some(TaskState::Pending))?
            .into_iter()
            .chain(self.inner.store.list_tasks(Some(TaskState::Running))?)
            .collect();
        interrupted.sort_by(|a, b| {
            a.submitted_at_ms
                .cmp(&b.submitted_at_ms)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });

        let recovered = interrupted.len();
        for task in interrupted {
            info!(
                task_id = %task.task_id,
                bot_id = %task.bot_id,
                state = task.state.as_str(),
                component = "tasks",
                "recovering interrupted task"
            );
            self.enqueue(&task.bot_id, task.task_id);
        }
        Ok(recovered)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.inner.store.get_task(task_id)
    }

    pub fn list(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>> {
        self.inner.store.list_tasks(state)
    }

    /// Cancel a pending or running task. A running task is cancelled
    /// locally regardless; a best-effort `command.cancel` goes to the
    /// executing instance.
    pub fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        match self.inner.transition(task_id, |task| {
            task.state = TaskState::Cancelled;
            task.completed_at_ms = Some(now_ms());
        })? {
            Transition::Applied(_) => {}
            Transition::Terminal(_) => return Ok(CancelOutcome::AlreadyTerminal),
            Transition::Missing => return Ok(CancelOutcome::NotFound),
        }

        let executing = self.inner.running_on.lock().get(task_id).cloned();
        if let Some(instance_id) = executing {
            if let Some(handle) = self.inner.registry.get(&instance_id) {
                let env = Envelope::new(Payload::CommandRequest(CommandRequest {
                    command_id: Uuid::new_v4(),
                    command_name: "command.cancel".into(),
                    arguments: serde_json::to_vec(&serde_json::json!({ "task_id": task_id }))
                        .unwrap_or_default(),
                    deadline_ms: 0,
                }));
                tokio::spawn(async move {
                    let _ = handle.enqueue(env).await;
                });
            }
        }

        info!(task_id = %task_id, component = "tasks", "task cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Progress report from an instance, riding the event channel as a
    /// JSON body `{"task_id": ..., "progress": 0..=100}`.
    pub fn apply_progress_event(&self, payload: &[u8]) {
        #[derive(Deserialize)]
        struct Progress {
            task_id: String,
            progress: u8,
        }
        match serde_json::from_slice::<Progress>(payload) {
            Ok(report) => {
                let progress = report.progress.min(100);
                if let Err(e) = self.inner.transition(&report.task_id, |task| {
                    task.progress = progress;
                }) {
                    error!(task_id = %report.task_id, error = %e, "failed to record progress");
                }
            }
            Err(e) => warn!(error = %e, component = "tasks", "malformed progress event"),
        }
    }

    #[cfg(test)]
    fn queue_len(&self, bot_id: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(bot_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

/// Result of an attempted task transition.
enum Transition {
    /// The mutation was applied and persisted.
    Applied(TaskRecord),
    /// The task was already terminal; the record is untouched.
    Terminal(TaskRecord),
    Missing,
}

impl TaskInner {
    /// Atomic read-modify-write of a task record. `mutate` runs only on
    /// non-terminal tasks, so a terminal state can never be overwritten.
    fn transition<F>(&self, task_id: &str, mutate: F) -> Result<Transition>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let _guard = self.transitions.lock();
        let Some(mut task) = self.store.get_task(task_id)? else {
            return Ok(Transition::Missing);
        };
        if task.state.is_terminal() {
            return Ok(Transition::Terminal(task));
        }
        mutate(&mut task);
        self.store.put_task(&task)?;
        Ok(Transition::Applied(task))
    }

    fn fail(&self, task_id: &str, reason: &str) {
        let result = self.transition(task_id, |task| {
            task.state = TaskState::Failed;
            task.error = Some(reason.to_string());
            task.completed_at_ms = Some(now_ms());
        });
        if let Err(e) = result {
            error!(task_id = %task_id, error = %e, "failed to record task failure");
        }
        info!(task_id = %task_id, reason = %reason, component = "tasks", "task failed");
    }
}

/// One worker per bot: drains the bot's queue in FIFO order, then exits.
async fn run_worker(inner: Arc<TaskInner>, bot_id: String) {
    loop {
        let task_id = {
            let mut queues = inner.queues.lock();
            let Some(queue) = queues.get_mut(&bot_id) else {
                return;
            };
            match queue.pop_front() {
                Some(id) => id,
                None => {
                    queues.remove(&bot_id);
                    return;
                }
            }
        };
        inner.metrics.task_dequeued();
        run_task(&inner, &task_id).await;
    }
}

async fn run_task(inner: &Arc<TaskInner>, task_id: &str) {
    // Claim the task. A cancel that won the race leaves it terminal and we
    // skip it.
    let claimed = match inner.transition(task_id, |task| {
        task.state = TaskState::Running;
        task.started_at_ms = Some(now_ms());
    }) {
        Ok(Transition::Applied(task)) => task,
        Ok(Transition::Terminal(_) | Transition::Missing) => return,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "failed to claim task");
            return;
        }
    };

    let trace_id = Uuid::new_v4();
    let mut retries_remaining = claimed.retries_remaining;
    let mut attempt: u32 = 0;

    loop {
        let outcome = match inner
            .dispatcher
            .select_instance(&claimed.bot_id, &claimed.command_name)
        {
            None => Err(DispatchError::NoCapableInstance),
            Some(handle) => {
                inner
                    .running_on
                    .lock()
                    .insert(task_id.to_string(), handle.instance_id.clone());
                let result = inner
                    .dispatcher
                    .dispatch_to(
                        &handle,
                        &claimed.command_name,
                        claimed.arguments.clone(),
                        inner.dispatch_deadline,
                        trace_id,
                    )
                    .await;
                inner.running_on.lock().remove(task_id);
                result
            }
        };

        match outcome {
            Ok(resp) => {
                match resp.status {
                    CommandStatus::Success => {
                        let result = inner.transition(task_id, |task| {
                            task.state = TaskState::Completed;
                            task.progress = 100;
                            task.result = Some(resp.result.clone());
                            task.completed_at_ms = Some(now_ms());
                        });
                        if let Err(e) = result {
                            error!(task_id = %task_id, error = %e, "failed to record completion");
                        }
                        info!(
                            trace_id = %trace_id,
                            task_id = %task_id,
                            component = "tasks",
                            "task completed"
                        );
                    }
                    CommandStatus::ExecutionError => {
                        let reason = resp
                            .error_message
                            .unwrap_or_else(|| "execution error".into());
                        inner.fail(task_id, &reason);
                    }
                    CommandStatus::InvalidArguments => {
                        let reason = resp
                            .error_message
                            .unwrap_or_else(|| "invalid arguments".into());
                        inner.fail(task_id, &reason);
                    }
                }
                return;
            }
            Err(e @ (DispatchError::NoCapableInstance | DispatchError::InstanceGone)) => {
                if retries_remaining == 0 {
                    inner.fail(task_id, &e.to_string());
                    return;
                }
                retries_remaining -= 1;
                let persisted = inner.transition(task_id, |task| {
                    task.retries_remaining = retries_remaining;
                });
                match persisted {
                    Ok(Transition::Applied(_)) => {}
                    // Cancelled (or lost) while we were dispatching.
                    Ok(Transition::Terminal(_) | Transition::Missing) => return,
                    Err(err) => {
                        error!(task_id = %task_id, error = %err, "failed to record retry");
                        return;
                    }
                }

                let delay = backoff_delay(&inner.retry, attempt);
                attempt += 1;
                info!(
                    trace_id = %trace_id,
                    task_id = %task_id,
                    retries_remaining,
                    delay_ms = delay.as_millis() as u64,
                    cause = %e,
                    component = "tasks",
                    "retrying task"
                );
                tokio::time::sleep(delay).await;

                // Re-check after the backoff; a cancel may have landed.
                match inner.store.get_task(task_id) {
                    Ok(Some(task)) if task.state == TaskState::Running => {}
                    _ => return,
                }
            }
            Err(e @ DispatchError::Timeout) => {
                inner.fail(task_id, &e.to_string());
                return;
            }
        }
    }
}

/// Exponential backoff: base doubled per attempt, capped, with +/-25%
/// jitter.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base_ms = policy.backoff_base.as_millis() as u64;
    let cap_ms = policy.backoff_cap.as_millis() as u64;
    let exp_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(cap_ms);
    let jitter = exp_ms / 4;
    let offset = rand::thread_rng().gen_range(0..=jitter.saturating_mul(2));
    Duration::from_millis(exp_ms.saturating_sub(jitter).saturating_add(offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::mpsc;
    use ubp_persistence::MemoryStore;
    use ubp_protocol::CommandResponse;

    use crate::server::registry::InstanceHandle;

    struct Fixture {
        tasks: TaskManager,
        registry: InstanceRegistry,
        dispatcher: Dispatcher,
        store: Arc<dyn StateStore>,
    }

    fn fixture(retry: RetryPolicy, deadline: Duration) -> Fixture {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let registry = InstanceRegistry::new();
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = Dispatcher::new(registry.clone(), metrics.clone(), 3);
        let tasks = TaskManager::new(
            store.clone(),
            dispatcher.clone(),
            registry.clone(),
            metrics,
            deadline,
            retry,
        );
        Fixture {
            tasks,
            registry,
            dispatcher,
            store,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(20),
        }
    }

    fn add_instance(fx: &Fixture, instance_id: &str) -> (Arc<InstanceHandle>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = InstanceHandle::new(
            "b1".into(),
            instance_id.into(),
            HashSet::from(["t.exec".to_string()]),
            Duration::from_secs(30),
            0,
            tx,
        );
        fx.registry.insert(handle.clone());
        (handle, rx)
    }

    /// Echo agent: answers every command request with a success response.
    fn spawn_echo(fx: &Fixture, handle: Arc<InstanceHandle>, mut rx: mpsc::Receiver<Envelope>) {
        let dispatcher = fx.dispatcher.clone();
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                if let Payload::CommandRequest(req) = env.payload {
                    dispatcher.deliver_response(
                        &handle,
                        CommandResponse {
                            command_id: req.command_id,
                            status: CommandStatus::Success,
                            result: req.arguments,
                            error_message: None,
                        },
                        env.trace_id,
                    );
                }
            }
        });
    }

    async fn wait_for_state(tasks: &TaskManager, task_id: &str, state: TaskState) -> TaskRecord {
        for _ in 0..200 {
            let task = tasks.get(task_id).unwrap().unwrap();
            if task.state == state {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached {:?}", state);
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let fx = fixture(fast_retry(), Duration::from_secs(2));
        let (handle, rx) = add_instance(&fx, "i1");
        spawn_echo(&fx, handle, rx);

        let task = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), br#"{"x":1}"#.to_vec())
            .unwrap();
        assert_eq!(task.state, TaskState::Pending);

        let done = wait_for_state(&fx.tasks, &task.task_id, TaskState::Completed).await;
        assert_eq!(done.result, Some(br#"{"x":1}"#.to_vec()));
        assert_eq!(done.progress, 100);
        assert!(done.started_at_ms.is_some());
        assert!(done.submitted_at_ms <= done.started_at_ms.unwrap());
        assert!(done.started_at_ms.unwrap() <= done.completed_at_ms.unwrap());
    }

    #[tokio::test]
    async fn test_no_instance_fails_after_retries() {
        let fx = fixture(fast_retry(), Duration::from_millis(100));

        let task = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), vec![])
            .unwrap();
        let failed = wait_for_state(&fx.tasks, &task.task_id, TaskState::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("no capable instance"));
        assert_eq!(failed.retries_remaining, 0);
    }

    #[tokio::test]
    async fn test_retry_succeeds_when_instance_appears() {
        let fx = fixture(
            RetryPolicy {
                max_retries: 5,
                backoff_base: Duration::from_millis(20),
                backoff_cap: Duration::from_millis(40),
            },
            Duration::from_secs(2),
        );

        let task = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), b"{}".to_vec())
            .unwrap();

        // Let the first attempt fail, then bring an instance up.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (handle, rx) = add_instance(&fx, "i1");
        spawn_echo(&fx, handle, rx);

        let done = wait_for_state(&fx.tasks, &task.task_id, TaskState::Completed).await;
        assert!(done.retries_remaining < 5);
    }

    #[tokio::test]
    async fn test_execution_error_not_retried() {
        let fx = fixture(fast_retry(), Duration::from_secs(2));
        let (handle, mut rx) = add_instance(&fx, "i1");
        let dispatcher = fx.dispatcher.clone();
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                if let Payload::CommandRequest(req) = env.payload {
                    dispatcher.deliver_response(
                        &handle,
                        CommandResponse {
                            command_id: req.command_id,
                            status: CommandStatus::ExecutionError,
                            result: vec![],
                            error_message: Some("tool crashed".into()),
                        },
                        env.trace_id,
                    );
                }
            }
        });

        let task = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), vec![])
            .unwrap();
        let failed = wait_for_state(&fx.tasks, &task.task_id, TaskState::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("tool crashed"));
        // No retries were burned on a deterministic failure.
        assert_eq!(failed.retries_remaining, fast_retry().max_retries);
    }

    #[tokio::test]
    async fn test_fifo_per_bot() {
        let fx = fixture(fast_retry(), Duration::from_secs(2));
        let (handle, rx) = add_instance(&fx, "i1");
        spawn_echo(&fx, handle, rx);

        let first = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), b"1".to_vec())
            .unwrap();
        let second = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), b"2".to_vec())
            .unwrap();

        let first_done = wait_for_state(&fx.tasks, &first.task_id, TaskState::Completed).await;
        let second_done = wait_for_state(&fx.tasks, &second.task_id, TaskState::Completed).await;
        assert!(first_done.started_at_ms.unwrap() <= second_done.started_at_ms.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let fx = fixture(
            RetryPolicy {
                max_retries: 50,
                backoff_base: Duration::from_millis(50),
                backoff_cap: Duration::from_millis(100),
            },
            Duration::from_millis(50),
        );

        // No instance: the task spins in retries until cancelled.
        let task = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), vec![])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fx.tasks.cancel(&task.task_id).unwrap(), CancelOutcome::Cancelled);
        let cancelled = wait_for_state(&fx.tasks, &task.task_id, TaskState::Cancelled).await;
        assert!(cancelled.completed_at_ms.is_some());

        // Terminal forever.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            fx.tasks.get(&task.task_id).unwrap().unwrap().state,
            TaskState::Cancelled
        );
        assert_eq!(fx.tasks.cancel(&task.task_id).unwrap(), CancelOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_cancel_unknown() {
        let fx = fixture(fast_retry(), Duration::from_secs(1));
        assert_eq!(fx.tasks.cancel("task-missing").unwrap(), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_running_sends_best_effort_cancel() {
        let fx = fixture(fast_retry(), Duration::from_secs(5));
        // Instance that never answers, keeping the task Running.
        let (_handle, mut rx) = add_instance(&fx, "i1");

        let task = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), vec![])
            .unwrap();
        let _ = wait_for_state(&fx.tasks, &task.task_id, TaskState::Running).await;
        // The command request reaches the instance first.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first.payload, Payload::CommandRequest(_)));

        assert_eq!(fx.tasks.cancel(&task.task_id).unwrap(), CancelOutcome::Cancelled);

        let cancel_frame = rx.recv().await.unwrap();
        let Payload::CommandRequest(req) = cancel_frame.payload else {
            panic!("expected command.cancel request");
        };
        assert_eq!(req.command_name, "command.cancel");
        let body: serde_json::Value = serde_json::from_slice(&req.arguments).unwrap();
        assert_eq!(body["task_id"], serde_json::json!(task.task_id));

        assert_eq!(
            fx.tasks.get(&task.task_id).unwrap().unwrap().state,
            TaskState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_progress_event() {
        let fx = fixture(fast_retry(), Duration::from_secs(5));
        let (_handle, _rx) = add_instance(&fx, "i1");

        let task = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), vec![])
            .unwrap();
        let _ = wait_for_state(&fx.tasks, &task.task_id, TaskState::Running).await;

        let payload = serde_json::to_vec(
            &serde_json::json!({"task_id": task.task_id, "progress": 40}),
        )
        .unwrap();
        fx.tasks.apply_progress_event(&payload);

        assert_eq!(fx.tasks.get(&task.task_id).unwrap().unwrap().progress, 40);

        // Garbage payloads are ignored.
        fx.tasks.apply_progress_event(b"not json");
    }

    #[tokio::test]
    async fn test_worker_exits_when_queue_drains() {
        let fx = fixture(fast_retry(), Duration::from_secs(2));
        let (handle, rx) = add_instance(&fx, "i1");
        spawn_echo(&fx, handle, rx);

        let task = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), vec![])
            .unwrap();
        wait_for_state(&fx.tasks, &task.task_id, TaskState::Completed).await;

        // Queue entry is gone once the worker drains it.
        for _ in 0..100 {
            if fx.tasks.queue_len("b1") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.tasks.queue_len("b1"), 0);

        // A later submit spins a fresh worker.
        let again = fx
            .tasks
            .submit("b1".into(), "t.exec".into(), vec![])
            .unwrap();
        wait_for_state(&fx.tasks, &again.task_id, TaskState::Completed).await;
    }

    #[tokio::test]
    async fn test_recover_requeues_interrupted_tasks() {
        let fx = fixture(fast_retry(), Duration::from_secs(2));

        // Simulate records left behind by a previous process.
        for (i, state) in [TaskState::Pending, TaskState::Running, TaskState::Completed]
            .iter()
            .enumerate()
        {
            fx.store
                .put_task(&TaskRecord {
                    task_id: format!("task-old-{}", i),
                    bot_id: "b1".into(),
                    command_name: "t.exec".into(),
                    arguments: vec![],
                    state: *state,
                    progress: 0,
                    result: None,
                    error: None,
                    submitted_at_ms: i as u64,
                    started_at_ms: None,
                    completed_at_ms: None,
                    retries_remaining: 1,
                })
                .unwrap();
        }

        let (handle, rx) = add_instance(&fx, "i1");
        spawn_echo(&fx, handle, rx);

        // Pending and Running come back; terminal tasks stay untouched.
        assert_eq!(fx.tasks.recover().unwrap(), 2);
        wait_for_state(&fx.tasks, "task-old-0", TaskState::Completed).await;
        wait_for_state(&fx.tasks, "task-old-1", TaskState::Completed).await;
        assert_eq!(
            fx.tasks.get("task-old-2").unwrap().unwrap().state,
            TaskState::Completed
        );
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(30_000),
        };
        for attempt in 0..10 {
            let d = backoff_delay(&policy, attempt);
            let exp = (1000u64 * 2u64.saturating_pow(attempt)).min(30_000);
            assert!(d.as_millis() as u64 >= exp - exp / 4);
            assert!(d.as_millis() as u64 <= exp + exp / 4);
        }
    }

    #[test]
    fn test_submit_persists_record() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let registry = InstanceRegistry::new();
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = Dispatcher::new(registry.clone(), metrics.clone(), 3);
        let tasks = TaskManager::new(
            store.clone(),
            dispatcher,
            registry,
            metrics,
            Duration::from_secs(1),
            RetryPolicy::default(),
        );

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let task = rt.block_on(async { tasks.submit("b1".into(), "t.exec".into(), vec![]).unwrap() });
        assert!(store.get_task(&task.task_id).unwrap().is_some());
    }
}
