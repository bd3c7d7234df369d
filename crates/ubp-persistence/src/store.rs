// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Store abstraction and record types.
//!
//! Defines the trait for storage backends and the persisted record shapes.
//! The one-time-token swap is part of the contract: backends perform it as
//! an atomic compare-and-swap, so exactly one concurrent caller can win.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A registered bot definition (the administrator-declared template).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotDefinitionRecord {
    pub bot_id: String,
    pub name: String,
    pub description: Option<String>,
    pub adapter_type: String,
    /// Advisory capability list from registration time. The capabilities an
    /// instance declares at handshake are authoritative.
    pub declared_capabilities: Vec<String>,
    /// Opaque configuration blob handed to connecting instances.
    pub configuration: serde_json::Value,
    pub created_at_ms: u64,
}

/// Credentials attached to a definition.
///
/// Exactly one of `one_time_token` / `api_key` is set for a live
/// definition: the token exists until first handshake, the key afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub bot_id: String,
    pub one_time_token: Option<String>,
    pub api_key: Option<String>,
    pub created_at_ms: u64,
}

/// Outcome of the one-time-token compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSwap {
    /// The token matched; the new key is persisted and the token is gone.
    Issued,
    /// Unknown bot, no unconsumed token, or token mismatch.
    Rejected,
}

/// Task lifecycle states. Terminal states are permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A persisted asynchronous job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub bot_id: String,
    pub command_name: String,
    pub arguments: Vec<u8>,
    pub state: TaskState,
    pub progress: u8,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub submitted_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub retries_remaining: u32,
}

/// Backend-agnostic interface over definitions, credentials, and tasks.
///
/// # Implementations
///
/// - `MemoryStore` -- default, state lost on restart
/// - `SqliteStore` -- durable
pub trait StateStore: Send + Sync {
    /// Insert or replace a definition.
    fn put_definition(&self, def: &BotDefinitionRecord) -> Result<()>;

    fn get_definition(&self, bot_id: &str) -> Result<Option<BotDefinitionRecord>>;

    fn list_definitions(&self) -> Result<Vec<BotDefinitionRecord>>;

    /// Remove a definition and its credentials. Returns false if unknown.
    fn delete_definition(&self, bot_id: &str) -> Result<bool>;

    /// Insert or replace the credentials for a definition.
    fn put_credentials(&self, cred: &CredentialRecord) -> Result<()>;

    /// Atomically: if `candidate` equals the stored unconsumed one-time
    /// token for `bot_id`, persist `new_key` as the long-lived key and
    /// discard the token. Comparison is constant-time. Non-replayable: at
    /// most one caller observes [`TokenSwap::Issued`] per token.
    fn consume_one_time(&self, bot_id: &str, candidate: &str, new_key: &str) -> Result<TokenSwap>;

    /// Constant-time check of `candidate` against the stored long-lived key.
    fn verify_api_key(&self, bot_id: &str, candidate: &str) -> Result<bool>;

    /// Insert or replace a task record.
    fn put_task(&self, task: &TaskRecord) -> Result<()>;

    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Tasks ordered by submission time, optionally filtered by state.
    fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>>;
}

/// Constant-time string comparison for credential material.
///
/// Length is not hidden; token and key lengths are fixed and public.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    ring::constant_time::verify_slices_are_equal(a.as_bytes(), b.as_bytes()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_parse_roundtrip() {
        for s in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            assert_eq!(TaskState::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskState::parse("DONE"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc123", "abc1234"));
    }

    #[test]
    fn test_record_serialization() {
        let record = TaskRecord {
            task_id: "task-1".into(),
            bot_id: "bot-1".into(),
            command_name: "t.exec".into(),
            arguments: vec![1, 2, 3],
            state: TaskState::Pending,
            progress: 0,
            result: None,
            error: None,
            submitted_at_ms: 1_700_000_000_000,
            started_at_ms: None,
            completed_at_ms: None,
            retries_remaining: 3,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
        assert!(json.contains("\"PENDING\""));
    }
}
