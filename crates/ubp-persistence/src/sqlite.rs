// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! SQLite store backend.
//!
//! Durable storage with zero external services. Thread-safe via internal
//! Mutex (SQLite `Connection` is not Sync); the token swap runs inside a
//! transaction.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE bots (
//!     bot_id TEXT PRIMARY KEY,
//!     name TEXT NOT NULL,
//!     description TEXT,
//!     adapter_type TEXT NOT NULL,
//!     capabilities TEXT NOT NULL,       -- JSON array
//!     configuration TEXT NOT NULL,      -- JSON object
//!     created_at_ms INTEGER NOT NULL
//! );
//! CREATE TABLE credentials (
//!     bot_id TEXT PRIMARY KEY,
//!     one_time_token TEXT,
//!     api_key TEXT,
//!     created_at_ms INTEGER NOT NULL
//! );
//! CREATE TABLE tasks (
//!     task_id TEXT PRIMARY KEY,
//!     bot_id TEXT NOT NULL,
//!     command_name TEXT NOT NULL,
//!     arguments BLOB NOT NULL,
//!     state TEXT NOT NULL,
//!     progress INTEGER NOT NULL,
//!     result BLOB,
//!     error TEXT,
//!     submitted_at_ms INTEGER NOT NULL,
//!     started_at_ms INTEGER,
//!     completed_at_ms INTEGER,
//!     retries_remaining INTEGER NOT NULL
//! );
//! ```

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{
    constant_time_eq, BotDefinitionRecord, CredentialRecord, StateStore, TaskRecord, TaskState,
    TokenSwap,
};

/// Durable store on a single SQLite database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a file-backed database.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {}", path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to create in-memory SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bots (
                bot_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                adapter_type TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                configuration TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS credentials (
                bot_id TEXT PRIMARY KEY,
                one_time_token TEXT,
                api_key TEXT,
                created_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                command_name TEXT NOT NULL,
                arguments BLOB NOT NULL,
                state TEXT NOT NULL,
                progress INTEGER NOT NULL,
                result BLOB,
                error TEXT,
                submitted_at_ms INTEGER NOT NULL,
                started_at_ms INTEGER,
                completed_at_ms INTEGER,
                retries_remaining INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
            CREATE INDEX IF NOT EXISTS idx_tasks_submitted ON tasks(submitted_at_ms);",
        )
        .context("failed to initialize schema")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning cannot leave the schema inconsistent; recover the guard.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn row_to_definition(row: &rusqlite::Row) -> rusqlite::Result<(BotDefinitionRecord, String, String)> {
        Ok((
            BotDefinitionRecord {
                bot_id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                adapter_type: row.get(3)?,
                declared_capabilities: Vec::new(),
                configuration: serde_json::Value::Null,
                created_at_ms: row.get::<_, i64>(6)? as u64,
            },
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn finish_definition(parts: (BotDefinitionRecord, String, String)) -> Result<BotDefinitionRecord> {
        let (mut def, caps, config) = parts;
        def.declared_capabilities =
            serde_json::from_str(&caps).context("corrupt capabilities column")?;
        def.configuration = serde_json::from_str(&config).context("corrupt configuration column")?;
        Ok(def)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<(TaskRecord, String)> {
        Ok((
            TaskRecord {
                task_id: row.get(0)?,
                bot_id: row.get(1)?,
                command_name: row.get(2)?,
                arguments: row.get(3)?,
                state: TaskState::Pending,
                progress: row.get::<_, i64>(5)? as u8,
                result: row.get(6)?,
                error: row.get(7)?,
                submitted_at_ms: row.get::<_, i64>(8)? as u64,
                started_at_ms: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
                completed_at_ms: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
                retries_remaining: row.get::<_, i64>(11)? as u32,
            },
            row.get(4)?,
        ))
    }

    fn finish_task(parts: (TaskRecord, String)) -> Result<TaskRecord> {
        let (mut task, state) = parts;
        task.state =
            TaskState::parse(&state).ok_or_else(|| anyhow!("corrupt task state: {}", state))?;
        Ok(task)
    }
}

impl StateStore for SqliteStore {
    fn put_definition(&self, def: &BotDefinitionRecord) -> Result<()> {
        let caps = serde_json::to_string(&def.declared_capabilities)?;
        let config = serde_json::to_string(&def.configuration)?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO bots
                 (bot_id, name, description, adapter_type, capabilities, configuration, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    def.bot_id,
                    def.name,
                    def.description,
                    def.adapter_type,
                    caps,
                    config,
                    def.created_at_ms as i64,
                ],
            )
            .context("failed to save bot definition")?;
        Ok(())
    }

    fn get_definition(&self, bot_id: &str) -> Result<Option<BotDefinitionRecord>> {
        let parts = self
            .lock()
            .query_row(
                "SELECT bot_id, name, description, adapter_type, capabilities, configuration, created_at_ms
                 FROM bots WHERE bot_id = ?1",
                params![bot_id],
                Self::row_to_definition,
            )
            .optional()
            .context("failed to load bot definition")?;
        parts.map(Self::finish_definition).transpose()
    }

    fn list_definitions(&self) -> Result<Vec<BotDefinitionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT bot_id, name, description, adapter_type, capabilities, configuration, created_at_ms
             FROM bots ORDER BY created_at_ms, bot_id",
        )?;
        let rows = stmt.query_map([], Self::row_to_definition)?;
        rows.map(|r| Self::finish_definition(r?)).collect()
    }

    fn delete_definition(&self, bot_id: &str) -> Result<bool> {
        let conn = self.lock();
        conn.execute("DELETE FROM credentials WHERE bot_id = ?1", params![bot_id])?;
        let removed = conn.execute("DELETE FROM bots WHERE bot_id = ?1", params![bot_id])?;
        Ok(removed > 0)
    }

    fn put_credentials(&self, cred: &CredentialRecord) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO credentials (bot_id, one_time_token, api_key, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    cred.bot_id,
                    cred.one_time_token,
                    cred.api_key,
                    cred.created_at_ms as i64,
                ],
            )
            .context("failed to save credentials")?;
        Ok(())
    }

    fn consume_one_time(&self, bot_id: &str, candidate: &str, new_key: &str) -> Result<TokenSwap> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let stored: Option<Option<String>> = tx
            .query_row(
                "SELECT one_time_token FROM credentials WHERE bot_id = ?1",
                params![bot_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(Some(token)) = stored else {
            return Ok(TokenSwap::Rejected);
        };
        if !constant_time_eq(&token, candidate) {
            return Ok(TokenSwap::Rejected);
        }

        tx.execute(
            "UPDATE credentials SET one_time_token = NULL, api_key = ?2 WHERE bot_id = ?1",
            params![bot_id, new_key],
        )?;
        tx.commit().context("failed to commit token swap")?;
        Ok(TokenSwap::Issued)
    }

    fn verify_api_key(&self, bot_id: &str, candidate: &str) -> Result<bool> {
        let stored: Option<Option<String>> = self
            .lock()
            .query_row(
                "SELECT api_key FROM credentials WHERE bot_id = ?1",
                params![bot_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(stored, Some(Some(key)) if constant_time_eq(&key, candidate)))
    }

    fn put_task(&self, task: &TaskRecord) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO tasks
                 (task_id, bot_id, command_name, arguments, state, progress, result, error,
                  submitted_at_ms, started_at_ms, completed_at_ms, retries_remaining)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    task.task_id,
                    task.bot_id,
                    task.command_name,
                    task.arguments,
                    task.state.as_str(),
                    task.progress as i64,
                    task.result,
                    task.error,
                    task.submitted_at_ms as i64,
                    task.started_at_ms.map(|v| v as i64),
                    task.completed_at_ms.map(|v| v as i64),
                    task.retries_remaining as i64,
                ],
            )
            .context("failed to save task")?;
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let parts = self
            .lock()
            .query_row(
                "SELECT task_id, bot_id, command_name, arguments, state, progress, result, error,
                        submitted_at_ms, started_at_ms, completed_at_ms, retries_remaining
                 FROM tasks WHERE task_id = ?1",
                params![task_id],
                Self::row_to_task,
            )
            .optional()
            .context("failed to load task")?;
        parts.map(Self::finish_task).transpose()
    }

    fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>> {
        let conn = self.lock();
        match state {
            Some(state) => {
                let mut stmt = conn.prepare(
                    "SELECT task_id, bot_id, command_name, arguments, state, progress, result, error,
                            submitted_at_ms, started_at_ms, completed_at_ms, retries_remaining
                     FROM tasks WHERE state = ?1 ORDER BY submitted_at_ms, task_id",
                )?;
                let rows = stmt.query_map(params![state.as_str()], Self::row_to_task)?;
                rows.map(|r| Self::finish_task(r?)).collect()
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT task_id, bot_id, command_name, arguments, state, progress, result, error,
                            submitted_at_ms, started_at_ms, completed_at_ms, retries_remaining
                     FROM tasks ORDER BY submitted_at_ms, task_id",
                )?;
                let rows = stmt.query_map([], Self::row_to_task)?;
                rows.map(|r| Self::finish_task(r?)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::new_in_memory().unwrap()
    }

    #[test]
    fn test_definition_roundtrip() {
        let s = store();
        let def = BotDefinitionRecord {
            bot_id: "bot-1".into(),
            name: "demo".into(),
            description: Some("a demo bot".into()),
            adapter_type: "telegram".into(),
            declared_capabilities: vec!["message.send".into()],
            configuration: serde_json::json!({"channel": "#ops"}),
            created_at_ms: 42,
        };
        s.put_definition(&def).unwrap();

        let loaded = s.get_definition("bot-1").unwrap().unwrap();
        assert_eq!(loaded, def);
        assert_eq!(s.list_definitions().unwrap().len(), 1);
    }

    #[test]
    fn test_definition_update_overwrites() {
        let s = store();
        let mut def = BotDefinitionRecord {
            bot_id: "bot-1".into(),
            name: "v1".into(),
            description: None,
            adapter_type: "console".into(),
            declared_capabilities: vec![],
            configuration: serde_json::json!({}),
            created_at_ms: 1,
        };
        s.put_definition(&def).unwrap();
        def.name = "v2".into();
        s.put_definition(&def).unwrap();

        assert_eq!(s.get_definition("bot-1").unwrap().unwrap().name, "v2");
        assert_eq!(s.list_definitions().unwrap().len(), 1);
    }

    #[test]
    fn test_token_swap_transactional() {
        let s = store();
        s.put_credentials(&CredentialRecord {
            bot_id: "bot-1".into(),
            one_time_token: Some("tok".into()),
            api_key: None,
            created_at_ms: 1,
        })
        .unwrap();

        assert_eq!(
            s.consume_one_time("bot-1", "bad", "key").unwrap(),
            TokenSwap::Rejected
        );
        assert_eq!(
            s.consume_one_time("bot-1", "tok", "key").unwrap(),
            TokenSwap::Issued
        );
        assert_eq!(
            s.consume_one_time("bot-1", "tok", "other").unwrap(),
            TokenSwap::Rejected
        );
        assert!(s.verify_api_key("bot-1", "key").unwrap());
    }

    #[test]
    fn test_delete_cascades_credentials() {
        let s = store();
        s.put_definition(&BotDefinitionRecord {
            bot_id: "bot-1".into(),
            name: "demo".into(),
            description: None,
            adapter_type: "console".into(),
            declared_capabilities: vec![],
            configuration: serde_json::json!({}),
            created_at_ms: 1,
        })
        .unwrap();
        s.put_credentials(&CredentialRecord {
            bot_id: "bot-1".into(),
            one_time_token: None,
            api_key: Some("key".into()),
            created_at_ms: 1,
        })
        .unwrap();

        assert!(s.delete_definition("bot-1").unwrap());
        assert!(!s.verify_api_key("bot-1", "key").unwrap());
    }

    #[test]
    fn test_task_roundtrip_and_filter() {
        let s = store();
        let task = TaskRecord {
            task_id: "task-1".into(),
            bot_id: "bot-1".into(),
            command_name: "t.exec".into(),
            arguments: br#"{"x":1}"#.to_vec(),
            state: TaskState::Pending,
            progress: 0,
            result: None,
            error: None,
            submitted_at_ms: 10,
            started_at_ms: None,
            completed_at_ms: None,
            retries_remaining: 3,
        };
        s.put_task(&task).unwrap();

        assert_eq!(s.get_task("task-1").unwrap().unwrap(), task);
        assert_eq!(s.list_tasks(Some(TaskState::Pending)).unwrap().len(), 1);
        assert!(s.list_tasks(Some(TaskState::Completed)).unwrap().is_empty());

        let mut done = task.clone();
        done.state = TaskState::Completed;
        done.result = Some(br#"{"y":2}"#.to_vec());
        done.completed_at_ms = Some(20);
        s.put_task(&done).unwrap();

        let loaded = s.get_task("task-1").unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Completed);
        assert_eq!(loaded.result, Some(br#"{"y":2}"#.to_vec()));
    }

    #[test]
    fn test_get_missing() {
        let s = store();
        assert!(s.get_definition("nope").unwrap().is_none());
        assert!(s.get_task("nope").unwrap().is_none());
    }
}
