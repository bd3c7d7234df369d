// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! In-memory store backend.
//!
//! Default backend when no `STATE_STORE_URL` is configured, and the one
//! unit tests run against. All operations take the single inner write
//! lock, which is what makes the token swap atomic here.

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::RwLock;

use crate::store::{
    constant_time_eq, BotDefinitionRecord, CredentialRecord, StateStore, TaskRecord, TaskState,
    TokenSwap,
};

#[derive(Default)]
struct Inner {
    definitions: HashMap<String, BotDefinitionRecord>,
    credentials: HashMap<String, CredentialRecord>,
    tasks: HashMap<String, TaskRecord>,
}

/// Volatile store; contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn put_definition(&self, def: &BotDefinitionRecord) -> Result<()> {
        self.inner
            .write()
            .definitions
            .insert(def.bot_id.clone(), def.clone());
        Ok(())
    }

    fn get_definition(&self, bot_id: &str) -> Result<Option<BotDefinitionRecord>> {
        Ok(self.inner.read().definitions.get(bot_id).cloned())
    }

    fn list_definitions(&self) -> Result<Vec<BotDefinitionRecord>> {
        let mut defs: Vec<_> = self.inner.read().definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.bot_id.cmp(&b.bot_id)));
        Ok(defs)
    }

    fn delete_definition(&self, bot_id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        inner.credentials.remove(bot_id);
        Ok(inner.definitions.remove(bot_id).is_some())
    }

    fn put_credentials(&self, cred: &CredentialRecord) -> Result<()> {
        self.inner
            .write()
            .credentials
            .insert(cred.bot_id.clone(), cred.clone());
        Ok(())
    }

    fn consume_one_time(&self, bot_id: &str, candidate: &str, new_key: &str) -> Result<TokenSwap> {
        let mut inner = self.inner.write();
        let Some(cred) = inner.credentials.get_mut(bot_id) else {
            return Ok(TokenSwap::Rejected);
        };
        let Some(token) = cred.one_time_token.as_deref() else {
            return Ok(TokenSwap::Rejected);
        };
        if !constant_time_eq(token, candidate) {
            return Ok(TokenSwap::Rejected);
        }
        cred.one_time_token = None;
        cred.api_key = Some(new_key.to_string());
        Ok(TokenSwap::Issued)
    }

    fn verify_api_key(&self, bot_id: &str, candidate: &str) -> Result<bool> {
        let inner = self.inner.read();
        let key = inner
            .credentials
            .get(bot_id)
            .and_then(|c| c.api_key.as_deref());
        Ok(key.is_some_and(|k| constant_time_eq(k, candidate)))
    }

    fn put_task(&self, task: &TaskRecord) -> Result<()> {
        self.inner
            .write()
            .tasks
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.inner.read().tasks.get(task_id).cloned())
    }

    fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<_> = self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| state.is_none_or(|s| t.state == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.submitted_at_ms
                .cmp(&b.submitted_at_ms)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_definition(bot_id: &str) -> BotDefinitionRecord {
        BotDefinitionRecord {
            bot_id: bot_id.into(),
            name: "demo".into(),
            description: None,
            adapter_type: "console".into(),
            declared_capabilities: vec!["t.exec".into()],
            configuration: serde_json::json!({}),
            created_at_ms: 1,
        }
    }

    #[test]
    fn test_definition_crud() {
        let store = MemoryStore::new();
        store.put_definition(&sample_definition("bot-1")).unwrap();

        assert!(store.get_definition("bot-1").unwrap().is_some());
        assert_eq!(store.list_definitions().unwrap().len(), 1);

        assert!(store.delete_definition("bot-1").unwrap());
        assert!(!store.delete_definition("bot-1").unwrap());
        assert!(store.get_definition("bot-1").unwrap().is_none());
    }

    #[test]
    fn test_delete_definition_removes_credentials() {
        let store = MemoryStore::new();
        store.put_definition(&sample_definition("bot-1")).unwrap();
        store
            .put_credentials(&CredentialRecord {
                bot_id: "bot-1".into(),
                one_time_token: Some("tok".into()),
                api_key: None,
                created_at_ms: 1,
            })
            .unwrap();

        store.delete_definition("bot-1").unwrap();

        assert_eq!(
            store.consume_one_time("bot-1", "tok", "key").unwrap(),
            TokenSwap::Rejected
        );
    }

    #[test]
    fn test_token_swap_success_and_replay() {
        let store = MemoryStore::new();
        store
            .put_credentials(&CredentialRecord {
                bot_id: "bot-1".into(),
                one_time_token: Some("tok".into()),
                api_key: None,
                created_at_ms: 1,
            })
            .unwrap();

        assert_eq!(
            store.consume_one_time("bot-1", "tok", "key-1").unwrap(),
            TokenSwap::Issued
        );
        // Replay with the same token must fail.
        assert_eq!(
            store.consume_one_time("bot-1", "tok", "key-2").unwrap(),
            TokenSwap::Rejected
        );
        // The first key is the one that stuck.
        assert!(store.verify_api_key("bot-1", "key-1").unwrap());
        assert!(!store.verify_api_key("bot-1", "key-2").unwrap());
    }

    #[test]
    fn test_token_swap_mismatch() {
        let store = MemoryStore::new();
        store
            .put_credentials(&CredentialRecord {
                bot_id: "bot-1".into(),
                one_time_token: Some("tok".into()),
                api_key: None,
                created_at_ms: 1,
            })
            .unwrap();

        assert_eq!(
            store.consume_one_time("bot-1", "wrong", "key").unwrap(),
            TokenSwap::Rejected
        );
        // Token survives a failed attempt.
        assert_eq!(
            store.consume_one_time("bot-1", "tok", "key").unwrap(),
            TokenSwap::Issued
        );
    }

    #[test]
    fn test_token_swap_exactly_once_concurrent() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_credentials(&CredentialRecord {
                bot_id: "bot-1".into(),
                one_time_token: Some("tok".into()),
                api_key: None,
                created_at_ms: 1,
            })
            .unwrap();

        let wins = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let wins = wins.clone();
            handles.push(std::thread::spawn(move || {
                let key = format!("key-{}", i);
                if store.consume_one_time("bot-1", "tok", &key).unwrap() == TokenSwap::Issued {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_verify_unknown_bot() {
        let store = MemoryStore::new();
        assert!(!store.verify_api_key("nope", "key").unwrap());
    }

    #[test]
    fn test_task_listing_order_and_filter() {
        let store = MemoryStore::new();
        for (i, state) in [TaskState::Pending, TaskState::Completed, TaskState::Pending]
            .iter()
            .enumerate()
        {
            store
                .put_task(&TaskRecord {
                    task_id: format!("task-{}", i),
                    bot_id: "bot-1".into(),
                    command_name: "t.exec".into(),
                    arguments: vec![],
                    state: *state,
                    progress: 0,
                    result: None,
                    error: None,
                    submitted_at_ms: 100 + i as u64,
                    started_at_ms: None,
                    completed_at_ms: None,
                    retries_remaining: 0,
                })
                .unwrap();
        }

        let all = store.list_tasks(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].task_id, "task-0");
        assert_eq!(all[2].task_id, "task-2");

        let pending = store.list_tasks(Some(TaskState::Pending)).unwrap();
        assert_eq!(pending.len(), 2);
    }
}
