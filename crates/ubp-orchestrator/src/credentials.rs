// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Bot definition lifecycle and credential handling.
//!
//! A definition is created with a single-use registration token. The first
//! successful handshake presenting that token atomically swaps it for a
//! long-lived API key (the swap itself is a `StateStore` contract). Both
//! secrets are returned exactly once and never appear in any read API.

use std::sync::Arc;

use anyhow::{Context, Result};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{info, warn};
use ubp_persistence::{BotDefinitionRecord, CredentialRecord, StateStore, TokenSwap};
use uuid::Uuid;

use crate::telemetry::now_ms;

/// One-time registration tokens are 128-bit, API keys 256-bit.
const ONE_TIME_TOKEN_BYTES: usize = 16;
const API_KEY_BYTES: usize = 32;

/// Fields accepted when creating or updating a definition.
#[derive(Debug, Clone)]
pub struct BotSpec {
    pub name: String,
    pub description: Option<String>,
    pub adapter_type: String,
    pub capabilities: Vec<String>,
    pub configuration: serde_json::Value,
}

/// Result of registering a definition. The token is shown here and never
/// again.
#[derive(Debug)]
pub struct CreatedBot {
    pub definition: BotDefinitionRecord,
    pub one_time_token: String,
}

/// Handshake authentication outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// A valid long-lived key was presented.
    LongLived,
    /// The one-time token was consumed; carries the freshly minted key.
    Issued(String),
    /// Unknown bot or credential mismatch.
    Rejected,
}

/// Owns definitions and their credentials.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn StateStore>,
    rng: Arc<SystemRandom>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            rng: Arc::new(SystemRandom::new()),
        }
    }

    /// Register a new definition. Generates a fresh `bot_id` and one-time
    /// token; both are returned once.
    pub fn create_definition(&self, spec: BotSpec) -> Result<CreatedBot> {
        let bot_id = format!("bot-{}", Uuid::new_v4().simple());
        let one_time_token = self.random_hex(ONE_TIME_TOKEN_BYTES)?;
        let now = now_ms();

        let definition = BotDefinitionRecord {
            bot_id: bot_id.clone(),
            name: spec.name,
            description: spec.description,
            adapter_type: spec.adapter_type,
            declared_capabilities: spec.capabilities,
            configuration: spec.configuration,
            created_at_ms: now,
        };
        self.store.put_definition(&definition)?;
        self.store.put_credentials(&CredentialRecord {
            bot_id: bot_id.clone(),
            one_time_token: Some(one_time_token.clone()),
            api_key: None,
            created_at_ms: now,
        })?;

        info!(
            bot_id = %bot_id,
            adapter_type = %definition.adapter_type,
            event = "bot_registered",
            "registered bot definition"
        );

        Ok(CreatedBot {
            definition,
            one_time_token,
        })
    }

    pub fn get_definition(&self, bot_id: &str) -> Result<Option<BotDefinitionRecord>> {
        self.store.get_definition(bot_id)
    }

    pub fn list_definitions(&self) -> Result<Vec<BotDefinitionRecord>> {
        self.store.list_definitions()
    }

    /// Replace the mutable fields of an existing definition. `bot_id` and
    /// `created_at` are immutable.
    pub fn update_definition(&self, bot_id: &str, spec: BotSpec) -> Result<Option<BotDefinitionRecord>> {
        let Some(existing) = self.store.get_definition(bot_id)? else {
            return Ok(None);
        };
        let updated = BotDefinitionRecord {
            bot_id: existing.bot_id,
            name: spec.name,
            description: spec.description,
            adapter_type: spec.adapter_type,
            declared_capabilities: spec.capabilities,
            configuration: spec.configuration,
            created_at_ms: existing.created_at_ms,
        };
        self.store.put_definition(&updated)?;
        Ok(Some(updated))
    }

    /// Remove a definition and invalidate its credentials. The caller is
    /// responsible for tearing down live instances of the bot.
    pub fn delete_definition(&self, bot_id: &str) -> Result<bool> {
        let removed = self.store.delete_definition(bot_id)?;
        if removed {
            info!(bot_id = %bot_id, event = "bot_deleted", "deleted bot definition");
        }
        Ok(removed)
    }

    /// Authenticate a handshake credential for `bot_id`.
    ///
    /// Tries the long-lived key first, then the one-time path. The one-time
    /// path is non-replayable: concurrent attempts with the same token
    /// yield exactly one `Issued`.
    pub fn authenticate(&self, bot_id: &str, candidate: &str) -> Result<AuthOutcome> {
        if self.store.get_definition(bot_id)?.is_none() {
            warn!(bot_id = %bot_id, event = "bot_auth_failed", "handshake for unknown bot");
            return Ok(AuthOutcome::Rejected);
        }

        if self.store.verify_api_key(bot_id, candidate)? {
            return Ok(AuthOutcome::LongLived);
        }

        let new_key = self.random_hex(API_KEY_BYTES)?;
        match self.store.consume_one_time(bot_id, candidate, &new_key)? {
            TokenSwap::Issued => {
                info!(bot_id = %bot_id, event = "bot_key_issued", "one-time token consumed");
                Ok(AuthOutcome::Issued(new_key))
            }
            TokenSwap::Rejected => {
                warn!(bot_id = %bot_id, event = "bot_auth_failed", "credential rejected");
                Ok(AuthOutcome::Rejected)
            }
        }
    }

    fn random_hex(&self, bytes: usize) -> Result<String> {
        let mut buf = vec![0u8; bytes];
        self.rng
            .fill(&mut buf)
            .ok()
            .context("system rng failed")?;
        Ok(hex::encode(&buf))
    }
}

/// Hex encoding for credential material.
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubp_persistence::MemoryStore;

    fn store() -> CredentialStore {
        CredentialStore::new(Arc::new(MemoryStore::new()))
    }

    fn spec() -> BotSpec {
        BotSpec {
            name: "demo".into(),
            description: None,
            adapter_type: "console".into(),
            capabilities: vec!["t.exec".into()],
            configuration: serde_json::json!({}),
        }
    }

    #[test]
    fn test_create_generates_distinct_secrets() {
        let creds = store();
        let a = creds.create_definition(spec()).unwrap();
        let b = creds.create_definition(spec()).unwrap();

        assert_ne!(a.definition.bot_id, b.definition.bot_id);
        assert_ne!(a.one_time_token, b.one_time_token);
        assert_eq!(a.one_time_token.len(), ONE_TIME_TOKEN_BYTES * 2);
    }

    #[test]
    fn test_onboarding_flow() {
        let creds = store();
        let created = creds.create_definition(spec()).unwrap();
        let bot_id = &created.definition.bot_id;

        // First handshake with the token mints a key.
        let outcome = creds.authenticate(bot_id, &created.one_time_token).unwrap();
        let AuthOutcome::Issued(key) = outcome else {
            panic!("expected issued key, got {:?}", outcome);
        };
        assert_eq!(key.len(), API_KEY_BYTES * 2);

        // Token replay fails; the key keeps working.
        assert_eq!(
            creds.authenticate(bot_id, &created.one_time_token).unwrap(),
            AuthOutcome::Rejected
        );
        assert_eq!(
            creds.authenticate(bot_id, &key).unwrap(),
            AuthOutcome::LongLived
        );
    }

    #[test]
    fn test_unknown_bot_rejected() {
        let creds = store();
        assert_eq!(
            creds.authenticate("bot-missing", "anything").unwrap(),
            AuthOutcome::Rejected
        );
    }

    #[test]
    fn test_update_preserves_identity() {
        let creds = store();
        let created = creds.create_definition(spec()).unwrap();
        let bot_id = created.definition.bot_id.clone();

        let mut new_spec = spec();
        new_spec.name = "renamed".into();
        let updated = creds.update_definition(&bot_id, new_spec).unwrap().unwrap();

        assert_eq!(updated.bot_id, bot_id);
        assert_eq!(updated.created_at_ms, created.definition.created_at_ms);
        assert_eq!(updated.name, "renamed");
    }

    #[test]
    fn test_delete_invalidates_credentials() {
        let creds = store();
        let created = creds.create_definition(spec()).unwrap();
        let bot_id = created.definition.bot_id.clone();

        assert!(creds.delete_definition(&bot_id).unwrap());
        assert!(!creds.delete_definition(&bot_id).unwrap());
        assert_eq!(
            creds.authenticate(&bot_id, &created.one_time_token).unwrap(),
            AuthOutcome::Rejected
        );
    }
}
