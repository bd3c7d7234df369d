// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! State store backends for the UBP orchestrator.
//!
//! Persists the three state classes whose loss is observable to clients:
//! bot definitions, credentials, and task records. Instance and envelope
//! state is intentionally memory-only and never touches this crate.
//!
//! # Backends
//!
//! - [`MemoryStore`] -- default, used when no store URL is configured
//! - [`SqliteStore`] -- durable, selected via `sqlite://<path>`

use std::sync::Arc;

use anyhow::{bail, Result};

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{
    constant_time_eq, BotDefinitionRecord, CredentialRecord, StateStore, TaskRecord, TaskState,
    TokenSwap,
};

/// Open a store from a configured URL. `None` selects the in-memory backend.
pub fn open(url: Option<&str>) -> Result<Arc<dyn StateStore>> {
    match url {
        None => Ok(Arc::new(MemoryStore::new())),
        Some(url) => match url.strip_prefix("sqlite://") {
            Some(":memory:") => Ok(Arc::new(SqliteStore::new_in_memory()?)),
            Some(path) => Ok(Arc::new(SqliteStore::new(path)?)),
            None => bail!("unsupported state store url: {}", url),
        },
    }
}
