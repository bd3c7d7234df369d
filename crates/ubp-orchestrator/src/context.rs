// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! Session-scoped context documents with TTL.
//!
//! Whole-document upserts keyed by (`session_id`, `namespace`); merges are
//! the caller's responsibility. A document past its expiry is invisible to
//! readers even before the sweeper reclaims it. The sweeper removes a
//! bounded batch per pass so a scan never monopolizes the map.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

const SWEEP_BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ContextKey {
    session_id: String,
    namespace: String,
}

#[derive(Debug, Clone)]
struct ContextDocument {
    payload: serde_json::Value,
    expires_at: Instant,
}

/// Concurrent TTL-bounded key/value store.
#[derive(Clone, Default)]
pub struct ContextStore {
    docs: Arc<DashMap<ContextKey, ContextDocument>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the document and reset its expiry.
    pub fn upsert(
        &self,
        session_id: &str,
        namespace: &str,
        payload: serde_json::Value,
        ttl: Duration,
    ) {
        self.docs.insert(
            ContextKey {
                session_id: session_id.to_string(),
                namespace: namespace.to_string(),
            },
            ContextDocument {
                payload,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch a document; expired or absent documents read as `None`.
    pub fn get(&self, session_id: &str, namespace: &str) -> Option<serde_json::Value> {
        let key = ContextKey {
            session_id: session_id.to_string(),
            namespace: namespace.to_string(),
        };
        let doc = self.docs.get(&key)?;
        if doc.expires_at <= Instant::now() {
            return None;
        }
        Some(doc.payload.clone())
    }

    /// Remove a document. Returns false if it was absent (or expired and
    /// already swept).
    pub fn delete(&self, session_id: &str, namespace: &str) -> bool {
        let key = ContextKey {
            session_id: session_id.to_string(),
            namespace: namespace.to_string(),
        };
        self.docs.remove(&key).is_some()
    }

    /// Reclaim up to [`SWEEP_BATCH`] expired documents. Returns the number
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<ContextKey> = self
            .docs
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| entry.key().clone())
            .take(SWEEP_BATCH)
            .collect();

        let mut removed = 0;
        for key in expired {
            // Re-check under the shard lock: the document may have been
            // replaced since the scan.
            if self
                .docs
                .remove_if(&key, |_, doc| doc.expires_at <= now)
                .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "context sweep reclaimed expired documents");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}
