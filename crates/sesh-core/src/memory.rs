//! In-memory store used for tests, local development, and embedding.
//!
//! Drop-in substitute for the durable backend: higher layers depend only on
//! the [`TxStore`] contract, so the memory and Postgres implementations are
//! interchangeable at construction time.

use crate::error::StoreError;
use crate::store::{Collection, DocKey, ReadStamp, TxStore, VersionedDoc, WriteOp};
use crate::types::{Bounty, BountyStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    docs: HashMap<DocKey, VersionedDoc>,
    /// Global monotonic counter so a delete-and-recreate can never reuse a
    /// stamped version.
    last_version: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn doc_count(&self, collection: Collection) -> usize {
        match self.inner.read() {
            Ok(state) => state
                .docs
                .keys()
                .filter(|key| key.collection == collection)
                .count(),
            Err(_) => 0,
        }
    }
}

fn poisoned(_: impl std::fmt::Debug) -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

#[async_trait]
impl TxStore for MemoryStore {
    async fn get(&self, key: &DocKey) -> Result<Option<VersionedDoc>, StoreError> {
        let state = self.inner.read().map_err(poisoned)?;
        Ok(state.docs.get(key).cloned())
    }

    async fn commit(&self, reads: &[ReadStamp], writes: &[WriteOp]) -> Result<(), StoreError> {
        let mut state = self.inner.write().map_err(poisoned)?;

        for stamp in reads {
            let current = state.docs.get(&stamp.key).map(|doc| doc.version);
            if current != stamp.version {
                return Err(StoreError::Conflict);
            }
        }

        for write in writes {
            match write {
                WriteOp::Put { key, value } => {
                    state.last_version += 1;
                    let version = state.last_version;
                    state.docs.insert(
                        key.clone(),
                        VersionedDoc {
                            value: value.clone(),
                            version,
                        },
                    );
                }
                WriteOp::Delete { key } => {
                    state.docs.remove(key);
                }
            }
        }

        Ok(())
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<(String, VersionedDoc)>, StoreError> {
        let state = self.inner.read().map_err(poisoned)?;
        let mut docs: Vec<(String, VersionedDoc)> = state
            .docs
            .iter()
            .filter(|(key, _)| key.collection == collection)
            .map(|(key, doc)| (key.id.clone(), doc.clone()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(docs)
    }

    async fn expired_open_bounties(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let docs = self.scan(Collection::Bounties).await?;
        let mut matches: Vec<Bounty> = Vec::new();
        for (_, doc) in docs {
            let bounty: Bounty = serde_json::from_value(doc.value)?;
            if bounty.status == BountyStatus::Open && bounty.expires_at <= cutoff {
                matches.push(bounty);
            }
        }
        matches.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));
        Ok(matches.into_iter().take(limit).map(|b| b.id).collect())
    }

    fn backend_label(&self) -> &'static str {
        "memory"
    }
}
