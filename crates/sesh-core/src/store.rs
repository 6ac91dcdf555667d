//! Transactional store contract.
//!
//! The original persistence layer is a managed document database with
//! optimistic transactions. The contract here is the minimum the core needs
//! from any backing store: versioned document reads, an atomic commit that
//! validates every read stamp, and one indexed query for the expiry sweep.
//! Mutual exclusion is delegated entirely to `commit`; the core takes no
//! in-process locks.

use crate::error::{CoreError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Logical collections of the persisted layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    ReplayRecords,
    LedgerEntries,
    Bounties,
    Wallets,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReplayRecords => "replay_records",
            Self::LedgerEntries => "ledger_entries",
            Self::Bounties => "bounties",
            Self::Wallets => "wallets",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocKey {
    pub collection: Collection,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }
}

/// A document value plus the version observed at read time.
#[derive(Debug, Clone)]
pub struct VersionedDoc {
    pub value: Value,
    pub version: u64,
}

/// Read-set element recorded by a transaction. `version: None` means the
/// document was observed absent and must still be absent at commit.
#[derive(Debug, Clone)]
pub struct ReadStamp {
    pub key: DocKey,
    pub version: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    Put { key: DocKey, value: Value },
    Delete { key: DocKey },
}

impl WriteOp {
    pub fn key(&self) -> &DocKey {
        match self {
            Self::Put { key, .. } => key,
            Self::Delete { key } => key,
        }
    }
}

/// Snapshot-isolated read-modify-write document store.
///
/// `commit` must atomically verify that every read stamp still matches the
/// current document version (absence included) and apply all writes, or fail
/// with [`StoreError::Conflict`] and apply nothing.
#[async_trait]
pub trait TxStore: Send + Sync {
    async fn get(&self, key: &DocKey) -> Result<Option<VersionedDoc>, StoreError>;

    async fn commit(&self, reads: &[ReadStamp], writes: &[WriteOp]) -> Result<(), StoreError>;

    /// Full collection listing, for audit tooling and maintenance.
    async fn scan(&self, collection: Collection) -> Result<Vec<(String, VersionedDoc)>, StoreError>;

    /// Ids of bounties with `status == open` and `expires_at <= cutoff`,
    /// ordered by expiry. Served from the `(status, expires_at)` index.
    async fn expired_open_bounties(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    fn backend_label(&self) -> &'static str;
}

/// One optimistic read-modify-write unit against a [`TxStore`].
///
/// Reads are stamped with the observed version; writes are buffered and
/// visible to subsequent reads in the same transaction. A transaction with no
/// writes commits as a no-op without touching the store.
pub struct Transaction {
    store: Arc<dyn TxStore>,
    reads: Vec<ReadStamp>,
    writes: BTreeMap<DocKey, WriteOp>,
}

impl Transaction {
    pub fn begin(store: Arc<dyn TxStore>) -> Self {
        Self {
            store,
            reads: Vec::new(),
            writes: BTreeMap::new(),
        }
    }

    pub async fn get<T: DeserializeOwned>(&mut self, key: &DocKey) -> Result<Option<T>, StoreError> {
        if let Some(buffered) = self.writes.get(key) {
            return match buffered {
                WriteOp::Put { value, .. } => Ok(Some(serde_json::from_value(value.clone())?)),
                WriteOp::Delete { .. } => Ok(None),
            };
        }

        let doc = self.store.get(key).await?;
        self.reads.push(ReadStamp {
            key: key.clone(),
            version: doc.as_ref().map(|d| d.version),
        });

        match doc {
            Some(doc) => Ok(Some(serde_json::from_value(doc.value)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&mut self, key: DocKey, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.writes.insert(key.clone(), WriteOp::Put { key, value });
        Ok(())
    }

    pub fn delete(&mut self, key: DocKey) {
        self.writes.insert(key.clone(), WriteOp::Delete { key });
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let writes: Vec<WriteOp> = self.writes.into_values().collect();
        self.store.commit(&self.reads, &writes).await
    }
}

/// Bounded retry policy for conflict aborts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt.min(6))
    }
}

fn is_conflict(err: &CoreError) -> bool {
    matches!(err, CoreError::Store(StoreError::Conflict))
}

/// Run `body` inside a fresh transaction, retrying on conflict with backoff.
///
/// Exhausting the policy surfaces [`StoreError::RetriesExhausted`], which is
/// always safe to retry later: every transaction in this core re-checks state
/// inside the transaction, so reprocessing is a no-op when another run
/// already succeeded.
pub async fn run_with_retry<T, F>(
    store: Arc<dyn TxStore>,
    policy: &RetryPolicy,
    mut body: F,
) -> Result<T, CoreError>
where
    F: for<'t> FnMut(&'t mut Transaction) -> BoxFuture<'t, Result<T, CoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let mut tx = Transaction::begin(store.clone());

        let value = match body(&mut tx).await {
            Ok(value) => value,
            Err(err) if is_conflict(&err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(StoreError::RetriesExhausted { attempts: attempt }.into());
                }
                tokio::time::sleep(policy.backoff(attempt)).await;
                continue;
            }
            Err(err) => return Err(err),
        };

        match tx.commit().await {
            Ok(()) => return Ok(value),
            Err(StoreError::Conflict) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(StoreError::RetriesExhausted { attempts: attempt }.into());
                }
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
        }
    }

    fn key() -> DocKey {
        DocKey::new(Collection::Wallets, "u1")
    }

    async fn seed(store: &MemoryStore) {
        store
            .commit(
                &[],
                &[WriteOp::Put {
                    key: key(),
                    value: json!({"n": 0}),
                }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn persistent_conflict_exhausts_the_retry_budget() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;

        // A competing writer lands between every read and commit, so each
        // attempt's stamp is stale by commit time.
        let raw = store.clone();
        let result = run_with_retry(store.clone(), &fast_policy(3), move |tx| {
            let raw = raw.clone();
            async move {
                let _: Option<serde_json::Value> = tx.get(&key()).await?;
                raw.commit(
                    &[],
                    &[WriteOp::Put {
                        key: key(),
                        value: json!({"n": 1}),
                    }],
                )
                .await?;
                tx.put(key(), &json!({"n": 2}))?;
                Ok(())
            }
            .boxed()
        })
        .await;

        assert!(matches!(
            result,
            Err(CoreError::Store(StoreError::RetriesExhausted { attempts: 3 }))
        ));
    }

    #[tokio::test]
    async fn transient_conflict_succeeds_within_the_budget() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;

        let raw = store.clone();
        let clashes = Arc::new(AtomicU32::new(0));
        let result = run_with_retry(store.clone(), &fast_policy(3), move |tx| {
            let raw = raw.clone();
            let clashes = clashes.clone();
            async move {
                let _: Option<serde_json::Value> = tx.get(&key()).await?;
                // Only the first attempt races with another writer.
                if clashes.fetch_add(1, Ordering::SeqCst) == 0 {
                    raw.commit(
                        &[],
                        &[WriteOp::Put {
                            key: key(),
                            value: json!({"n": 1}),
                        }],
                    )
                    .await?;
                }
                tx.put(key(), &json!({"n": 2}))?;
                Ok(())
            }
            .boxed()
        })
        .await;

        assert!(result.is_ok());
        let doc = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(doc.value["n"], 2);
    }
}
