//! Replay guard: atomic check-and-store over `(user_id, nonce)` keys.

use crate::error::{CoreError, StoreError};
use crate::store::{run_with_retry, Collection, DocKey, ReadStamp, RetryPolicy, TxStore, WriteOp};
use crate::types::ReplayRecord;
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;

/// Minimum accepted nonce length. Shorter tokens are an input error rejected
/// before any store access.
pub const MIN_NONCE_LEN: usize = 10;

const DEFAULT_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayDecision {
    /// First sighting of the key; a fresh record was written.
    Stored,
    /// A live record exists. This is a normal outcome, not a system fault.
    Replay,
}

/// Idempotency/nonce store with atomic check-and-store semantics.
///
/// Atomicity is delegated to the backing store's transaction isolation: the
/// read and the conditional write commit as one unit, so concurrent callers
/// on the same key serialize and exactly one observes `Stored`.
pub struct ReplayGuard {
    store: Arc<dyn TxStore>,
    retry: RetryPolicy,
    ttl: Duration,
}

impl ReplayGuard {
    /// Guard with the default 5 minute TTL, chosen to outlast plausible
    /// client retry storms while bounding storage growth.
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self::with_ttl(store, Duration::seconds(DEFAULT_TTL_SECS))
    }

    pub fn with_ttl(store: Arc<dyn TxStore>, ttl: Duration) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            ttl,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn check_and_store(
        &self,
        user_id: &str,
        nonce: &str,
        action_hash: &str,
    ) -> Result<ReplayDecision, CoreError> {
        self.check_and_store_at(user_id, nonce, action_hash, Utc::now())
            .await
    }

    /// Clock-explicit variant of [`check_and_store`](Self::check_and_store);
    /// `now` anchors both liveness and the new record's TTL window.
    ///
    /// A live record always wins, even when its bound action hash matches the
    /// new attempt exactly: idempotent handling of a retry is the caller's
    /// responsibility via the nonce, and re-deriving "same action, safe to
    /// reapply" would reopen double-credit risk.
    pub async fn check_and_store_at(
        &self,
        user_id: &str,
        nonce: &str,
        action_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<ReplayDecision, CoreError> {
        if nonce.chars().count() < MIN_NONCE_LEN {
            return Err(CoreError::InvalidNonce(format!(
                "nonce must be at least {MIN_NONCE_LEN} characters"
            )));
        }

        let key = DocKey::new(Collection::ReplayRecords, ReplayRecord::key(user_id, nonce));
        let record = ReplayRecord {
            user_id: user_id.to_string(),
            nonce: nonce.to_string(),
            action_hash: action_hash.to_string(),
            expires_at: now + self.ttl,
        };

        run_with_retry(self.store.clone(), &self.retry, move |tx| {
            let key = key.clone();
            let record = record.clone();
            async move {
                if let Some(existing) = tx.get::<ReplayRecord>(&key).await? {
                    if existing.is_live(now) {
                        return Ok(ReplayDecision::Replay);
                    }
                }
                // Absent or expired: the key is claimable. The commit-time
                // version check makes this claim exclusive.
                tx.put(key, &record)?;
                Ok(ReplayDecision::Stored)
            }
            .boxed()
        })
        .await
    }

    /// Physically reclaim expired records. Needed only for space; liveness
    /// checks make correctness independent of reclamation timing.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let docs = self.store.scan(Collection::ReplayRecords).await?;
        let mut reads = Vec::new();
        let mut writes = Vec::new();

        for (id, doc) in docs {
            let record: ReplayRecord =
                serde_json::from_value(doc.value).map_err(StoreError::from)?;
            if !record.is_live(now) {
                let key = DocKey::new(Collection::ReplayRecords, id);
                reads.push(ReadStamp {
                    key: key.clone(),
                    version: Some(doc.version),
                });
                writes.push(WriteOp::Delete { key });
            }
        }

        if writes.is_empty() {
            return Ok(0);
        }
        let purged = writes.len();
        self.store.commit(&reads, &writes).await?;
        Ok(purged)
    }
}
