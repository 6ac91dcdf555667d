//! Append-only credit ledger and derived wallet balances.
//!
//! Design choice: there is no standalone apply API. An entry can only be
//! written through [`Ledger::apply_entry`] inside a caller-owned transaction,
//! which also applies exactly the wallet movements the entry implies. A
//! failure between the entry append and the balance update is impossible by
//! construction because both commit as one unit.

use crate::error::{CoreError, StoreError};
use crate::store::{Collection, DocKey, Transaction, TxStore};
use crate::types::{LedgerEntry, WalletBalance};
use serde::Serialize;
use std::sync::Arc;

/// Read surface over ledger entries and wallet balances.
pub struct Ledger {
    store: Arc<dyn TxStore>,
}

/// Result of re-deriving a wallet balance from its entries.
#[derive(Debug, Clone, Serialize)]
pub struct WalletAudit {
    pub user_id: String,
    pub stored_balance: i64,
    pub derived_balance: i64,
    pub entry_count: usize,
    pub consistent: bool,
}

impl Ledger {
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self { store }
    }

    /// Append `entry` and mutate the implied wallet balances within `tx`.
    /// The caller decides what else commits in the same unit (e.g. a bounty
    /// status flip).
    pub async fn apply_entry(tx: &mut Transaction, entry: &LedgerEntry) -> Result<(), CoreError> {
        entry.validate()?;

        let entry_key = DocKey::new(Collection::LedgerEntries, entry.id.clone());
        if tx.get::<LedgerEntry>(&entry_key).await?.is_some() {
            return Err(CoreError::InvalidEntry(format!(
                "ledger entry '{}' already exists",
                entry.id
            )));
        }
        tx.put(entry_key, entry)?;

        let amount = entry.amount as i64;
        if let Some(to_uid) = &entry.to_uid {
            Self::adjust_wallet(tx, to_uid, amount, entry).await?;
        }
        if let Some(from_uid) = &entry.from_uid {
            Self::adjust_wallet(tx, from_uid, -amount, entry).await?;
        }
        Ok(())
    }

    async fn adjust_wallet(
        tx: &mut Transaction,
        user_id: &str,
        delta: i64,
        entry: &LedgerEntry,
    ) -> Result<(), CoreError> {
        let key = DocKey::new(Collection::Wallets, user_id);
        let mut wallet = tx
            .get::<WalletBalance>(&key)
            .await?
            .unwrap_or(WalletBalance {
                user_id: user_id.to_string(),
                balance: 0,
                updated_at: entry.created_at,
            });
        wallet.balance = wallet.balance.checked_add(delta).ok_or_else(|| {
            CoreError::InvalidEntry(format!(
                "entry '{}' overflows the wallet balance of {user_id}",
                entry.id
            ))
        })?;
        wallet.updated_at = entry.created_at;
        tx.put(key, &wallet)?;
        Ok(())
    }

    /// Current balance, served from the maintained wallet document. A user
    /// without a wallet document has a balance of zero.
    pub async fn balance(&self, user_id: &str) -> Result<i64, CoreError> {
        let key = DocKey::new(Collection::Wallets, user_id);
        match self.store.get(&key).await? {
            Some(doc) => {
                let wallet: WalletBalance =
                    serde_json::from_value(doc.value).map_err(StoreError::from)?;
                Ok(wallet.balance)
            }
            None => Ok(0),
        }
    }

    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, CoreError> {
        let docs = self.store.scan(Collection::LedgerEntries).await?;
        let mut entries = Vec::with_capacity(docs.len());
        for (_, doc) in docs {
            let entry: LedgerEntry =
                serde_json::from_value(doc.value).map_err(StoreError::from)?;
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    pub async fn entries_for_user(&self, user_id: &str) -> Result<Vec<LedgerEntry>, CoreError> {
        let entries = self.entries().await?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                entry.to_uid.as_deref() == Some(user_id)
                    || entry.from_uid.as_deref() == Some(user_id)
            })
            .collect())
    }

    /// Re-derive the balance from entries and compare with the wallet
    /// document. The two can only diverge through writes that bypass
    /// [`Ledger::apply_entry`].
    pub async fn audit_user(&self, user_id: &str) -> Result<WalletAudit, CoreError> {
        let entries = self.entries_for_user(user_id).await?;
        let mut derived: i64 = 0;
        for entry in &entries {
            if entry.to_uid.as_deref() == Some(user_id) {
                derived += entry.amount as i64;
            }
            if entry.from_uid.as_deref() == Some(user_id) {
                derived -= entry.amount as i64;
            }
        }
        let stored = self.balance(user_id).await?;
        Ok(WalletAudit {
            user_id: user_id.to_string(),
            stored_balance: stored,
            derived_balance: derived,
            entry_count: entries.len(),
            consistent: stored == derived,
        })
    }
}
