use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Currency of a ledger movement, always in the smallest unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    /// In-app credits.
    Credits,
    /// Fiat minor units for shop flows that share the ledger.
    UsdCents,
}

/// Ledger entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    BountyRefund,
    /// Manual correction. Entries are never mutated; a correction is a new
    /// offsetting entry.
    Adjustment,
}

/// Immutable, append-only ledger entry.
///
/// At least one of `to_uid`/`from_uid` is present; `reference_id` points at
/// the source entity (e.g. a bounty id) for audit and re-derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub kind: LedgerEntryKind,
    pub amount: u64,
    pub currency: Currency,
    pub to_uid: Option<String>,
    pub from_uid: Option<String>,
    pub reference_id: String,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn bounty_refund(
        to_uid: impl Into<String>,
        amount: u64,
        currency: Currency,
        bounty_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let bounty_id = bounty_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: LedgerEntryKind::BountyRefund,
            amount,
            currency,
            to_uid: Some(to_uid.into()),
            from_uid: None,
            reference_id: bounty_id.clone(),
            memo: Some(format!("expiry refund for bounty {bounty_id}")),
            created_at,
        }
    }

    pub fn adjustment(
        to_uid: Option<String>,
        from_uid: Option<String>,
        amount: u64,
        currency: Currency,
        reference_id: impl Into<String>,
        memo: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: LedgerEntryKind::Adjustment,
            amount,
            currency,
            to_uid,
            from_uid,
            reference_id: reference_id.into(),
            memo: Some(memo.into()),
            created_at,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.to_uid.is_none() && self.from_uid.is_none() {
            return Err(CoreError::InvalidEntry(
                "entry names neither a credited nor a debited party".to_string(),
            ));
        }
        if self.amount > i64::MAX as u64 {
            return Err(CoreError::InvalidEntry(format!(
                "amount {} exceeds balance range",
                self.amount
            )));
        }
        Ok(())
    }
}

/// One record per `(user_id, nonce)` idempotency key. Never mutated; expires
/// passively and is reclaimed lazily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub user_id: String,
    pub nonce: String,
    pub action_hash: String,
    pub expires_at: DateTime<Utc>,
}

impl ReplayRecord {
    /// Storage key for the record. A live record under this key is
    /// authoritative regardless of action hash. The user id is
    /// length-prefixed so a `:` inside it cannot shift bytes into the nonce.
    pub fn key(user_id: &str, nonce: &str) -> String {
        format!("{}:{user_id}:{nonce}", user_id.len())
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BountyStatus {
    Open,
    Expired,
    /// Terminal state reached outside the sweep; the sweep treats it as a
    /// no-op candidate.
    Completed,
}

/// Bounty state shared with the wider platform. The sweep transaction is the
/// only legal mutator of `status` within this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounty {
    pub id: String,
    /// Absent creator is a valid terminal situation, not an error.
    pub creator_uid: Option<String>,
    pub reward_total: u64,
    pub currency: Currency,
    pub status: BountyStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_reason: Option<String>,
}

impl Bounty {
    pub fn open(
        id: impl Into<String>,
        creator_uid: Option<String>,
        reward_total: u64,
        currency: Currency,
        expires_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            creator_uid,
            reward_total,
            currency,
            status: BountyStatus::Open,
            expires_at,
            created_at,
            locked_reason: None,
        }
    }

    /// A reward must fit the ledger's signed balance range, or the expiry
    /// refund it implies could never be applied.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.reward_total > i64::MAX as u64 {
            return Err(CoreError::InvalidBounty(format!(
                "reward_total {} exceeds ledger amount range",
                self.reward_total
            )));
        }
        Ok(())
    }
}

/// Derived wallet balance, mutated only inside the same transaction that
/// appends the implying ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBalance {
    pub user_id: String,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_requires_at_least_one_party() {
        let mut entry = LedgerEntry::bounty_refund("u1", 80, Currency::Credits, "b1", Utc::now());
        assert!(entry.validate().is_ok());

        entry.to_uid = None;
        assert!(matches!(
            entry.validate(),
            Err(CoreError::InvalidEntry(_))
        ));
    }

    #[test]
    fn replay_record_liveness_follows_expiry() {
        let now = Utc::now();
        let record = ReplayRecord {
            user_id: "u1".to_string(),
            nonce: "nonce-0001".to_string(),
            action_hash: "abc".to_string(),
            expires_at: now + chrono::Duration::minutes(5),
        };
        assert!(record.is_live(now));
        assert!(!record.is_live(now + chrono::Duration::minutes(6)));
    }

    #[test]
    fn replay_key_binds_user_and_nonce() {
        assert_eq!(ReplayRecord::key("u1", "nonce-0001"), "2:u1:nonce-0001");
        assert_ne!(
            ReplayRecord::key("u1", "nonce-0001"),
            ReplayRecord::key("u2", "nonce-0001")
        );
    }

    #[test]
    fn replay_key_is_unambiguous_for_colons_in_the_user_id() {
        assert_ne!(
            ReplayRecord::key("a:b", "cdefghijkl"),
            ReplayRecord::key("a", "b:cdefghijkl")
        );
    }

    #[test]
    fn bounty_reward_must_fit_the_balance_range() {
        let now = Utc::now();
        let bounty = Bounty::open("b1", Some("u1".to_string()), 100, Currency::Credits, now, now);
        assert!(bounty.validate().is_ok());

        let mut oversized = bounty;
        oversized.reward_total = u64::MAX;
        assert!(matches!(
            oversized.validate(),
            Err(CoreError::InvalidBounty(_))
        ));
    }
}
