//! Replay-protected action verification and atomic ledger settlement for the
//! Sesh platform.
//!
//! Guarantees: a physical-world action is accepted at most once per
//! client-generated nonce, and bounty refunds are applied exactly once even
//! under concurrent sweep execution and transaction retries. All mutual
//! exclusion is delegated to the backing store's optimistic transactions.

#![deny(unsafe_code)]

pub mod clock;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod memory;
pub mod replay;
pub mod settlement;
pub mod store;
pub mod types;
pub mod verify;

pub use clock::{validate_timestamp, TimestampCheck, MAX_CLOCK_SKEW_SECS};
pub use error::{CoreError, StoreError};
pub use fingerprint::action_fingerprint;
pub use ledger::{Ledger, WalletAudit};
pub use memory::MemoryStore;
pub use replay::{ReplayDecision, ReplayGuard, MIN_NONCE_LEN};
pub use settlement::{refund_amount, SettlementEngine, SweepReport};
pub use store::{
    run_with_retry, Collection, DocKey, ReadStamp, RetryPolicy, Transaction, TxStore,
    VersionedDoc, WriteOp,
};
pub use types::{
    Bounty, BountyStatus, Currency, LedgerEntry, LedgerEntryKind, ReplayRecord, WalletBalance,
};
pub use verify::{CheckInRequest, RejectReason, Verifier, VerifyOutcome};
