//! Settlement engine: the bounty expiry sweep.
//!
//! Per bounty the state machine here is `Open -> Expired`, taken at most
//! once. The sweep may overlap live traffic and earlier sweep ticks; the
//! status re-check inside each transaction (not the outer scan snapshot) is
//! what makes reprocessing a no-op.

use crate::error::CoreError;
use crate::ledger::Ledger;
use crate::store::{run_with_retry, Collection, DocKey, RetryPolicy, TxStore};
use crate::types::{Bounty, BountyStatus, LedgerEntry};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Refunded share of the reward on expiry. The withheld 20% is an intentional
/// anti-abuse forfeiture, not an error.
const REFUND_NUMERATOR: u128 = 80;
const REFUND_DENOMINATOR: u128 = 100;

const DEFAULT_BATCH_LIMIT: usize = 500;

pub fn refund_amount(reward_total: u64) -> u64 {
    ((reward_total as u128 * REFUND_NUMERATOR) / REFUND_DENOMINATOR) as u64
}

/// Outcome counters for one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    /// Transitioned to `Expired` with a refund credited.
    pub refunded: usize,
    /// Transitioned to `Expired` without a refund (creator missing).
    pub locked: usize,
    /// Observed non-`Open` inside the transaction; no-op.
    pub skipped: usize,
    /// Left for the next tick after exhausting retries or a backend failure.
    pub failed: usize,
}

enum SweepAction {
    Refunded { to_uid: String, amount: u64 },
    LockedExpired,
    Skipped,
}

/// Periodic job that transitions expired bounties and triggers ledger-backed
/// refunds. Each candidate settles in its own independent transaction so one
/// conflict or abort never blocks unrelated bounties.
pub struct SettlementEngine {
    store: Arc<dyn TxStore>,
    retry: RetryPolicy,
    batch_limit: usize,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    /// Sweep entry point for the external scheduler tick.
    pub async fn sweep_now(&self) -> Result<SweepReport, CoreError> {
        self.sweep(Utc::now()).await
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, CoreError> {
        let candidates = self
            .store
            .expired_open_bounties(now, self.batch_limit)
            .await?;

        let mut report = SweepReport::default();
        for bounty_id in candidates {
            report.examined += 1;
            match self.settle_bounty(&bounty_id, now).await {
                Ok(SweepAction::Refunded { to_uid, amount }) => {
                    report.refunded += 1;
                    info!(bounty_id = %bounty_id, to_uid = %to_uid, amount, "expired bounty refunded");
                }
                Ok(SweepAction::LockedExpired) => {
                    report.locked += 1;
                    info!(bounty_id = %bounty_id, "expired bounty locked without refund");
                }
                Ok(SweepAction::Skipped) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(bounty_id = %bounty_id, error = %err, "bounty settlement failed; next tick will retry");
                }
            }
        }
        Ok(report)
    }

    /// Settle one bounty in one atomic transaction: status re-check, refund
    /// entry, wallet credit, and status flip commit together or not at all.
    async fn settle_bounty(
        &self,
        bounty_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SweepAction, CoreError> {
        let key = DocKey::new(Collection::Bounties, bounty_id);

        run_with_retry(self.store.clone(), &self.retry, move |tx| {
            let key = key.clone();
            async move {
                let Some(mut bounty) = tx.get::<Bounty>(&key).await? else {
                    return Ok(SweepAction::Skipped);
                };
                // The candidate list is an outer snapshot; only this re-read
                // decides. A bounty raced out of `Open` is a no-op.
                if bounty.status != BountyStatus::Open || bounty.expires_at > now {
                    return Ok(SweepAction::Skipped);
                }

                match bounty.creator_uid.clone() {
                    None => {
                        bounty.status = BountyStatus::Expired;
                        bounty.locked_reason = Some("creator account missing".to_string());
                        tx.put(key, &bounty)?;
                        Ok(SweepAction::LockedExpired)
                    }
                    Some(creator_uid) => {
                        let amount = refund_amount(bounty.reward_total);
                        let entry = LedgerEntry::bounty_refund(
                            creator_uid.clone(),
                            amount,
                            bounty.currency,
                            bounty.id.clone(),
                            now,
                        );
                        // A refund that can never pass ledger validation is
                        // terminal; retrying it each tick would wedge a batch
                        // slot forever. Expire the bounty and record why.
                        if let Err(err) = entry.validate() {
                            bounty.status = BountyStatus::Expired;
                            bounty.locked_reason = Some(err.to_string());
                            tx.put(key, &bounty)?;
                            return Ok(SweepAction::LockedExpired);
                        }
                        Ledger::apply_entry(tx, &entry).await?;
                        bounty.status = BountyStatus::Expired;
                        tx.put(key, &bounty)?;
                        Ok(SweepAction::Refunded {
                            to_uid: creator_uid,
                            amount,
                        })
                    }
                }
            }
            .boxed()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refund_keeps_eighty_percent_floored() {
        assert_eq!(refund_amount(100), 80);
        assert_eq!(refund_amount(7), 5);
        assert_eq!(refund_amount(1), 0);
        assert_eq!(refund_amount(0), 0);
        // No overflow near the top of the range.
        assert_eq!(refund_amount(u64::MAX), (u64::MAX as u128 * 80 / 100) as u64);
    }
}
