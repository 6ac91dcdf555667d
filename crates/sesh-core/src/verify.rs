//! Inbound check-in verification: timestamp freshness, action
//! fingerprinting, then the replay guard.

use crate::clock::{validate_timestamp, TimestampCheck};
use crate::error::CoreError;
use crate::fingerprint::action_fingerprint;
use crate::replay::{ReplayDecision, ReplayGuard};
use crate::store::TxStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Check-in action payload as sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInRequest {
    pub spot_id: String,
    pub lat: f64,
    pub lng: f64,
    /// Client-generated single-use idempotency token, fresh per attempt.
    pub nonce: String,
    /// RFC 3339 client clock reading.
    pub client_timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidTimestamp,
    StaleTimestamp,
    ReplayDetected,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl VerifyOutcome {
    fn accepted() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }
}

/// Verification entry point consumed by the check-in feature.
pub struct Verifier {
    guard: Arc<ReplayGuard>,
}

impl Verifier {
    pub fn new(store: Arc<dyn TxStore>) -> Self {
        Self::with_guard(Arc::new(ReplayGuard::new(store)))
    }

    pub fn with_guard(guard: Arc<ReplayGuard>) -> Self {
        Self { guard }
    }

    /// Validate, fingerprint, and atomically claim the nonce.
    ///
    /// A store failure propagates as an error: verification is indeterminate
    /// and the caller must not grant access.
    pub async fn verify(
        &self,
        user_id: &str,
        request: &CheckInRequest,
    ) -> Result<VerifyOutcome, CoreError> {
        match validate_timestamp(&request.client_timestamp) {
            TimestampCheck::Invalid => {
                return Ok(VerifyOutcome::rejected(RejectReason::InvalidTimestamp))
            }
            TimestampCheck::Stale => {
                return Ok(VerifyOutcome::rejected(RejectReason::StaleTimestamp))
            }
            TimestampCheck::Fresh(_) => {}
        }

        let action_hash = action_fingerprint(user_id, &request.spot_id, request.lat, request.lng);
        match self
            .guard
            .check_and_store(user_id, &request.nonce, &action_hash)
            .await?
        {
            ReplayDecision::Stored => Ok(VerifyOutcome::accepted()),
            ReplayDecision::Replay => Ok(VerifyOutcome::rejected(RejectReason::ReplayDetected)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Utc;

    fn request(nonce: &str, client_timestamp: String) -> CheckInRequest {
        CheckInRequest {
            spot_id: "42".to_string(),
            lat: 37.7749,
            lng: -122.4194,
            nonce: nonce.to_string(),
            client_timestamp,
        }
    }

    #[tokio::test]
    async fn fresh_check_in_is_accepted_then_replay_rejected() {
        let verifier = Verifier::new(Arc::new(MemoryStore::new()));
        let req = request("nonce-0001", Utc::now().to_rfc3339());

        let first = verifier.verify("u1", &req).await.unwrap();
        assert!(first.ok);
        assert!(first.reason.is_none());

        let second = verifier.verify("u1", &req).await.unwrap();
        assert!(!second.ok);
        assert_eq!(second.reason, Some(RejectReason::ReplayDetected));
    }

    #[tokio::test]
    async fn out_of_skew_timestamp_is_rejected_without_claiming_the_nonce() {
        let verifier = Verifier::new(Arc::new(MemoryStore::new()));
        let stale = (Utc::now() - chrono::Duration::seconds(600)).to_rfc3339();

        let outcome = verifier
            .verify("u1", &request("nonce-0001", stale))
            .await
            .unwrap();
        assert_eq!(outcome.reason, Some(RejectReason::StaleTimestamp));

        // The nonce was never claimed, so a fresh attempt succeeds.
        let retry = verifier
            .verify("u1", &request("nonce-0001", Utc::now().to_rfc3339()))
            .await
            .unwrap();
        assert!(retry.ok);
    }

    #[tokio::test]
    async fn unparseable_timestamp_is_invalid() {
        let verifier = Verifier::new(Arc::new(MemoryStore::new()));
        let outcome = verifier
            .verify("u1", &request("nonce-0001", "not-a-timestamp".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome.reason, Some(RejectReason::InvalidTimestamp));
    }

    #[tokio::test]
    async fn same_action_with_fresh_nonce_is_accepted() {
        let verifier = Verifier::new(Arc::new(MemoryStore::new()));

        let first = verifier
            .verify("u1", &request("nonce-0001", Utc::now().to_rfc3339()))
            .await
            .unwrap();
        let second = verifier
            .verify("u1", &request("nonce-0002", Utc::now().to_rfc3339()))
            .await
            .unwrap();
        assert!(first.ok);
        assert!(second.ok);
    }
}
