use thiserror::Error;

/// Verification/settlement core errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("invalid ledger entry: {0}")]
    InvalidEntry(String),

    #[error("invalid bounty: {0}")]
    InvalidBounty(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Transactional store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A read-stamped document changed between read and commit.
    #[error("transaction conflict")]
    Conflict,

    #[error("transaction retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for failures that are safe to retry on the next request or tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::RetriesExhausted { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl CoreError {
    /// Callers must treat a retryable failure as "verification indeterminate",
    /// never as a grant.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}
