//! Backing-store adapters for the verification/settlement core.
//!
//! The production backend keeps every document in one PostgreSQL table and
//! runs commits as SERIALIZABLE transactions, so read-stamp validation plus
//! predicate conflicts surface as [`StoreError::Conflict`] exactly like the
//! in-memory backend. Higher layers depend only on the `TxStore` contract.

#![deny(unsafe_code)]

pub mod postgres;

pub use postgres::PostgresStore;

use sesh_core::{MemoryStore, StoreError, TxStore};
use std::sync::Arc;

/// Backend selection, resolved once at service bootstrap.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Process-local store for tests and local development.
    Memory,
    /// Durable PostgreSQL-backed store.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }

    /// Construct the configured backend. The Postgres path connects and
    /// bootstraps the schema before returning.
    pub async fn bootstrap(self) -> Result<Arc<dyn TxStore>, StoreError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryStore::new())),
            Self::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                Ok(Arc::new(store))
            }
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}
