//! Authorized-client persistence.
//!
//! Records are keyed by [`ClientKey`] and carry a `version` bumped on every
//! write. [`AuthorizedClientStore::replace`] only succeeds against the version
//! the caller read, so a stale refresh can never clobber a newer token pair.

mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::session::types::{ClientKey, TokenPair};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by an [`AuthorizedClientStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no authorized client for {0}")]
    NotFound(ClientKey),

    #[error("authorized client {key} changed concurrently (expected version {expected}, found {found})")]
    Conflict {
        key: ClientKey,
        expected: u64,
        found: u64,
    },

    #[error("SQL request failed: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("stored authorized client is corrupted: {0}")]
    Corrupted(String),
}

/// Stored association between a login and its current token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedClient {
    pub key: ClientKey,
    pub tokens: TokenPair,
    pub version: u64,
}

/// Persistence of authorized clients.
#[async_trait]
pub trait AuthorizedClientStore: Send + Sync {
    /// Read the record for `key`.
    async fn load(&self, key: &ClientKey) -> Result<Option<AuthorizedClient>>;

    /// Create or overwrite the record for `key`. Returns the new version.
    ///
    /// Called by the login layer; the session manager never creates records.
    async fn save(&self, key: &ClientKey, tokens: TokenPair) -> Result<u64>;

    /// Overwrite the record for `key` if it is still at `expected_version`.
    /// Returns the new version.
    async fn replace(
        &self,
        key: &ClientKey,
        expected_version: u64,
        tokens: TokenPair,
    ) -> Result<u64>;
}
