use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

mod lock;
mod state;

pub use lock::*;
pub use state::*;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection to the store dropped or could not be established.
    /// Surfaced to the process supervisor; the process may be restarted.
    #[error("Ephemeral store is unavailable: {0}")]
    Unavailable(String),
    /// A key held a value the core cannot interpret
    #[error("Unexpected value at {key}: {value}")]
    Corrupt { key: String, value: String },
}

/// A single mutation in an atomic write sequence.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Set { key: String, value: String },
    Del { key: String },
    ListPush { key: String, value: String },
    ListPop { key: String },
    ListRemove { key: String, value: String },
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
}

/// A message observed on a pub/sub topic.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
}

/// A remote key/value store with lists, sets, atomic write batches,
/// publish/subscribe, and expiring claims.
///
/// The booth depends only on this surface; any backing store offering these
/// semantics suffices. All instances of the process must talk to the same
/// store, since every piece of live room state lives here.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn del(&self, keys: &[&str]) -> Result<(), StoreError>;

    /// Pop the head of a list, returning it
    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Append to the tail of a list
    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Remove all occurrences of a value from a list
    async fn lrem(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn lindex(&self, key: &str, index: usize) -> Result<Option<String>, StoreError>;
    async fn llen(&self, key: &str) -> Result<usize, StoreError>;
    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Apply a sequence of writes atomically. Observers never see a
    /// partially applied batch.
    async fn write(&self, batch: Vec<WriteOp>) -> Result<(), StoreError>;

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError>;
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<PublishedMessage>, StoreError>;

    /// Place a unique claim at `key` that expires after `ttl`.
    /// Returns false if someone else holds an unexpired claim.
    async fn claim(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError>;
    /// Reset a claim's expiry iff `token` still owns it
    async fn extend_claim(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
    /// Remove the claim iff `token` owns it
    async fn release_claim(&self, key: &str, token: &str) -> Result<bool, StoreError>;
    /// True if `token` still owns the claim at `key`
    async fn check_claim(&self, key: &str, token: &str) -> Result<bool, StoreError>;
}
