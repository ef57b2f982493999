use std::{sync::Arc, time::Duration};

use log::warn;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use thiserror::Error;

use super::{EphemeralStore, StoreError};

#[derive(Debug, Error)]
pub enum LockError {
    /// Someone else holds the lock
    #[error("Lock is held by another instance")]
    Contended,
    /// The lease expired or was taken over mid-critical-section
    #[error("Lease is no longer current")]
    Lost,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Exclusive ownership of a named distributed lock for a bounded interval.
///
/// The fencing token is a random value unique to this lease; every store
/// operation on the lock key is gated on it, so a stale holder whose lease
/// expired cannot release or extend a lock it no longer owns.
pub struct Lease<S> {
    store: Arc<S>,
    key: String,
    token: String,
}

impl<S> Lease<S>
where
    S: EphemeralStore,
{
    /// Attempts to take the lock, failing with [LockError::Contended] if an
    /// unexpired lease is already in place.
    pub async fn acquire(store: &Arc<S>, key: &str, ttl: Duration) -> Result<Self, LockError> {
        let token = fencing_token();

        if store.claim(key, &token, ttl).await? {
            Ok(Self {
                store: store.clone(),
                key: key.to_string(),
                token,
            })
        } else {
            Err(LockError::Contended)
        }
    }

    /// Resets the expiry, failing with [LockError::Lost] if the lease
    /// already expired.
    pub async fn extend(&self, ttl: Duration) -> Result<(), LockError> {
        if self.store.extend_claim(&self.key, &self.token, ttl).await? {
            Ok(())
        } else {
            Err(LockError::Lost)
        }
    }

    /// True if this lease still owns the lock
    pub async fn is_current(&self) -> Result<bool, StoreError> {
        self.store.check_claim(&self.key, &self.token).await
    }

    /// Releases the lock. Failing to release is non-fatal since the TTL
    /// cleans up eventually, so errors are only logged.
    pub async fn release(self) {
        match self.store.release_claim(&self.key, &self.token).await {
            Ok(released) => {
                if !released {
                    warn!("Lease on {} had already expired when released", self.key);
                }
            }
            Err(e) => warn!("Failed to release lease on {}: {e}", self.key),
        }
    }
}

/// An opaque value no other holder can guess. Collisions would let two
/// instances believe they own the same lease, so it errs on the long side.
fn fencing_token() -> String {
    thread_rng()
        .sample_iter(Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}
