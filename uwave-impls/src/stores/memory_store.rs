use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    sync::broadcast,
    time::Instant,
};
use uwave_core::{EphemeralStore, PublishedMessage, StoreError, WriteOp};

const CHANNEL_CAPACITY: usize = 64;

/// An in-process [EphemeralStore], for tests and single-node deployments.
///
/// Clones share the same underlying store, so multiple booth instances
/// constructed from clones of one `MemoryStore` coordinate exactly like
/// instances on different machines sharing a remote store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    tables: Mutex<Tables>,
    topics: DashMap<String, broadcast::Sender<PublishedMessage>>,
    /// Receives every message regardless of topic, in publish order
    firehose: broadcast::Sender<PublishedMessage>,
}

#[derive(Default)]
struct Tables {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    claims: HashMap<String, Claim>,
}

struct Claim {
    token: String,
    expires_at: Instant,
}

impl Claim {
    fn expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (firehose, _) = broadcast::channel(CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(StoreInner {
                tables: Default::default(),
                topics: Default::default(),
                firehose,
            }),
        }
    }

    /// Observes every topic at once, in publish order
    pub fn subscribe_all(&self) -> broadcast::Receiver<PublishedMessage> {
        self.inner.firehose.subscribe()
    }

    fn apply(tables: &mut Tables, op: WriteOp) {
        match op {
            WriteOp::Set { key, value } => {
                tables.strings.insert(key, value);
            }
            WriteOp::Del { key } => {
                tables.strings.remove(&key);
                tables.lists.remove(&key);
                tables.sets.remove(&key);
            }
            WriteOp::ListPush { key, value } => {
                tables.lists.entry(key).or_default().push_back(value);
            }
            WriteOp::ListPop { key } => {
                if let Some(list) = tables.lists.get_mut(&key) {
                    list.pop_front();
                }
            }
            WriteOp::ListRemove { key, value } => {
                if let Some(list) = tables.lists.get_mut(&key) {
                    list.retain(|entry| *entry != value);
                }
            }
            WriteOp::SetAdd { key, member } => {
                tables.sets.entry(key).or_default().insert(member);
            }
            WriteOp::SetRemove { key, member } => {
                if let Some(set) = tables.sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.tables.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .tables
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut tables = self.inner.tables.lock();

        for key in keys {
            tables.strings.remove(*key);
            tables.lists.remove(*key);
            tables.sets.remove(*key);
        }

        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .tables
            .lock()
            .lists
            .get_mut(key)
            .and_then(|list| list.pop_front()))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .tables
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if let Some(list) = self.inner.tables.lock().lists.get_mut(key) {
            list.retain(|entry| entry != value);
        }
        Ok(())
    }

    async fn lindex(&self, key: &str, index: usize) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .tables
            .lock()
            .lists
            .get(key)
            .and_then(|list| list.get(index).cloned()))
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .tables
            .lock()
            .lists
            .get(key)
            .map(|list| list.len())
            .unwrap_or_default())
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .tables
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .tables
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn write(&self, batch: Vec<WriteOp>) -> Result<(), StoreError> {
        // A single lock over the whole batch makes it atomic to observers
        let mut tables = self.inner.tables.lock();

        for op in batch {
            Self::apply(&mut tables, op);
        }

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        let message = PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };

        // Nobody listening is not an error
        if let Some(sender) = self.inner.topics.get(topic) {
            let _ = sender.send(message.clone());
        }
        let _ = self.inner.firehose.send(message);

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<broadcast::Receiver<PublishedMessage>, StoreError> {
        let sender = self
            .inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);

        Ok(sender.subscribe())
    }

    async fn claim(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut tables = self.inner.tables.lock();

        match tables.claims.get(key) {
            Some(claim) if !claim.expired() && claim.token != token => Ok(false),
            _ => {
                tables.claims.insert(
                    key.to_string(),
                    Claim {
                        token: token.to_string(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn extend_claim(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut tables = self.inner.tables.lock();

        match tables.claims.get_mut(key) {
            Some(claim) if !claim.expired() && claim.token == token => {
                claim.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut tables = self.inner.tables.lock();

        match tables.claims.get(key) {
            Some(claim) if !claim.expired() && claim.token == token => {
                tables.claims.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn check_claim(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let tables = self.inner.tables.lock();

        Ok(tables
            .claims
            .get(key)
            .is_some_and(|claim| !claim.expired() && claim.token == token))
    }
}
