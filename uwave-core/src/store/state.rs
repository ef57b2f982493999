use std::sync::Arc;

use crate::PrimaryKey;

use super::{EphemeralStore, StoreError, WriteOp};

/// The well-known keyspace shared with other services.
pub mod keys {
    /// Id of the currently playing history entry; absent when idle
    pub const HISTORY_ID: &str = "booth:historyID";
    /// User id of the current DJ
    pub const CURRENT_DJ: &str = "booth:currentDJ";
    pub const UPVOTES: &str = "booth:upvotes";
    pub const DOWNVOTES: &str = "booth:downvotes";
    pub const FAVORITES: &str = "booth:favorites";
    /// Head is the next DJ, tail the most recently joined
    pub const WAITLIST: &str = "waitlist";
    /// The advance mutex. Holds a lease token with a short TTL.
    pub const ADVANCE_LOCK: &str = "booth:advancing";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDirection {
    Up,
    Down,
}

/// The vote sets of the current play
#[derive(Debug, Clone, Default)]
pub struct VoteSets {
    pub upvotes: Vec<PrimaryKey>,
    pub downvotes: Vec<PrimaryKey>,
    pub favorites: Vec<PrimaryKey>,
}

/// Typed operations over the booth's keys in the ephemeral store.
pub struct StateClient<S> {
    store: Arc<S>,
}

impl<S> StateClient<S>
where
    S: EphemeralStore,
{
    pub fn new(store: &Arc<S>) -> Self {
        Self {
            store: store.clone(),
        }
    }

    pub async fn history_id(&self) -> Result<Option<PrimaryKey>, StoreError> {
        self.read_id(keys::HISTORY_ID).await
    }

    pub async fn current_dj(&self) -> Result<Option<PrimaryKey>, StoreError> {
        self.read_id(keys::CURRENT_DJ).await
    }

    pub async fn votes(&self) -> Result<VoteSets, StoreError> {
        Ok(VoteSets {
            upvotes: self.read_set(keys::UPVOTES).await?,
            downvotes: self.read_set(keys::DOWNVOTES).await?,
            favorites: self.read_set(keys::FAVORITES).await?,
        })
    }

    /// Commits a new play. The vote sets are cleared in the same atomic
    /// write that assigns the new entry, so an observer that sees the new
    /// id never sees stale votes.
    pub async fn begin_play(
        &self,
        entry_id: PrimaryKey,
        dj_id: PrimaryKey,
    ) -> Result<(), StoreError> {
        self.store
            .write(vec![
                WriteOp::Del {
                    key: keys::UPVOTES.into(),
                },
                WriteOp::Del {
                    key: keys::DOWNVOTES.into(),
                },
                WriteOp::Del {
                    key: keys::FAVORITES.into(),
                },
                WriteOp::Set {
                    key: keys::HISTORY_ID.into(),
                    value: entry_id.to_string(),
                },
                WriteOp::Set {
                    key: keys::CURRENT_DJ.into(),
                    value: dj_id.to_string(),
                },
            ])
            .await
    }

    /// Empties the booth. Used when no next DJ could be found.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store
            .del(&[
                keys::HISTORY_ID,
                keys::CURRENT_DJ,
                keys::UPVOTES,
                keys::DOWNVOTES,
                keys::FAVORITES,
            ])
            .await
    }

    pub async fn waitlist(&self) -> Result<Vec<PrimaryKey>, StoreError> {
        self.store
            .lrange(keys::WAITLIST)
            .await?
            .into_iter()
            .map(|value| parse_id(keys::WAITLIST, value))
            .collect()
    }

    pub async fn waitlist_head(&self) -> Result<Option<PrimaryKey>, StoreError> {
        match self.store.lindex(keys::WAITLIST, 0).await? {
            Some(value) => parse_id(keys::WAITLIST, value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn waitlist_len(&self) -> Result<usize, StoreError> {
        self.store.llen(keys::WAITLIST).await
    }

    pub async fn pop_waitlist(&self) -> Result<Option<PrimaryKey>, StoreError> {
        match self.store.lpop(keys::WAITLIST).await? {
            Some(value) => parse_id(keys::WAITLIST, value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn push_waitlist(&self, user_id: PrimaryKey) -> Result<(), StoreError> {
        self.store
            .rpush(keys::WAITLIST, &user_id.to_string())
            .await
    }

    pub async fn remove_from_waitlist(&self, user_id: PrimaryKey) -> Result<(), StoreError> {
        self.store
            .lrem(keys::WAITLIST, &user_id.to_string())
            .await
    }

    /// Registers a vote for the current play. Changing sides removes the
    /// opposite vote in the same atomic write, so a user is a member of at
    /// most one of the two sets.
    pub async fn cast_vote(
        &self,
        user_id: PrimaryKey,
        direction: VoteDirection,
    ) -> Result<(), StoreError> {
        let (target, opposite) = match direction {
            VoteDirection::Up => (keys::UPVOTES, keys::DOWNVOTES),
            VoteDirection::Down => (keys::DOWNVOTES, keys::UPVOTES),
        };

        self.store
            .write(vec![
                WriteOp::SetRemove {
                    key: opposite.into(),
                    member: user_id.to_string(),
                },
                WriteOp::SetAdd {
                    key: target.into(),
                    member: user_id.to_string(),
                },
            ])
            .await
    }

    /// Toggles the user's favorite on the current play, returning whether
    /// it is now set. Favorites are independent of up/down votes.
    pub async fn toggle_favorite(&self, user_id: PrimaryKey) -> Result<bool, StoreError> {
        let member = user_id.to_string();
        let favorited = self
            .store
            .smembers(keys::FAVORITES)
            .await?
            .contains(&member);

        let op = if favorited {
            WriteOp::SetRemove {
                key: keys::FAVORITES.into(),
                member,
            }
        } else {
            WriteOp::SetAdd {
                key: keys::FAVORITES.into(),
                member,
            }
        };

        self.store.write(vec![op]).await?;
        Ok(!favorited)
    }

    async fn read_id(&self, key: &str) -> Result<Option<PrimaryKey>, StoreError> {
        match self.store.get(key).await? {
            Some(value) => parse_id(key, value).map(Some),
            None => Ok(None),
        }
    }

    async fn read_set(&self, key: &str) -> Result<Vec<PrimaryKey>, StoreError> {
        self.store
            .smembers(key)
            .await?
            .into_iter()
            .map(|value| parse_id(key, value))
            .collect()
    }
}

impl<S> Clone for StateClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

fn parse_id(key: &str, value: String) -> Result<PrimaryKey, StoreError> {
    value.parse().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        value,
    })
}
