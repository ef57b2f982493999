use std::{sync::Arc, time::Duration};

use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{sleep_until, Instant},
};

use crate::{
    keys, AdvancePayload, BoothEvent, Bus, Database, DatabaseError, EphemeralStore,
    HistoryEntryData, Lease, LockError, MediaSnapshot, NewHistoryEntry, PlaylistError, Playlists,
    PrimaryKey, SealedVotes, StateClient, StoreError, UserData, VoteDirection, VoteSets,
};

/// How long the advance mutex may be held before another instance is
/// allowed to take over after a crash. An advance finishes in milliseconds
/// in the happy path.
pub const LOCK_TTL: Duration = Duration::from_secs(2);

/// Upper bound on empty-playlist skips within a single advance
const MAX_SKIPS: usize = 10;

#[derive(Debug, Error)]
pub enum BoothError {
    #[error("Another advance is already in progress")]
    AdvanceInProgress,
    #[error("The advance lease was lost mid-transition")]
    LeaseLost,
    /// Handled internally by skipping the DJ; only surfaces if skipping
    /// keeps failing
    #[error("Next DJ's playlist is empty")]
    EmptyPlaylist,
    #[error("Nothing is playing right now")]
    NothingPlaying,
    #[error("User is already in the waitlist")]
    AlreadyInWaitlist,
    #[error("User is not in the waitlist")]
    NotInWaitlist,
    #[error("User is currently playing")]
    AlreadyPlaying,
    #[error(transparent)]
    Playlist(PlaylistError),
    #[error(transparent)]
    Database(DatabaseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LockError> for BoothError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Contended => Self::AdvanceInProgress,
            LockError::Lost => Self::LeaseLost,
            LockError::Store(e) => Self::Store(e),
        }
    }
}

/// Options for a single advance.
#[derive(Debug, Clone, Copy)]
pub struct AdvanceOptions {
    /// Don't re-queue the previous DJ; used to remove or replace them
    pub remove: bool,
    /// Set to false to suppress the broadcast, e.g. during maintenance
    pub publish: bool,
}

impl Default for AdvanceOptions {
    fn default() -> Self {
        Self {
            remove: false,
            publish: true,
        }
    }
}

impl AdvanceOptions {
    /// Options for booting the current DJ out of the booth
    pub fn removal() -> Self {
        Self {
            remove: true,
            publish: true,
        }
    }
}

/// An authoritative snapshot of the room: the playing entry plus the live
/// vote sets. Clients reconcile from this after missed broadcasts.
#[derive(Debug, Clone)]
pub struct BoothSnapshot {
    pub entry: HistoryEntryData,
    pub votes: VoteSets,
}

/// The booth scheduler: decides who plays next, commits the transition,
/// and drives the end-of-track timer.
///
/// All room state lives in the ephemeral store, so any number of instances
/// can run this scheduler against the same room; the advance lock decides
/// which one drives a given transition. The only in-process state is the
/// pending timer handle, which makes restarting the process safe.
pub struct Booth<S, Db> {
    store: Arc<S>,
    db: Arc<Db>,
    playlists: Arc<Playlists<Db>>,
    state: StateClient<S>,
    bus: Bus<S>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<S, Db> Booth<S, Db>
where
    S: EphemeralStore + 'static,
    Db: Database + 'static,
{
    pub fn new(store: &Arc<S>, db: &Arc<Db>, playlists: &Arc<Playlists<Db>>) -> Self {
        Self {
            store: store.clone(),
            db: db.clone(),
            playlists: playlists.clone(),
            state: StateClient::new(store),
            bus: Bus::new(store),
            timer: Default::default(),
        }
    }

    /// The history entry currently playing, if any
    pub async fn current_entry(&self) -> Result<Option<HistoryEntryData>, BoothError> {
        let Some(entry_id) = self.state.history_id().await? else {
            return Ok(None);
        };

        self.load_entry(entry_id).await
    }

    async fn load_entry(
        &self,
        entry_id: PrimaryKey,
    ) -> Result<Option<HistoryEntryData>, BoothError> {
        match self.db.history_by_id(entry_id).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.is_not_found() => {
                warn!("Current history entry {entry_id} is gone from the database");
                Ok(None)
            }
            Err(e) => Err(BoothError::Database(e)),
        }
    }

    /// The current play with its live vote tallies
    pub async fn current_booth(&self) -> Result<Option<BoothSnapshot>, BoothError> {
        let Some(entry) = self.current_entry().await? else {
            return Ok(None);
        };

        let votes = self.state.votes().await?;
        Ok(Some(BoothSnapshot { entry, votes }))
    }

    /// Advances the booth to the next DJ, or to idle when nobody can play.
    ///
    /// Only one instance at a time can run this; a concurrent caller gets
    /// [BoothError::AdvanceInProgress] and should retry after a backoff if
    /// it still wants to.
    pub async fn advance(
        &self,
        options: AdvanceOptions,
    ) -> Result<Option<HistoryEntryData>, BoothError> {
        let lease = Lease::acquire(&self.store, keys::ADVANCE_LOCK, LOCK_TTL)
            .await
            .map_err(BoothError::from)?;

        let result = self.advance_under_lease(&lease, options).await;
        lease.release().await;

        result
    }

    async fn advance_under_lease(
        &self,
        lease: &Lease<S>,
        options: AdvanceOptions,
    ) -> Result<Option<HistoryEntryData>, BoothError> {
        let previous_id = self.state.history_id().await?;
        let previous = match previous_id {
            Some(entry_id) => self.load_entry(entry_id).await?,
            None => None,
        };

        // Select the next entry, skipping DJs whose playlist turns out to
        // be empty. Every pass runs under the same lease, extended so the
        // TTL keeps covering the critical section.
        let mut remove = options.remove;
        let mut next = None;

        for attempt in 0..MAX_SKIPS {
            if attempt > 0 {
                lease.extend(LOCK_TTL).await.map_err(BoothError::from)?;
            }

            match self.next_entry(remove).await {
                Ok(entry) => {
                    next = entry;
                    break;
                }
                Err(BoothError::EmptyPlaylist) => {
                    info!("Next DJ has an empty playlist, skipping their turn");

                    if self.state.waitlist_head().await?.is_some() {
                        self.state.pop_waitlist().await?;
                    } else {
                        // The reused current DJ has nothing to play.
                        // Selecting in removal mode ends the session
                        // instead of picking them again.
                        remove = true;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Seal the previous entry with its final tallies
        if let Some(previous) = &previous {
            let votes = self.state.votes().await?;

            self.db
                .seal_history_entry(SealedVotes {
                    entry_id: previous.id,
                    upvotes: votes.upvotes,
                    downvotes: votes.downvotes,
                    favorites: votes.favorites,
                })
                .await
                .map_err(BoothError::Database)?;
        }

        let next = match next {
            Some(entry) => Some(
                self.db
                    .create_history_entry(entry)
                    .await
                    .map_err(BoothError::Database)?,
            ),
            None => {
                self.cancel_timer();
                None
            }
        };

        // Rotate the waitlist: the consumed head leaves, and a finished DJ
        // goes to the back of the line unless they are being removed. A
        // lone DJ never enters the waitlist at all.
        if self.state.waitlist_len().await? > 0 {
            self.state.pop_waitlist().await?;

            if let Some(previous) = previous.as_ref().filter(|_| !options.remove) {
                self.state.push_waitlist(previous.user_id).await?;
            }
        }

        // Terminal writes are gated on the fencing token, and on the entry
        // this transition was computed from still being current.
        if !lease.is_current().await.map_err(BoothError::Store)? {
            return Err(BoothError::LeaseLost);
        }
        if self.state.history_id().await? != previous_id {
            return Err(BoothError::LeaseLost);
        }

        if let Some(next) = &next {
            self.state.begin_play(next.id, next.user_id).await?;
            self.playlists
                .cycle(next.playlist_id)
                .await
                .map_err(BoothError::Playlist)?;
            self.arm_timer_for(next);

            info!(
                "Now playing {} - {} (entry {})",
                next.media.artist, next.media.title, next.id
            );
        } else {
            self.state.clear().await?;
            info!("Nobody can play, the booth is now idle");
        }

        if options.publish {
            self.bus
                .publish(BoothEvent::AdvanceComplete {
                    next: next.as_ref().map(AdvancePayload::from),
                })
                .await;

            if let Some(next) = &next {
                self.bus
                    .publish(BoothEvent::PlaylistCycle {
                        user_id: next.user_id,
                        playlist_id: next.playlist_id,
                    })
                    .await;
                self.bus
                    .publish(BoothEvent::UserPlay {
                        user_id: next.user_id,
                        artist: next.media.artist.clone(),
                        title: next.media.title.clone(),
                    })
                    .await;
            }

            let waitlist = self.state.waitlist().await.unwrap_or_default();
            self.bus.publish(BoothEvent::WaitlistUpdate { waitlist }).await;
        }

        Ok(next)
    }

    /// Resumes the room after a process restart. If the current track
    /// should still be playing, the timer is re-armed for the remainder;
    /// if it ended while the process was down, the room advances now.
    pub async fn recover(&self) -> Result<(), BoothError> {
        let Some(entry) = self.current_entry().await? else {
            return Ok(());
        };

        let length = (entry.media.end - entry.media.start).max(0);
        let ends_at = entry.played_at + chrono::Duration::seconds(length as i64);

        match (ends_at - Utc::now()).to_std() {
            Ok(remaining) => {
                info!(
                    "Resuming {} - {} for another {}s",
                    entry.media.artist,
                    entry.media.title,
                    remaining.as_secs()
                );
                self.arm_timer_at(Instant::now() + remaining);
            }
            // The track ended while the process was down
            Err(_) => {
                self.advance(AdvanceOptions::default()).await?;
            }
        }

        Ok(())
    }

    /// Stops the pending timer. Shared state is left untouched so another
    /// instance, or a restart, resumes from it.
    pub fn shutdown(&self) {
        self.cancel_timer();
    }

    /// Registers an up or down vote on the current play
    pub async fn cast_vote(
        &self,
        user_id: PrimaryKey,
        direction: VoteDirection,
    ) -> Result<(), BoothError> {
        if self.state.history_id().await?.is_none() {
            return Err(BoothError::NothingPlaying);
        }

        self.state.cast_vote(user_id, direction).await?;
        Ok(())
    }

    /// Toggles a favorite on the current play, returning whether it is set
    pub async fn toggle_favorite(&self, user_id: PrimaryKey) -> Result<bool, BoothError> {
        if self.state.history_id().await?.is_none() {
            return Err(BoothError::NothingPlaying);
        }

        Ok(self.state.toggle_favorite(user_id).await?)
    }

    pub async fn waitlist(&self) -> Result<Vec<PrimaryKey>, BoothError> {
        Ok(self.state.waitlist().await?)
    }

    /// Appends a user to the waitlist tail. Contends with a running
    /// advance, since both mutate the waitlist.
    pub async fn join_waitlist(&self, user_id: PrimaryKey) -> Result<Vec<PrimaryKey>, BoothError> {
        let lease = Lease::acquire(&self.store, keys::ADVANCE_LOCK, LOCK_TTL)
            .await
            .map_err(BoothError::from)?;

        let result = self.join_waitlist_locked(user_id).await;
        lease.release().await;

        let waitlist = result?;
        self.bus
            .publish(BoothEvent::WaitlistUpdate {
                waitlist: waitlist.clone(),
            })
            .await;

        Ok(waitlist)
    }

    async fn join_waitlist_locked(
        &self,
        user_id: PrimaryKey,
    ) -> Result<Vec<PrimaryKey>, BoothError> {
        // Ensure the user exists
        let _ = self.db.user_by_id(user_id).await.map_err(BoothError::Database)?;

        if self.state.current_dj().await? == Some(user_id) {
            return Err(BoothError::AlreadyPlaying);
        }

        let mut waitlist = self.state.waitlist().await?;
        if waitlist.contains(&user_id) {
            return Err(BoothError::AlreadyInWaitlist);
        }

        self.state.push_waitlist(user_id).await?;
        waitlist.push(user_id);

        Ok(waitlist)
    }

    /// Removes a user from the waitlist wherever they are
    pub async fn leave_waitlist(&self, user_id: PrimaryKey) -> Result<Vec<PrimaryKey>, BoothError> {
        let lease = Lease::acquire(&self.store, keys::ADVANCE_LOCK, LOCK_TTL)
            .await
            .map_err(BoothError::from)?;

        let result = self.leave_waitlist_locked(user_id).await;
        lease.release().await;

        let waitlist = result?;
        self.bus
            .publish(BoothEvent::WaitlistUpdate {
                waitlist: waitlist.clone(),
            })
            .await;

        Ok(waitlist)
    }

    async fn leave_waitlist_locked(
        &self,
        user_id: PrimaryKey,
    ) -> Result<Vec<PrimaryKey>, BoothError> {
        let waitlist = self.state.waitlist().await?;
        if !waitlist.contains(&user_id) {
            return Err(BoothError::NotInWaitlist);
        }

        self.state.remove_from_waitlist(user_id).await?;
        Ok(waitlist.into_iter().filter(|id| *id != user_id).collect())
    }

    /// True if an end-of-track timer is armed on this instance
    pub fn timer_armed(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|pending| !pending.is_finished())
    }

    /// Picks the user who plays next. The waitlist head wins; with an
    /// empty waitlist the current DJ plays again, unless they are being
    /// removed.
    async fn next_dj(&self, remove: bool) -> Result<Option<UserData>, BoothError> {
        let user_id = match self.state.waitlist_head().await? {
            Some(user_id) => Some(user_id),
            None if !remove => self.state.current_dj().await?,
            None => None,
        };

        let Some(user_id) = user_id else {
            return Ok(None);
        };

        match self.db.user_by_id(user_id).await {
            Ok(user) => Ok(Some(user)),
            Err(e) if e.is_not_found() => {
                warn!("Upcoming DJ {user_id} no longer exists");
                Ok(None)
            }
            Err(e) => Err(BoothError::Database(e)),
        }
    }

    /// Builds the unsaved entry for the next play, snapshotting the media
    /// fields so later playlist edits don't rewrite history.
    async fn next_entry(&self, remove: bool) -> Result<Option<NewHistoryEntry>, BoothError> {
        let Some(user) = self.next_dj(remove).await? else {
            return Ok(None);
        };

        let Some(playlist_id) = user.active_playlist_id else {
            return Ok(None);
        };

        let playlist = match self.playlists.user_playlist(user.id, playlist_id).await {
            Ok(playlist) => playlist,
            // A dangling active playlist is the same as not having one
            Err(PlaylistError::PlaylistNotFound(_)) => return Ok(None),
            Err(e) => return Err(BoothError::Playlist(e)),
        };

        if playlist.size() == 0 {
            return Err(BoothError::EmptyPlaylist);
        }

        let item = self
            .playlists
            .first_item(&playlist)
            .await
            .map_err(BoothError::Playlist)?;

        Ok(Some(NewHistoryEntry {
            user_id: user.id,
            playlist_id: playlist.id,
            item_id: item.id,
            media: MediaSnapshot {
                media_id: item.media.id,
                artist: item.artist,
                title: item.title,
                start: item.start,
                end: item.end,
            },
        }))
    }

    fn arm_timer_for(&self, entry: &HistoryEntryData) {
        let length = (entry.media.end - entry.media.start).max(0) as u64;
        self.arm_timer_at(Instant::now() + Duration::from_secs(length));
    }

    /// Arms the single end-of-track timer, replacing any pending one.
    fn arm_timer_at(&self, deadline: Instant) {
        let mut slot = self.timer.lock();

        if let Some(pending) = slot.take() {
            pending.abort();
        }

        let booth = self.clone();
        *slot = Some(tokio::spawn(async move {
            sleep_until(deadline).await;

            // Hand the slot back first: the advance below arms the next
            // timer, and aborting the stored handle would cancel this very
            // task mid-transition.
            booth.timer.lock().take();

            match booth.advance(AdvanceOptions::default()).await {
                Ok(_) => {}
                // Another instance's timer won the race; it drives the
                // transition and we pick up the new state from the store.
                Err(BoothError::AdvanceInProgress) => {}
                Err(e) => error!("Timed advance failed: {e}"),
            }
        }));
    }

    fn cancel_timer(&self) {
        if let Some(pending) = self.timer.lock().take() {
            pending.abort();
        }
    }
}

impl<S, Db> Clone for Booth<S, Db> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            db: self.db.clone(),
            playlists: self.playlists.clone(),
            state: self.state.clone(),
            bus: self.bus.clone(),
            timer: self.timer.clone(),
        }
    }
}
