use std::sync::Arc;

use log::warn;
use serde::Serialize;
use serde_json::json;

use crate::{EphemeralStore, HistoryEntryData, PrimaryKey};

/// Topic names observed by untrusted subscribers. Stable contract.
pub mod topics {
    pub const ADVANCE_COMPLETE: &str = "advance:complete";
    pub const PLAYLIST_CYCLE: &str = "playlist:cycle";
    pub const USER_PLAY: &str = "user:play";
    pub const WAITLIST_UPDATE: &str = "waitlist:update";
}

/// The `advance:complete` payload describing a new play
#[derive(Debug, Clone, Serialize)]
pub struct AdvancePayload {
    #[serde(rename = "historyID")]
    pub history_id: PrimaryKey,
    #[serde(rename = "userID")]
    pub user_id: PrimaryKey,
    #[serde(rename = "playlistID")]
    pub playlist_id: PrimaryKey,
    #[serde(rename = "itemID")]
    pub item_id: PrimaryKey,
    pub media: AdvanceMedia,
    /// Epoch milliseconds
    #[serde(rename = "playedAt")]
    pub played_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvanceMedia {
    pub media: PrimaryKey,
    pub artist: String,
    pub title: String,
    pub start: i32,
    pub end: i32,
}

impl From<&HistoryEntryData> for AdvancePayload {
    fn from(entry: &HistoryEntryData) -> Self {
        Self {
            history_id: entry.id,
            user_id: entry.user_id,
            playlist_id: entry.playlist_id,
            item_id: entry.item_id,
            media: AdvanceMedia {
                media: entry.media.media_id,
                artist: entry.media.artist.clone(),
                title: entry.media.title.clone(),
                start: entry.media.start,
                end: entry.media.end,
            },
            played_at: entry.played_at.timestamp_millis(),
        }
    }
}

/// State transitions fanned out to room observers
#[derive(Debug, Clone)]
pub enum BoothEvent {
    /// The booth advanced, to a new play or to idle
    AdvanceComplete { next: Option<AdvancePayload> },
    /// The new DJ's playlist rotated its played item to the tail
    PlaylistCycle {
        user_id: PrimaryKey,
        playlist_id: PrimaryKey,
    },
    /// A DJ started playing
    UserPlay {
        user_id: PrimaryKey,
        artist: String,
        title: String,
    },
    /// The waitlist changed
    WaitlistUpdate { waitlist: Vec<PrimaryKey> },
}

impl BoothEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::AdvanceComplete { .. } => topics::ADVANCE_COMPLETE,
            Self::PlaylistCycle { .. } => topics::PLAYLIST_CYCLE,
            Self::UserPlay { .. } => topics::USER_PLAY,
            Self::WaitlistUpdate { .. } => topics::WAITLIST_UPDATE,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::AdvanceComplete { next } => json!(next),
            Self::PlaylistCycle {
                user_id,
                playlist_id,
            } => json!({ "userID": user_id, "playlistID": playlist_id }),
            Self::UserPlay {
                user_id,
                artist,
                title,
            } => json!({ "userID": user_id, "artist": artist, "title": title }),
            Self::WaitlistUpdate { waitlist } => json!(waitlist),
        }
    }
}

/// Publish-only channel fanning out state transitions through the
/// ephemeral store's pub/sub.
pub struct Bus<S> {
    store: Arc<S>,
}

impl<S> Bus<S>
where
    S: EphemeralStore,
{
    pub fn new(store: &Arc<S>) -> Self {
        Self {
            store: store.clone(),
        }
    }

    /// Publishes an event. Failures are logged and swallowed: the durable
    /// state is authoritative and observers may refresh from it.
    pub async fn publish(&self, event: BoothEvent) {
        let topic = event.topic();
        let payload = event.payload().to_string();

        if let Err(e) = self.store.publish(topic, &payload).await {
            warn!("Failed to publish {topic}: {e}");
        }
    }
}

impl<S> Clone for Bus<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}
