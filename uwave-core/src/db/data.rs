use chrono::{DateTime, Utc};

/// The type used for primary keys in the database.
pub type PrimaryKey = i32;

/// A üWave account. Users are created externally; the booth only reads them.
#[derive(Debug, Clone)]
pub struct UserData {
    pub id: PrimaryKey,
    pub display_name: String,
    /// The playlist the booth plays from when this user is DJ
    pub active_playlist_id: Option<PrimaryKey>,
}

/// A user's playlist
#[derive(Debug, Clone)]
pub struct PlaylistData {
    pub id: PrimaryKey,
    pub author_id: PrimaryKey,
    pub name: String,
    /// Ordered playlist item ids. The first one is played next.
    pub item_ids: Vec<PrimaryKey>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlaylistData {
    pub fn size(&self) -> usize {
        self.item_ids.len()
    }
}

/// A single entry in a playlist, with its media record populated.
///
/// The artist, title, and trim fields start out as a copy of the media's but
/// can be edited per item without affecting the shared media record.
#[derive(Debug, Clone)]
pub struct PlaylistItemData {
    pub id: PrimaryKey,
    pub media: MediaData,
    pub artist: String,
    pub title: String,
    /// Playback start within the media, in seconds
    pub start: i32,
    /// Playback end within the media, in seconds
    pub end: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A media descriptor, unique by `(source_type, source_id)`.
/// Created lazily on first reference and immutable afterwards.
#[derive(Debug, Clone)]
pub struct MediaData {
    pub id: PrimaryKey,
    pub source_type: String,
    pub source_id: String,
    /// Total duration in seconds
    pub duration: i32,
    pub artist: String,
    pub title: String,
}

/// The media fields of a history entry, copied from the playlist item at the
/// time it was played so later edits don't rewrite history.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSnapshot {
    pub media_id: PrimaryKey,
    pub artist: String,
    pub title: String,
    pub start: i32,
    pub end: i32,
}

/// A single past or currently playing track.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntryData {
    pub id: PrimaryKey,
    pub user_id: PrimaryKey,
    pub playlist_id: PrimaryKey,
    pub item_id: PrimaryKey,
    pub media: MediaSnapshot,
    pub played_at: DateTime<Utc>,
    /// Vote tallies, attached when the entry is sealed at the following advance
    pub upvotes: Vec<PrimaryKey>,
    pub downvotes: Vec<PrimaryKey>,
    pub favorites: Vec<PrimaryKey>,
}

#[derive(Debug)]
pub struct NewPlaylist {
    pub author_id: PrimaryKey,
    pub name: String,
}

#[derive(Debug)]
pub struct UpdatedPlaylist {
    pub id: PrimaryKey,
    pub name: Option<String>,
    pub item_ids: Option<Vec<PrimaryKey>>,
}

#[derive(Debug)]
pub struct NewPlaylistItem {
    pub media_id: PrimaryKey,
    pub artist: String,
    pub title: String,
    pub start: i32,
    pub end: i32,
}

#[derive(Debug)]
pub struct UpdatedPlaylistItem {
    pub id: PrimaryKey,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub start: i32,
    pub end: i32,
}

#[derive(Debug)]
pub struct NewMedia {
    pub source_type: String,
    pub source_id: String,
    pub duration: i32,
    pub artist: String,
    pub title: String,
}

/// A history entry that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub user_id: PrimaryKey,
    pub playlist_id: PrimaryKey,
    pub item_id: PrimaryKey,
    pub media: MediaSnapshot,
}

/// The vote tallies attached to a history entry when it is sealed.
#[derive(Debug)]
pub struct SealedVotes {
    pub entry_id: PrimaryKey,
    pub upvotes: Vec<PrimaryKey>,
    pub downvotes: Vec<PrimaryKey>,
    pub favorites: Vec<PrimaryKey>,
}
