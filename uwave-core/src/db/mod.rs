use async_trait::async_trait;
use thiserror::Error;

mod data;
mod pg;

pub use data::*;
pub use pg::PgDatabase;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// An unknown or internal error happened with the database
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource already exists
    #[error("{resource} with {field} of value {value} already exists")]
    Conflict {
        /// The resource in question
        resource: &'static str,
        /// The field that is conflicting
        field: &'static str,
        /// The conflicting value
        value: String,
    },
    /// A resource in the database doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: String,
    },
}

impl DatabaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Represents a type that can fetch and persist üWave records
#[async_trait]
pub trait Database: Send + Sync {
    async fn user_by_id(&self, user_id: PrimaryKey) -> Result<UserData>;
    async fn set_active_playlist(
        &self,
        user_id: PrimaryKey,
        playlist_id: Option<PrimaryKey>,
    ) -> Result<()>;

    async fn playlist_by_id(&self, playlist_id: PrimaryKey) -> Result<PlaylistData>;
    async fn playlists_by_author(&self, user_id: PrimaryKey) -> Result<Vec<PlaylistData>>;
    async fn create_playlist(&self, new_playlist: NewPlaylist) -> Result<PlaylistData>;
    async fn update_playlist(&self, updated_playlist: UpdatedPlaylist) -> Result<PlaylistData>;
    async fn delete_playlist(&self, playlist_id: PrimaryKey) -> Result<()>;

    /// Fetch playlist items by id, with their media populated.
    /// Missing ids are skipped, not an error.
    async fn items_by_ids(&self, item_ids: &[PrimaryKey]) -> Result<Vec<PlaylistItemData>>;
    async fn create_items(&self, new_items: Vec<NewPlaylistItem>) -> Result<Vec<PlaylistItemData>>;
    async fn update_item(&self, updated_item: UpdatedPlaylistItem) -> Result<PlaylistItemData>;
    async fn delete_items(&self, item_ids: &[PrimaryKey]) -> Result<()>;

    async fn media_by_id(&self, media_id: PrimaryKey) -> Result<MediaData>;
    /// Fetch all known media of one source type matching the given source ids
    async fn media_by_source_ids(
        &self,
        source_type: &str,
        source_ids: &[String],
    ) -> Result<Vec<MediaData>>;
    async fn create_media(&self, new_media: Vec<NewMedia>) -> Result<Vec<MediaData>>;

    async fn history_by_id(&self, entry_id: PrimaryKey) -> Result<HistoryEntryData>;
    async fn create_history_entry(&self, new_entry: NewHistoryEntry) -> Result<HistoryEntryData>;
    /// Attach final vote tallies to an entry. Tallies are written once and
    /// never rewritten afterwards.
    async fn seal_history_entry(&self, votes: SealedVotes) -> Result<()>;
}
