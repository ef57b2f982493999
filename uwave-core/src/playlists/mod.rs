use std::{collections::HashMap, fmt, sync::Arc};

use log::error;
use rand::seq::SliceRandom;
use rand::thread_rng;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    Database, DatabaseError, NewPlaylist, NewPlaylistItem, PlaylistData, PlaylistItemData,
    PrimaryKey, SourceError, SourceResolver, UpdatedPlaylist, UpdatedPlaylistItem,
};

mod page;
pub use page::*;

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("Playlist {0} does not exist")]
    PlaylistNotFound(PrimaryKey),
    #[error("Playlist item {0} does not exist")]
    ItemNotFound(PrimaryKey),
    #[error("Playlist has no items")]
    Empty,
    #[error("{0}")]
    BadRequest(String),
    #[error("Could not save playlist items")]
    PersistFailure,
    #[error(transparent)]
    Source(SourceError),
    #[error(transparent)]
    Database(DatabaseError),
}

/// A source id may come over the wire as a string or a number
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SourceId {
    Text(String),
    Number(i64),
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(number) => write!(f, "{number}"),
        }
    }
}

/// A new item described by its external source
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItemInput {
    pub source_type: String,
    #[serde(rename = "sourceID")]
    pub source_id: SourceId,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub start: Option<i32>,
    pub end: Option<i32>,
}

/// Input to [Playlists::add_items]: either an already known media record,
/// or an entity to resolve from an external source.
#[derive(Debug, Clone)]
pub enum PlaylistItemRef {
    ById(PrimaryKey),
    ByEntity(PlaylistItemInput),
}

#[derive(Debug, Default)]
pub struct PlaylistPatch {
    pub name: Option<String>,
}

#[derive(Debug, Default)]
pub struct PlaylistItemPatch {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub start: Option<i32>,
    pub end: Option<i32>,
}

/// The result of a bulk insert
#[derive(Debug)]
pub struct AddedItems {
    pub added: Vec<PlaylistItemData>,
    /// The item the new ones were inserted after; None means the head
    pub after_id: Option<PrimaryKey>,
    pub playlist_size: usize,
}

/// CRUD over playlists and their ordered item lists. The booth asks this
/// repository for a user's active playlist and its first item.
pub struct Playlists<Db> {
    db: Arc<Db>,
    resolver: SourceResolver<Db>,
}

impl<Db> Playlists<Db>
where
    Db: Database,
{
    pub fn new(db: &Arc<Db>, resolver: SourceResolver<Db>) -> Self {
        Self {
            db: db.clone(),
            resolver,
        }
    }

    pub async fn playlist(&self, playlist_id: PrimaryKey) -> Result<PlaylistData, PlaylistError> {
        self.db
            .playlist_by_id(playlist_id)
            .await
            .map_err(|e| not_found_playlist(e, playlist_id))
    }

    /// A playlist that must be owned by the given user. Someone else's
    /// playlist is reported as missing, not as forbidden.
    pub async fn user_playlist(
        &self,
        user_id: PrimaryKey,
        playlist_id: PrimaryKey,
    ) -> Result<PlaylistData, PlaylistError> {
        let playlist = self.playlist(playlist_id).await?;

        if playlist.author_id != user_id {
            return Err(PlaylistError::PlaylistNotFound(playlist_id));
        }

        Ok(playlist)
    }

    pub async fn user_playlists(
        &self,
        user_id: PrimaryKey,
    ) -> Result<Vec<PlaylistData>, PlaylistError> {
        self.db
            .playlists_by_author(user_id)
            .await
            .map_err(PlaylistError::Database)
    }

    pub async fn create_playlist(
        &self,
        user_id: PrimaryKey,
        name: String,
    ) -> Result<PlaylistData, PlaylistError> {
        if name.trim().is_empty() {
            return Err(PlaylistError::BadRequest("Playlist name is required".into()));
        }

        self.db
            .create_playlist(NewPlaylist {
                author_id: user_id,
                name,
            })
            .await
            .map_err(PlaylistError::Database)
    }

    pub async fn update_playlist(
        &self,
        playlist_id: PrimaryKey,
        patch: PlaylistPatch,
    ) -> Result<PlaylistData, PlaylistError> {
        // Ensure playlist exists
        let _ = self.playlist(playlist_id).await?;

        self.db
            .update_playlist(UpdatedPlaylist {
                id: playlist_id,
                name: patch.name,
                item_ids: None,
            })
            .await
            .map_err(PlaylistError::Database)
    }

    /// Puts the playlist's items in a random order
    pub async fn shuffle_playlist(
        &self,
        playlist_id: PrimaryKey,
    ) -> Result<PlaylistData, PlaylistError> {
        let playlist = self.playlist(playlist_id).await?;

        let mut item_ids = playlist.item_ids;
        item_ids.shuffle(&mut thread_rng());

        self.persist_order(playlist_id, item_ids).await
    }

    pub async fn delete_playlist(&self, playlist_id: PrimaryKey) -> Result<(), PlaylistError> {
        // Ensure playlist exists
        let _ = self.playlist(playlist_id).await?;

        self.db
            .delete_playlist(playlist_id)
            .await
            .map_err(PlaylistError::Database)
    }

    /// Marks a playlist as the one the booth plays from when its owner is
    /// DJ. Fails as missing when the user doesn't own it.
    pub async fn activate_playlist(
        &self,
        user_id: PrimaryKey,
        playlist_id: PrimaryKey,
    ) -> Result<(), PlaylistError> {
        let _ = self.user_playlist(user_id, playlist_id).await?;

        self.db
            .set_active_playlist(user_id, Some(playlist_id))
            .await
            .map_err(PlaylistError::Database)
    }

    /// Bulk-inserts items contiguously after the given item, or at the head
    /// when `after` is None or no longer in the playlist. Known media is
    /// deduplicated; unknown media is resolved per source type in one
    /// batched call and persisted.
    pub async fn add_items(
        &self,
        playlist_id: PrimaryKey,
        items: Vec<PlaylistItemRef>,
        after: Option<PrimaryKey>,
    ) -> Result<AddedItems, PlaylistError> {
        let playlist = self.playlist(playlist_id).await?;

        for item in &items {
            validate_item_ref(item)?;
        }

        let media_by_source = self.resolve_media(&items).await?;

        let mut new_items = Vec::with_capacity(items.len());
        for item in &items {
            new_items.push(self.to_new_item(item, &media_by_source).await?);
        }

        let added = self
            .db
            .create_items(new_items)
            .await
            .map_err(|e| {
                error!("Bulk item save failed: {e}");
                PlaylistError::PersistFailure
            })?;

        let mut item_ids = playlist.item_ids;
        let after_id = after.filter(|a| item_ids.contains(a));
        insert_after(&mut item_ids, added.iter().map(|i| i.id).collect(), after_id);

        let playlist = self.persist_order(playlist_id, item_ids).await?;

        Ok(AddedItems {
            added,
            after_id,
            playlist_size: playlist.size(),
        })
    }

    /// Moves the given items (in the order given) to sit contiguously after
    /// `after`, or at the head. Ids not in the playlist are ignored.
    pub async fn move_items(
        &self,
        playlist_id: PrimaryKey,
        item_ids: Vec<PrimaryKey>,
        after: Option<PrimaryKey>,
    ) -> Result<PlaylistData, PlaylistError> {
        let playlist = self.playlist(playlist_id).await?;

        let moving: Vec<PrimaryKey> = item_ids
            .into_iter()
            .filter(|id| playlist.item_ids.contains(id))
            .collect();

        let mut order: Vec<PrimaryKey> = playlist
            .item_ids
            .into_iter()
            .filter(|id| !moving.contains(id))
            .collect();

        let after_id = after.filter(|a| order.contains(a));
        insert_after(&mut order, moving, after_id);

        self.persist_order(playlist_id, order).await
    }

    /// Removes items from the playlist and deletes their records.
    /// Only items actually in the playlist are touched.
    pub async fn remove_items(
        &self,
        playlist_id: PrimaryKey,
        item_ids: &[PrimaryKey],
    ) -> Result<PlaylistData, PlaylistError> {
        let playlist = self.playlist(playlist_id).await?;

        let removing: Vec<PrimaryKey> = item_ids
            .iter()
            .copied()
            .filter(|id| playlist.item_ids.contains(id))
            .collect();

        let order: Vec<PrimaryKey> = playlist
            .item_ids
            .into_iter()
            .filter(|id| !removing.contains(id))
            .collect();

        let playlist = self.persist_order(playlist_id, order).await?;

        self.db
            .delete_items(&removing)
            .await
            .map_err(PlaylistError::Database)?;

        Ok(playlist)
    }

    /// A filtered, paginated view of a playlist's items. The filter is a
    /// case-insensitive literal substring over artist and title; matches
    /// keep their original order.
    pub async fn items(
        &self,
        playlist_id: PrimaryKey,
        filter: Option<&str>,
        pagination: Pagination,
    ) -> Result<Page<PlaylistItemData>, PlaylistError> {
        let playlist = self.playlist(playlist_id).await?;
        let total = playlist.size();

        let mut items = self
            .db
            .items_by_ids(&playlist.item_ids)
            .await
            .map_err(PlaylistError::Database)?;

        let filtered = match filter {
            Some(filter) => {
                let matcher = filter_matcher(filter)?;
                items.retain(|item| {
                    matcher.is_match(&item.artist) || matcher.is_match(&item.title)
                });
                Some(items.len())
            }
            None => None,
        };

        let window: Vec<_> = items
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .collect();

        Ok(Page {
            items: window,
            offset: pagination.offset,
            page_size: pagination.limit,
            total,
            filtered,
        })
    }

    pub async fn item(&self, item_id: PrimaryKey) -> Result<PlaylistItemData, PlaylistError> {
        let mut items = self
            .db
            .items_by_ids(&[item_id])
            .await
            .map_err(PlaylistError::Database)?;

        items.pop().ok_or(PlaylistError::ItemNotFound(item_id))
    }

    /// Updates an item's labels and trim. Start and end are re-clamped to
    /// the bounds of the media before persisting.
    pub async fn update_item(
        &self,
        item_id: PrimaryKey,
        patch: PlaylistItemPatch,
    ) -> Result<PlaylistItemData, PlaylistError> {
        let item = self.item(item_id).await?;

        let (start, end) = clamp_range(
            patch.start.or(Some(item.start)),
            patch.end.or(Some(item.end)),
            item.media.duration,
        );

        self.db
            .update_item(UpdatedPlaylistItem {
                id: item_id,
                artist: patch.artist,
                title: patch.title,
                start,
                end,
            })
            .await
            .map_err(PlaylistError::Database)
    }

    /// The item the booth plays when this playlist's owner becomes DJ
    pub async fn first_item(
        &self,
        playlist: &PlaylistData,
    ) -> Result<PlaylistItemData, PlaylistError> {
        let head = *playlist.item_ids.first().ok_or(PlaylistError::Empty)?;

        self.item(head).await
    }

    /// Moves the head item to the tail after it has been played
    pub async fn cycle(&self, playlist_id: PrimaryKey) -> Result<PlaylistData, PlaylistError> {
        let playlist = self.playlist(playlist_id).await?;

        let mut item_ids = playlist.item_ids;
        if !item_ids.is_empty() {
            item_ids.rotate_left(1);
        }

        self.persist_order(playlist_id, item_ids).await
    }

    async fn persist_order(
        &self,
        playlist_id: PrimaryKey,
        item_ids: Vec<PrimaryKey>,
    ) -> Result<PlaylistData, PlaylistError> {
        self.db
            .update_playlist(UpdatedPlaylist {
                id: playlist_id,
                name: None,
                item_ids: Some(item_ids),
            })
            .await
            .map_err(PlaylistError::Database)
    }

    /// Resolves all media the inputs refer to, grouped per source type so
    /// each type costs one store query and at most one source call.
    async fn resolve_media(
        &self,
        items: &[PlaylistItemRef],
    ) -> Result<HashMap<(String, String), PrimaryKey>, PlaylistError> {
        let mut by_type: HashMap<&str, Vec<String>> = HashMap::new();

        for item in items {
            if let PlaylistItemRef::ByEntity(input) = item {
                let ids = by_type.entry(input.source_type.as_str()).or_default();
                let id = input.source_id.to_string();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        let mut resolved = HashMap::new();
        for (source_type, source_ids) in by_type {
            let media = self
                .resolver
                .get(source_type, &source_ids)
                .await
                .map_err(PlaylistError::Source)?;

            for media in media {
                resolved.insert((media.source_type.clone(), media.source_id.clone()), media.id);
            }
        }

        Ok(resolved)
    }

    async fn to_new_item(
        &self,
        item: &PlaylistItemRef,
        media_by_source: &HashMap<(String, String), PrimaryKey>,
    ) -> Result<NewPlaylistItem, PlaylistError> {
        match item {
            PlaylistItemRef::ById(media_id) => {
                let media = self.db.media_by_id(*media_id).await.map_err(|e| {
                    if e.is_not_found() {
                        PlaylistError::BadRequest(format!("Unknown media {media_id}"))
                    } else {
                        PlaylistError::Database(e)
                    }
                })?;

                Ok(NewPlaylistItem {
                    media_id: media.id,
                    artist: media.artist.clone(),
                    title: media.title.clone(),
                    start: 0,
                    end: media.duration,
                })
            }
            PlaylistItemRef::ByEntity(input) => {
                let key = (input.source_type.clone(), input.source_id.to_string());
                let media_id = *media_by_source.get(&key).ok_or_else(|| {
                    PlaylistError::BadRequest(format!(
                        "Could not resolve {}:{}",
                        input.source_type, input.source_id
                    ))
                })?;

                let media = self
                    .db
                    .media_by_id(media_id)
                    .await
                    .map_err(PlaylistError::Database)?;

                let (start, end) = clamp_range(input.start, input.end, media.duration);

                Ok(NewPlaylistItem {
                    media_id,
                    artist: input.artist.clone().unwrap_or_else(|| media.artist.clone()),
                    title: input.title.clone().unwrap_or_else(|| media.title.clone()),
                    start,
                    end,
                })
            }
        }
    }
}

fn not_found_playlist(e: DatabaseError, playlist_id: PrimaryKey) -> PlaylistError {
    if e.is_not_found() {
        PlaylistError::PlaylistNotFound(playlist_id)
    } else {
        PlaylistError::Database(e)
    }
}

fn validate_item_ref(item: &PlaylistItemRef) -> Result<(), PlaylistError> {
    let PlaylistItemRef::ByEntity(input) = item else {
        return Ok(());
    };

    if input.source_type.trim().is_empty() {
        return Err(PlaylistError::BadRequest("sourceType is required".into()));
    }

    if let SourceId::Text(text) = &input.source_id {
        if text.trim().is_empty() {
            return Err(PlaylistError::BadRequest("sourceID is required".into()));
        }
    }

    Ok(())
}

/// Splices `ids` into `order` directly after `after`, or at the head when
/// there is no anchor.
fn insert_after(order: &mut Vec<PrimaryKey>, ids: Vec<PrimaryKey>, after: Option<PrimaryKey>) {
    let index = after
        .and_then(|a| order.iter().position(|id| *id == a))
        .map(|i| i + 1)
        .unwrap_or(0);

    order.splice(index..index, ids);
}

/// Clamps an item's playback range to the bounds of its media: start falls
/// back to 0, end to the media duration, and end never precedes start.
fn clamp_range(start: Option<i32>, end: Option<i32>, duration: i32) -> (i32, i32) {
    let start = match start {
        Some(start) if start > 0 => start.min(duration),
        _ => 0,
    };

    // A missing, zero, or too-large end means "play to the end"; anything
    // else is kept, clamped between start and the duration.
    let end = match end {
        None | Some(0) => duration,
        Some(end) if end > duration => duration,
        Some(end) => end.max(start),
    };

    (start, end)
}

/// Case-insensitive literal substring matcher. The needle is escaped, so
/// caller input cannot smuggle in pattern syntax.
fn filter_matcher(filter: &str) -> Result<Regex, PlaylistError> {
    RegexBuilder::new(&regex::escape(filter))
        .case_insensitive(true)
        .build()
        .map_err(|e| PlaylistError::BadRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_range() {
        assert_eq!(clamp_range(None, None, 300), (0, 300));
        assert_eq!(clamp_range(Some(-5), Some(0), 300), (0, 300));
        assert_eq!(clamp_range(Some(30), Some(90), 300), (30, 90));
        assert_eq!(clamp_range(Some(30), Some(9000), 300), (30, 300));
        assert_eq!(clamp_range(Some(90), Some(30), 300), (90, 90), "end never precedes start");
        assert_eq!(clamp_range(Some(9000), None, 300), (300, 300));
        // A negative end is not "play to the end": it clamps up to start
        assert_eq!(clamp_range(Some(30), Some(-5), 300), (30, 30));
        assert_eq!(clamp_range(None, Some(-5), 300), (0, 0));
    }

    #[test]
    fn test_insert_after() {
        let mut order = vec![1, 2, 3];
        insert_after(&mut order, vec![8, 9], Some(2));
        assert_eq!(order, vec![1, 2, 8, 9, 3]);

        let mut order = vec![1, 2, 3];
        insert_after(&mut order, vec![8, 9], None);
        assert_eq!(order, vec![8, 9, 1, 2, 3], "no anchor inserts at the head");
    }

    #[test]
    fn test_filter_matcher_is_literal() {
        let matcher = filter_matcher("a.c (remix)").unwrap();

        assert!(matcher.is_match("A.C (Remix) [radio edit]"));
        assert!(!matcher.is_match("abc remix"), "dot must not be a wildcard");
    }

    #[test]
    fn test_source_id_display() {
        assert_eq!(SourceId::Text("dQw4w9WgXcQ".into()).to_string(), "dQw4w9WgXcQ");
        assert_eq!(SourceId::Number(1989).to_string(), "1989");
    }
}
