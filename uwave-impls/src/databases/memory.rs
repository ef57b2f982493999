use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uwave_core::{
    Database, DatabaseError, HistoryEntryData, MediaData, NewHistoryEntry, NewMedia, NewPlaylist,
    NewPlaylistItem, PlaylistData, PlaylistItemData, PrimaryKey, Result, SealedVotes,
    UpdatedPlaylist, UpdatedPlaylistItem, UserData,
};

/// A map-backed [Database], for tests and single-node development.
/// Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<DatabaseInner>,
}

#[derive(Default)]
struct DatabaseInner {
    records: Mutex<Records>,
    next_id: AtomicI32,
}

#[derive(Default)]
struct Records {
    users: HashMap<PrimaryKey, UserData>,
    playlists: HashMap<PrimaryKey, PlaylistData>,
    items: HashMap<PrimaryKey, StoredItem>,
    media: HashMap<PrimaryKey, MediaData>,
    history: HashMap<PrimaryKey, HistoryEntryData>,
}

/// Playlist items are stored with a media reference and joined on read
#[derive(Clone)]
struct StoredItem {
    id: PrimaryKey,
    media_id: PrimaryKey,
    artist: String,
    title: String,
    start: i32,
    end: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> PrimaryKey {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Users are created externally in a real deployment; this stands in
    /// for that.
    pub fn add_user(&self, display_name: &str) -> UserData {
        let user = UserData {
            id: self.next_id(),
            display_name: display_name.to_string(),
            active_playlist_id: None,
        };

        self.inner
            .records
            .lock()
            .users
            .insert(user.id, user.clone());
        user
    }

    /// Adjusts when an entry was played, to simulate plays that started in
    /// the past.
    pub fn set_played_at(&self, entry_id: PrimaryKey, played_at: DateTime<Utc>) {
        if let Some(entry) = self.inner.records.lock().history.get_mut(&entry_id) {
            entry.played_at = played_at;
        }
    }

    fn populate(records: &Records, item: &StoredItem) -> Option<PlaylistItemData> {
        let media = records.media.get(&item.media_id)?;

        Some(PlaylistItemData {
            id: item.id,
            media: media.clone(),
            artist: item.artist.clone(),
            title: item.title.clone(),
            start: item.start,
            end: item.end,
            created_at: item.created_at,
            updated_at: item.updated_at,
        })
    }
}

fn not_found(resource: &'static str, identifier: impl ToString) -> DatabaseError {
    DatabaseError::NotFound {
        resource,
        identifier: identifier.to_string(),
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn user_by_id(&self, user_id: PrimaryKey) -> Result<UserData> {
        self.inner
            .records
            .lock()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| not_found("user", user_id))
    }

    async fn set_active_playlist(
        &self,
        user_id: PrimaryKey,
        playlist_id: Option<PrimaryKey>,
    ) -> Result<()> {
        let mut records = self.inner.records.lock();

        let user = records
            .users
            .get_mut(&user_id)
            .ok_or_else(|| not_found("user", user_id))?;

        user.active_playlist_id = playlist_id;
        Ok(())
    }

    async fn playlist_by_id(&self, playlist_id: PrimaryKey) -> Result<PlaylistData> {
        self.inner
            .records
            .lock()
            .playlists
            .get(&playlist_id)
            .cloned()
            .ok_or_else(|| not_found("playlist", playlist_id))
    }

    async fn playlists_by_author(&self, user_id: PrimaryKey) -> Result<Vec<PlaylistData>> {
        let records = self.inner.records.lock();

        let mut playlists: Vec<_> = records
            .playlists
            .values()
            .filter(|playlist| playlist.author_id == user_id)
            .cloned()
            .collect();

        playlists.sort_by_key(|playlist| playlist.id);
        Ok(playlists)
    }

    async fn create_playlist(&self, new_playlist: NewPlaylist) -> Result<PlaylistData> {
        let _ = self.user_by_id(new_playlist.author_id).await?;

        let now = Utc::now();
        let playlist = PlaylistData {
            id: self.next_id(),
            author_id: new_playlist.author_id,
            name: new_playlist.name,
            item_ids: vec![],
            created_at: now,
            updated_at: now,
        };

        self.inner
            .records
            .lock()
            .playlists
            .insert(playlist.id, playlist.clone());
        Ok(playlist)
    }

    async fn update_playlist(&self, updated_playlist: UpdatedPlaylist) -> Result<PlaylistData> {
        let mut records = self.inner.records.lock();

        let playlist = records
            .playlists
            .get_mut(&updated_playlist.id)
            .ok_or_else(|| not_found("playlist", updated_playlist.id))?;

        if let Some(name) = updated_playlist.name {
            playlist.name = name;
        }
        if let Some(item_ids) = updated_playlist.item_ids {
            playlist.item_ids = item_ids;
        }
        playlist.updated_at = Utc::now();

        Ok(playlist.clone())
    }

    async fn delete_playlist(&self, playlist_id: PrimaryKey) -> Result<()> {
        let mut records = self.inner.records.lock();

        let playlist = records
            .playlists
            .remove(&playlist_id)
            .ok_or_else(|| not_found("playlist", playlist_id))?;

        for item_id in &playlist.item_ids {
            records.items.remove(item_id);
        }

        for user in records.users.values_mut() {
            if user.active_playlist_id == Some(playlist_id) {
                user.active_playlist_id = None;
            }
        }

        Ok(())
    }

    async fn items_by_ids(&self, item_ids: &[PrimaryKey]) -> Result<Vec<PlaylistItemData>> {
        let records = self.inner.records.lock();

        Ok(item_ids
            .iter()
            .filter_map(|id| records.items.get(id))
            .filter_map(|item| Self::populate(&records, item))
            .collect())
    }

    async fn create_items(&self, new_items: Vec<NewPlaylistItem>) -> Result<Vec<PlaylistItemData>> {
        let mut records = self.inner.records.lock();
        let now = Utc::now();
        let mut created = Vec::with_capacity(new_items.len());

        for new_item in &new_items {
            if !records.media.contains_key(&new_item.media_id) {
                return Err(not_found("media", new_item.media_id));
            }
        }

        for new_item in new_items {
            let item = StoredItem {
                id: self.next_id(),
                media_id: new_item.media_id,
                artist: new_item.artist,
                title: new_item.title,
                start: new_item.start,
                end: new_item.end,
                created_at: now,
                updated_at: now,
            };

            let populated = Self::populate(&records, &item).expect("media presence was checked");
            records.items.insert(item.id, item);
            created.push(populated);
        }

        Ok(created)
    }

    async fn update_item(&self, updated_item: UpdatedPlaylistItem) -> Result<PlaylistItemData> {
        let mut records = self.inner.records.lock();

        let item = records
            .items
            .get_mut(&updated_item.id)
            .ok_or_else(|| not_found("playlist item", updated_item.id))?;

        if let Some(artist) = updated_item.artist {
            item.artist = artist;
        }
        if let Some(title) = updated_item.title {
            item.title = title;
        }
        item.start = updated_item.start;
        item.end = updated_item.end;
        item.updated_at = Utc::now();

        let item = item.clone();
        Self::populate(&records, &item).ok_or_else(|| not_found("media", item.media_id))
    }

    async fn delete_items(&self, item_ids: &[PrimaryKey]) -> Result<()> {
        let mut records = self.inner.records.lock();

        for item_id in item_ids {
            records.items.remove(item_id);
        }

        Ok(())
    }

    async fn media_by_id(&self, media_id: PrimaryKey) -> Result<MediaData> {
        self.inner
            .records
            .lock()
            .media
            .get(&media_id)
            .cloned()
            .ok_or_else(|| not_found("media", media_id))
    }

    async fn media_by_source_ids(
        &self,
        source_type: &str,
        source_ids: &[String],
    ) -> Result<Vec<MediaData>> {
        let records = self.inner.records.lock();

        Ok(records
            .media
            .values()
            .filter(|media| {
                media.source_type == source_type && source_ids.contains(&media.source_id)
            })
            .cloned()
            .collect())
    }

    async fn create_media(&self, new_media: Vec<NewMedia>) -> Result<Vec<MediaData>> {
        let mut records = self.inner.records.lock();
        let mut created = Vec::with_capacity(new_media.len());

        for new_media in new_media {
            // Media is unique by source; first sight wins
            let existing = records
                .media
                .values()
                .find(|media| {
                    media.source_type == new_media.source_type
                        && media.source_id == new_media.source_id
                })
                .cloned();

            let media = match existing {
                Some(media) => media,
                None => {
                    let media = MediaData {
                        id: self.next_id(),
                        source_type: new_media.source_type,
                        source_id: new_media.source_id,
                        duration: new_media.duration,
                        artist: new_media.artist,
                        title: new_media.title,
                    };

                    records.media.insert(media.id, media.clone());
                    media
                }
            };

            created.push(media);
        }

        Ok(created)
    }

    async fn history_by_id(&self, entry_id: PrimaryKey) -> Result<HistoryEntryData> {
        self.inner
            .records
            .lock()
            .history
            .get(&entry_id)
            .cloned()
            .ok_or_else(|| not_found("history entry", entry_id))
    }

    async fn create_history_entry(&self, new_entry: NewHistoryEntry) -> Result<HistoryEntryData> {
        let entry = HistoryEntryData {
            id: self.next_id(),
            user_id: new_entry.user_id,
            playlist_id: new_entry.playlist_id,
            item_id: new_entry.item_id,
            media: new_entry.media,
            played_at: Utc::now(),
            upvotes: vec![],
            downvotes: vec![],
            favorites: vec![],
        };

        self.inner
            .records
            .lock()
            .history
            .insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn seal_history_entry(&self, votes: SealedVotes) -> Result<()> {
        let mut records = self.inner.records.lock();

        let entry = records
            .history
            .get_mut(&votes.entry_id)
            .ok_or_else(|| not_found("history entry", votes.entry_id))?;

        entry.upvotes = votes.upvotes;
        entry.downvotes = votes.downvotes;
        entry.favorites = votes.favorites;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_items_keep_requested_order() {
        let db = MemoryDatabase::new();

        let media = db
            .create_media(vec![
                NewMedia {
                    source_type: "test".into(),
                    source_id: "one".into(),
                    duration: 60,
                    artist: "a".into(),
                    title: "one".into(),
                },
                NewMedia {
                    source_type: "test".into(),
                    source_id: "two".into(),
                    duration: 60,
                    artist: "b".into(),
                    title: "two".into(),
                },
            ])
            .await
            .unwrap();

        let items = db
            .create_items(
                media
                    .iter()
                    .map(|media| NewPlaylistItem {
                        media_id: media.id,
                        artist: media.artist.clone(),
                        title: media.title.clone(),
                        start: 0,
                        end: media.duration,
                    })
                    .collect(),
            )
            .await
            .unwrap();

        let ids: Vec<_> = items.iter().rev().map(|item| item.id).collect();
        let fetched = db.items_by_ids(&ids).await.unwrap();

        assert_eq!(
            fetched.iter().map(|item| item.id).collect::<Vec<_>>(),
            ids,
            "reads come back in the order asked for"
        );
    }

    #[tokio::test]
    async fn test_media_is_unique_by_source() {
        let db = MemoryDatabase::new();

        let new = |artist: &str| NewMedia {
            source_type: "test".into(),
            source_id: "same".into(),
            duration: 60,
            artist: artist.into(),
            title: "t".into(),
        };

        let first = db.create_media(vec![new("original")]).await.unwrap();
        let second = db.create_media(vec![new("impostor")]).await.unwrap();

        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].artist, "original", "first sight wins");
    }

    #[tokio::test]
    async fn test_deleting_playlist_clears_active_references() {
        let db = MemoryDatabase::new();
        let user = db.add_user("Ana");

        let playlist = db
            .create_playlist(NewPlaylist {
                author_id: user.id,
                name: "mix".into(),
            })
            .await
            .unwrap();

        db.set_active_playlist(user.id, Some(playlist.id))
            .await
            .unwrap();
        db.delete_playlist(playlist.id).await.unwrap();

        let user = db.user_by_id(user.id).await.unwrap();
        assert_eq!(user.active_playlist_id, None);
    }
}
