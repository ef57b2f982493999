use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, prelude::FromRow, query, query_as, query_scalar, PgPool};

use super::{
    Database, DatabaseError, HistoryEntryData, MediaData, MediaSnapshot, NewHistoryEntry, NewMedia,
    NewPlaylist, NewPlaylistItem, PlaylistData, PlaylistItemData, PrimaryKey, Result, SealedVotes,
    UpdatedPlaylist, UpdatedPlaylistItem, UserData,
};

/// A postgres database implementation for üWave
pub struct PgDatabase {
    pool: PgPool,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id SERIAL PRIMARY KEY,
    display_name TEXT NOT NULL,
    active_playlist_id INT
);
CREATE TABLE IF NOT EXISTS media (
    id SERIAL PRIMARY KEY,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    duration INT NOT NULL,
    artist TEXT NOT NULL,
    title TEXT NOT NULL,
    UNIQUE (source_type, source_id)
);
CREATE TABLE IF NOT EXISTS playlists (
    id SERIAL PRIMARY KEY,
    author_id INT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    item_ids INT[] NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS playlist_items (
    id SERIAL PRIMARY KEY,
    media_id INT NOT NULL REFERENCES media (id),
    artist TEXT NOT NULL,
    title TEXT NOT NULL,
    start_at INT NOT NULL,
    end_at INT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS history_entries (
    id SERIAL PRIMARY KEY,
    user_id INT NOT NULL,
    playlist_id INT NOT NULL,
    item_id INT NOT NULL,
    media_id INT NOT NULL,
    artist TEXT NOT NULL,
    title TEXT NOT NULL,
    start_at INT NOT NULL,
    end_at INT NOT NULL,
    played_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    upvotes INT[] NOT NULL DEFAULT '{}',
    downvotes INT[] NOT NULL DEFAULT '{}',
    favorites INT[] NOT NULL DEFAULT '{}'
);
";

impl PgDatabase {
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::Internal(Box::new(e)))?;

        Ok(Self { pool })
    }

    /// Ensures all tables exist. Safe to call on every startup.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| e.any())?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            query(statement).execute(&mut *tx).await.map_err(|e| e.any())?;
        }

        tx.commit().await.map_err(|e| e.any())
    }
}

#[derive(FromRow)]
struct UserRow {
    id: PrimaryKey,
    display_name: String,
    active_playlist_id: Option<PrimaryKey>,
}

#[derive(FromRow)]
struct PlaylistRow {
    id: PrimaryKey,
    author_id: PrimaryKey,
    name: String,
    item_ids: Vec<PrimaryKey>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A playlist item joined with its media record
#[derive(FromRow)]
struct ItemRow {
    id: PrimaryKey,
    artist: String,
    title: String,
    start_at: i32,
    end_at: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    media_id: PrimaryKey,
    media_source_type: String,
    media_source_id: String,
    media_duration: i32,
    media_artist: String,
    media_title: String,
}

#[derive(FromRow)]
struct MediaRow {
    id: PrimaryKey,
    source_type: String,
    source_id: String,
    duration: i32,
    artist: String,
    title: String,
}

#[derive(FromRow)]
struct HistoryRow {
    id: PrimaryKey,
    user_id: PrimaryKey,
    playlist_id: PrimaryKey,
    item_id: PrimaryKey,
    media_id: PrimaryKey,
    artist: String,
    title: String,
    start_at: i32,
    end_at: i32,
    played_at: DateTime<Utc>,
    upvotes: Vec<PrimaryKey>,
    downvotes: Vec<PrimaryKey>,
    favorites: Vec<PrimaryKey>,
}

const ITEM_COLUMNS: &str = "
    playlist_items.id,
    playlist_items.artist,
    playlist_items.title,
    playlist_items.start_at,
    playlist_items.end_at,
    playlist_items.created_at,
    playlist_items.updated_at,
    media.id AS media_id,
    media.source_type AS media_source_type,
    media.source_id AS media_source_id,
    media.duration AS media_duration,
    media.artist AS media_artist,
    media.title AS media_title
";

impl From<UserRow> for UserData {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            display_name: row.display_name,
            active_playlist_id: row.active_playlist_id,
        }
    }
}

impl From<PlaylistRow> for PlaylistData {
    fn from(row: PlaylistRow) -> Self {
        Self {
            id: row.id,
            author_id: row.author_id,
            name: row.name,
            item_ids: row.item_ids,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl From<ItemRow> for PlaylistItemData {
    fn from(row: ItemRow) -> Self {
        Self {
            id: row.id,
            artist: row.artist,
            title: row.title,
            start: row.start_at,
            end: row.end_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            media: MediaData {
                id: row.media_id,
                source_type: row.media_source_type,
                source_id: row.media_source_id,
                duration: row.media_duration,
                artist: row.media_artist,
                title: row.media_title,
            },
        }
    }
}

impl From<MediaRow> for MediaData {
    fn from(row: MediaRow) -> Self {
        Self {
            id: row.id,
            source_type: row.source_type,
            source_id: row.source_id,
            duration: row.duration,
            artist: row.artist,
            title: row.title,
        }
    }
}

impl From<HistoryRow> for HistoryEntryData {
    fn from(row: HistoryRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            playlist_id: row.playlist_id,
            item_id: row.item_id,
            media: MediaSnapshot {
                media_id: row.media_id,
                artist: row.artist,
                title: row.title,
                start: row.start_at,
                end: row.end_at,
            },
            played_at: row.played_at,
            upvotes: row.upvotes,
            downvotes: row.downvotes,
            favorites: row.favorites,
        }
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn user_by_id(&self, user_id: PrimaryKey) -> Result<UserData> {
        query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map(Into::into)
            .map_err(|e| e.not_found_or("user", user_id))
    }

    async fn set_active_playlist(
        &self,
        user_id: PrimaryKey,
        playlist_id: Option<PrimaryKey>,
    ) -> Result<()> {
        // Ensure user exists
        let _ = self.user_by_id(user_id).await?;

        query("UPDATE users SET active_playlist_id = $1 WHERE id = $2")
            .bind(playlist_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn playlist_by_id(&self, playlist_id: PrimaryKey) -> Result<PlaylistData> {
        query_as::<_, PlaylistRow>("SELECT * FROM playlists WHERE id = $1")
            .bind(playlist_id)
            .fetch_one(&self.pool)
            .await
            .map(Into::into)
            .map_err(|e| e.not_found_or("playlist", playlist_id))
    }

    async fn playlists_by_author(&self, user_id: PrimaryKey) -> Result<Vec<PlaylistData>> {
        query_as::<_, PlaylistRow>("SELECT * FROM playlists WHERE author_id = $1 ORDER BY id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map(|rows| rows.into_iter().map(Into::into).collect())
            .map_err(|e| e.any())
    }

    async fn create_playlist(&self, new_playlist: NewPlaylist) -> Result<PlaylistData> {
        // Ensure author exists
        let _ = self.user_by_id(new_playlist.author_id).await?;

        query_as::<_, PlaylistRow>(
            "INSERT INTO playlists (author_id, name) VALUES ($1, $2) RETURNING *",
        )
        .bind(new_playlist.author_id)
        .bind(new_playlist.name)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.any())
    }

    async fn update_playlist(&self, updated_playlist: UpdatedPlaylist) -> Result<PlaylistData> {
        let playlist = self.playlist_by_id(updated_playlist.id).await?;

        query_as::<_, PlaylistRow>(
            "UPDATE playlists SET name = $1, item_ids = $2, updated_at = now()
             WHERE id = $3 RETURNING *",
        )
        .bind(updated_playlist.name.unwrap_or(playlist.name))
        .bind(updated_playlist.item_ids.unwrap_or(playlist.item_ids))
        .bind(updated_playlist.id)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.any())
    }

    async fn delete_playlist(&self, playlist_id: PrimaryKey) -> Result<()> {
        let playlist = self.playlist_by_id(playlist_id).await?;

        let mut tx = self.pool.begin().await.map_err(|e| e.any())?;

        query("UPDATE users SET active_playlist_id = NULL WHERE active_playlist_id = $1")
            .bind(playlist_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.any())?;

        query("DELETE FROM playlist_items WHERE id = ANY($1)")
            .bind(&playlist.item_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.any())?;

        query("DELETE FROM playlists WHERE id = $1")
            .bind(playlist_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.any())?;

        tx.commit().await.map_err(|e| e.any())
    }

    async fn items_by_ids(&self, item_ids: &[PrimaryKey]) -> Result<Vec<PlaylistItemData>> {
        let rows = query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM playlist_items
             INNER JOIN media ON playlist_items.media_id = media.id
             WHERE playlist_items.id = ANY($1)"
        ))
        .bind(item_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())?;

        let mut items: Vec<PlaylistItemData> = rows.into_iter().map(Into::into).collect();

        // The database returns rows in arbitrary order
        items.sort_by_key(|item| item_ids.iter().position(|id| *id == item.id));
        Ok(items)
    }

    async fn create_items(&self, new_items: Vec<NewPlaylistItem>) -> Result<Vec<PlaylistItemData>> {
        let mut tx = self.pool.begin().await.map_err(|e| e.any())?;
        let mut ids = Vec::with_capacity(new_items.len());

        for item in new_items {
            let id: PrimaryKey = query_scalar(
                "INSERT INTO playlist_items (media_id, artist, title, start_at, end_at)
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
            )
            .bind(item.media_id)
            .bind(item.artist)
            .bind(item.title)
            .bind(item.start)
            .bind(item.end)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| e.any())?;

            ids.push(id);
        }

        tx.commit().await.map_err(|e| e.any())?;
        self.items_by_ids(&ids).await
    }

    async fn update_item(&self, updated_item: UpdatedPlaylistItem) -> Result<PlaylistItemData> {
        let result = query(
            "UPDATE playlist_items
             SET artist = COALESCE($1, artist),
                 title = COALESCE($2, title),
                 start_at = $3,
                 end_at = $4,
                 updated_at = now()
             WHERE id = $5",
        )
        .bind(updated_item.artist)
        .bind(updated_item.title)
        .bind(updated_item.start)
        .bind(updated_item.end)
        .bind(updated_item.id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                resource: "playlist item",
                identifier: updated_item.id.to_string(),
            });
        }

        let mut items = self.items_by_ids(&[updated_item.id]).await?;
        items.pop().ok_or(DatabaseError::NotFound {
            resource: "playlist item",
            identifier: updated_item.id.to_string(),
        })
    }

    async fn delete_items(&self, item_ids: &[PrimaryKey]) -> Result<()> {
        query("DELETE FROM playlist_items WHERE id = ANY($1)")
            .bind(item_ids)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn media_by_id(&self, media_id: PrimaryKey) -> Result<MediaData> {
        query_as::<_, MediaRow>("SELECT * FROM media WHERE id = $1")
            .bind(media_id)
            .fetch_one(&self.pool)
            .await
            .map(Into::into)
            .map_err(|e| e.not_found_or("media", media_id))
    }

    async fn media_by_source_ids(
        &self,
        source_type: &str,
        source_ids: &[String],
    ) -> Result<Vec<MediaData>> {
        query_as::<_, MediaRow>("SELECT * FROM media WHERE source_type = $1 AND source_id = ANY($2)")
            .bind(source_type)
            .bind(source_ids)
            .fetch_all(&self.pool)
            .await
            .map(|rows| rows.into_iter().map(Into::into).collect())
            .map_err(|e| e.any())
    }

    async fn create_media(&self, new_media: Vec<NewMedia>) -> Result<Vec<MediaData>> {
        let mut tx = self.pool.begin().await.map_err(|e| e.any())?;
        let mut created = Vec::with_capacity(new_media.len());

        for media in new_media {
            let row = query_as::<_, MediaRow>(
                "INSERT INTO media (source_type, source_id, duration, artist, title)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (source_type, source_id) DO UPDATE SET source_type = EXCLUDED.source_type
                 RETURNING *",
            )
            .bind(media.source_type)
            .bind(media.source_id)
            .bind(media.duration)
            .bind(media.artist)
            .bind(media.title)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| e.any())?;

            created.push(row.into());
        }

        tx.commit().await.map_err(|e| e.any())?;
        Ok(created)
    }

    async fn history_by_id(&self, entry_id: PrimaryKey) -> Result<HistoryEntryData> {
        query_as::<_, HistoryRow>("SELECT * FROM history_entries WHERE id = $1")
            .bind(entry_id)
            .fetch_one(&self.pool)
            .await
            .map(Into::into)
            .map_err(|e| e.not_found_or("history entry", entry_id))
    }

    async fn create_history_entry(&self, new_entry: NewHistoryEntry) -> Result<HistoryEntryData> {
        query_as::<_, HistoryRow>(
            "INSERT INTO history_entries
                 (user_id, playlist_id, item_id, media_id, artist, title, start_at, end_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(new_entry.user_id)
        .bind(new_entry.playlist_id)
        .bind(new_entry.item_id)
        .bind(new_entry.media.media_id)
        .bind(new_entry.media.artist)
        .bind(new_entry.media.title)
        .bind(new_entry.media.start)
        .bind(new_entry.media.end)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.any())
    }

    async fn seal_history_entry(&self, votes: SealedVotes) -> Result<()> {
        let result = query(
            "UPDATE history_entries SET upvotes = $1, downvotes = $2, favorites = $3 WHERE id = $4",
        )
        .bind(votes.upvotes)
        .bind(votes.downvotes)
        .bind(votes.favorites)
        .bind(votes.entry_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                resource: "history entry",
                identifier: votes.entry_id.to_string(),
            });
        }

        Ok(())
    }
}

trait IntoDatabaseError {
    fn any(self) -> DatabaseError;
    fn not_found_or(self, resource: &'static str, identifier: impl ToString) -> DatabaseError;
}

impl IntoDatabaseError for sqlx::Error {
    fn any(self) -> DatabaseError {
        DatabaseError::Internal(Box::new(self))
    }

    fn not_found_or(self, resource: &'static str, identifier: impl ToString) -> DatabaseError {
        match self {
            sqlx::Error::RowNotFound => DatabaseError::NotFound {
                resource,
                identifier: identifier.to_string(),
            },
            e => e.any(),
        }
    }
}
