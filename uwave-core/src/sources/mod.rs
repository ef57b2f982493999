use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{Database, DatabaseError, MediaData, NewMedia};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Unsupported source type: {0}")]
    UnsupportedType(String),

    #[error("Source type is supported but media was not found")]
    NotFound,

    #[error("Failed to fetch from source: {0}")]
    Fetch(String),

    #[error(transparent)]
    Database(DatabaseError),
}

/// A media descriptor returned by a source, not yet persisted
#[derive(Debug, Clone)]
pub struct FoundMedia {
    pub source_id: String,
    /// Total duration in seconds
    pub duration: i32,
    pub artist: String,
    pub title: String,
}

/// Represents an external media source (YouTube, SoundCloud, ...) that can
/// be asked for canonical media descriptors.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// The source type this adapter serves, e.g. "youtube"
    fn source_type(&self) -> &'static str;

    async fn get_one(&self, source_id: &str) -> Result<FoundMedia, SourceError>;

    /// Fetches many descriptors in one batched call.
    /// Ids the source doesn't know are left out of the result.
    async fn get(&self, source_ids: &[String]) -> Result<Vec<FoundMedia>, SourceError>;
}

/// Materializes media from external sources, persisting new descriptors
/// durably on first sight. Media is unique by `(source_type, source_id)`,
/// so a descriptor is only ever fetched once.
pub struct SourceResolver<Db> {
    db: Arc<Db>,
    adapters: HashMap<&'static str, Arc<dyn SourceAdapter>>,
}

impl<Db> SourceResolver<Db>
where
    Db: Database,
{
    pub fn new(db: &Arc<Db>) -> Self {
        Self {
            db: db.clone(),
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.source_type(), adapter);
    }

    pub async fn get_one(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> Result<MediaData, SourceError> {
        let media = self.get(source_type, &[source_id.to_string()]).await?;
        media.into_iter().next().ok_or(SourceError::NotFound)
    }

    /// Resolves a batch of ids of one source type. Known media is loaded
    /// from the durable store in a single query; the rest is fetched from
    /// the source in one batched call and persisted before returning.
    pub async fn get(
        &self,
        source_type: &str,
        source_ids: &[String],
    ) -> Result<Vec<MediaData>, SourceError> {
        let adapter = self
            .adapters
            .get(source_type)
            .ok_or_else(|| SourceError::UnsupportedType(source_type.to_string()))?;

        let mut media = self
            .db
            .media_by_source_ids(source_type, source_ids)
            .await
            .map_err(SourceError::Database)?;

        let missing: Vec<String> = source_ids
            .iter()
            .filter(|id| !media.iter().any(|m| m.source_id == **id))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let found = adapter.get(&missing).await?;

            let new_media: Vec<_> = found
                .into_iter()
                .map(|found| NewMedia {
                    source_type: source_type.to_string(),
                    source_id: found.source_id,
                    duration: found.duration,
                    artist: found.artist,
                    title: found.title,
                })
                .collect();

            let created = self
                .db
                .create_media(new_media)
                .await
                .map_err(SourceError::Database)?;

            media.extend(created);
        }

        // Callers expect the order they asked for
        media.sort_by_key(|m| source_ids.iter().position(|id| *id == m.source_id));
        Ok(media)
    }
}
