use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{DownloadError, MediaBackend, TrackDescriptor};
use crate::storage::MediaStore;

/// Runs blocking downloads off the async scheduler.
///
/// A semaphore caps how many downloads run at once across all guilds;
/// callers beyond the limit wait for a slot instead of failing.
pub struct FetchStage {
    backend: Arc<dyn MediaBackend>,
    store: Arc<MediaStore>,
    permits: Arc<Semaphore>,
}

impl FetchStage {
    pub fn new(backend: Arc<dyn MediaBackend>, store: Arc<MediaStore>, workers: usize) -> Self {
        Self {
            backend,
            store,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Resolves and downloads `query` into the guild's media directory.
    ///
    /// Identical queries are not coalesced; each call runs its own download.
    pub async fn fetch(
        &self,
        guild_id: GuildId,
        query: &str,
    ) -> Result<TrackDescriptor, DownloadError> {
        // Gate first: a guild waiting on its teardown must not hold a slot
        // other guilds could use.
        let _gate = self.store.fetch_gate(guild_id).await;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DownloadError::new("download pool is shut down"))?;

        let dir = self.store.ensure_guild_dir(guild_id).await.map_err(|e| {
            DownloadError::new(format!("could not prepare download directory: {}", e))
        })?;

        debug!("⬇️ Fetching '{}' for guild {}", query, guild_id);

        let backend = self.backend.clone();
        let owned_query = query.to_string();
        let target = dir.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            backend.resolve_and_download(&owned_query, &target)
        })
        .await
        .map_err(|e| DownloadError::new(format!("download worker failed: {}", e)))?
        .inspect_err(|e| warn!("❌ Download failed for '{}' in guild {}: {}", query, guild_id, e))?;

        let track = TrackDescriptor::from_metadata(metadata, &dir);
        info!(
            "✅ Downloaded '{}' -> {}",
            track.display_title(),
            track.local_path().display()
        );
        Ok(track)
    }
}
