use anyhow::Result;
use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
};
use tokio::{
    fs,
    sync::{OwnedRwLockReadGuard, RwLock},
};
use tracing::{debug, info, warn};

/// Guild-scoped media directories under one download root.
///
/// Each guild gets `<root>/<guild_id>/`, created by the first fetch and
/// removed when the guild is torn down. Fetches hold a read gate on their
/// guild while writing; removal takes the write side, so it waits for
/// downloads already in progress.
pub struct MediaStore {
    root: PathBuf,
    gates: DashMap<GuildId, Arc<RwLock<()>>>,
}

impl MediaStore {
    pub async fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        info!("📁 Media storage initialised at: {}", root.display());

        Ok(Self {
            root,
            gates: DashMap::new(),
        })
    }

    pub fn guild_dir(&self, guild_id: GuildId) -> PathBuf {
        self.root.join(guild_id.get().to_string())
    }

    /// Creates the guild directory if needed and returns its path.
    pub async fn ensure_guild_dir(&self, guild_id: GuildId) -> std::io::Result<PathBuf> {
        let dir = self.guild_dir(guild_id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Read side of the guild gate, held for the duration of a download.
    pub async fn fetch_gate(&self, guild_id: GuildId) -> OwnedRwLockReadGuard<()> {
        let gate = self.gate(guild_id);
        gate.read_owned().await
    }

    /// Removes everything stored for a guild.
    ///
    /// Waits for in-progress downloads of that guild to finish first.
    /// A missing directory is not an error.
    pub async fn remove_guild_dir(&self, guild_id: GuildId) -> std::io::Result<()> {
        let gate = self.gate(guild_id);
        let result = {
            let _exclusive = gate.write().await;

            let dir = self.guild_dir(guild_id);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    info!("🗑️ Removed media directory {}", dir.display());
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("No media directory to remove for guild {}", guild_id);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        drop(gate);

        // Fetches queued behind the write side still hold the gate; the next
        // removal must wait for them on the same lock.
        self.gates.remove_if(&guild_id, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    /// Deletes guild directories left behind by a previous run.
    ///
    /// Only entries named like a guild id are touched, so a download root
    /// shared with other files keeps them.
    pub async fn purge_stale(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let is_guild_dir = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.parse::<u64>().is_ok());
            if !is_guild_dir || !entry.file_type().await?.is_dir() {
                continue;
            }

            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("⚠️ Could not remove stale {}: {}", entry.path().display(), e),
            }
        }

        if removed > 0 {
            info!("🧹 Purged {} stale guild directories", removed);
        }
        Ok(removed)
    }

    fn gate(&self, guild_id: GuildId) -> Arc<RwLock<()>> {
        self.gates
            .entry(guild_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_guild_dir_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let store = MediaStore::new(root.path().join("dl")).await.unwrap();
        let guild = GuildId::new(1234);

        let dir = store.ensure_guild_dir(guild).await.unwrap();
        assert_eq!(dir, root.path().join("dl").join("1234"));
        tokio::fs::write(dir.join("abc.webm"), b"audio").await.unwrap();

        store.remove_guild_dir(guild).await.unwrap();
        assert!(!dir.exists());

        // Removing again is a no-op.
        store.remove_guild_dir(guild).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_only_touches_guild_dirs() {
        let root = tempfile::tempdir().unwrap();
        let store = MediaStore::new(root.path().to_path_buf()).await.unwrap();

        tokio::fs::create_dir_all(root.path().join("111")).await.unwrap();
        tokio::fs::create_dir_all(root.path().join("222")).await.unwrap();
        tokio::fs::create_dir_all(root.path().join("keep-me")).await.unwrap();
        tokio::fs::write(root.path().join("333"), b"a file").await.unwrap();

        assert_eq!(store.purge_stale().await.unwrap(), 2);
        assert!(!root.path().join("111").exists());
        assert!(root.path().join("keep-me").exists());
        assert!(root.path().join("333").exists());
    }

    #[tokio::test]
    async fn test_removal_waits_for_active_fetch() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MediaStore::new(root.path().to_path_buf()).await.unwrap());
        let guild = GuildId::new(7);

        let dir = store.ensure_guild_dir(guild).await.unwrap();
        let gate = store.fetch_gate(guild).await;

        let remover = {
            let store = store.clone();
            tokio::spawn(async move { store.remove_guild_dir(guild).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!remover.is_finished());
        assert!(dir.exists());

        drop(gate);
        remover.await.unwrap().unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_fetch_queued_behind_removal_blocks_next_removal() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MediaStore::new(root.path().to_path_buf()).await.unwrap());
        let guild = GuildId::new(8);

        let first = store.fetch_gate(guild).await;
        let first_removal = {
            let store = store.clone();
            tokio::spawn(async move { store.remove_guild_dir(guild).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // A fetch arriving mid-removal waits on the write side.
        let queued_fetch = {
            let store = store.clone();
            tokio::spawn(async move { store.fetch_gate(guild).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!queued_fetch.is_finished());

        drop(first);
        first_removal.await.unwrap().unwrap();
        let second = queued_fetch.await.unwrap();
        let dir = store.ensure_guild_dir(guild).await.unwrap();

        let second_removal = {
            let store = store.clone();
            tokio::spawn(async move { store.remove_guild_dir(guild).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second_removal.is_finished());
        assert!(dir.exists());

        drop(second);
        second_removal.await.unwrap().unwrap();
        assert!(!dir.exists());
    }
}
