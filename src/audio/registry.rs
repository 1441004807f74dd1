use dashmap::DashMap;
use serenity::model::id::GuildId;
use tracing::{debug, info};

use super::player::{GuildHandle, GuildPlayer};

/// Live playback state of every guild, keyed by guild id.
///
/// Creation is lazy and idempotent: concurrent first requests for the same
/// guild all get the same player.
#[derive(Default)]
pub struct GuildRegistry {
    guilds: DashMap<GuildId, GuildHandle>,
}

impl GuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<GuildHandle> {
        self.guilds
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Returns the guild's player, starting one if there is none yet.
    pub fn get_or_create(&self, guild_id: GuildId) -> GuildHandle {
        let mut entry = self.guilds.entry(guild_id).or_insert_with(|| {
            debug!("Creating playback state for guild {}", guild_id);
            GuildPlayer::spawn(guild_id)
        });

        if entry.is_closed() {
            debug!("Replacing finished player for guild {}", guild_id);
            *entry = GuildPlayer::spawn(guild_id);
        }

        entry.value().clone()
    }

    /// Tears down a guild: its player stops streaming, drops its queue and
    /// connection, and exits. Returns `false` if the guild had no state.
    ///
    /// Handles obtained earlier report [`UnknownGuild`] from then on.
    ///
    /// [`UnknownGuild`]: super::player::PlaybackError::UnknownGuild
    pub async fn remove(&self, guild_id: GuildId) -> bool {
        let Some((_, handle)) = self.guilds.remove(&guild_id) else {
            return false;
        };

        handle.shutdown().await;
        info!("🧹 Playback state removed for guild {}", guild_id);
        true
    }

    pub fn len(&self) -> usize {
        self.guilds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guilds.is_empty()
    }

    pub async fn shutdown_all(&self) {
        let guilds: Vec<GuildId> = self.guilds.iter().map(|entry| *entry.key()).collect();
        let count = guilds.len();

        futures::future::join_all(guilds.into_iter().map(|guild_id| self.remove(guild_id))).await;
        info!("🛑 Shut down {} guild players", count);
    }
}
