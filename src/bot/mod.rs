//! # Bot Module
//!
//! Discord side of the bot: slash command registration, command handling
//! and the voice lifecycle.
//!
//! ## Architecture
//!
//! [`YoutubeBot`] implements Serenity's [`EventHandler`] trait. It owns:
//!
//! - The [`GuildRegistry`] with one playback task per active guild
//! - The [`FetchStage`] that downloads requested media with yt-dlp
//! - The [`MediaStore`] holding each guild's downloaded files
//!
//! When the bot's own voice state goes from a channel to none, the guild is
//! torn down: its player exits and its download directory is deleted.

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use songbird::Call;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::{player::GuildHandle, registry::GuildRegistry, sink::SongbirdSink},
    config::Config,
    sources::FetchStage,
    storage::MediaStore,
};

/// Main Discord event handler.
///
/// All shared state is behind [`Arc`], so the handler can be cloned into
/// spawned tasks cheaply.
pub struct YoutubeBot {
    config: Arc<Config>,
    registry: Arc<GuildRegistry>,
    fetcher: Arc<FetchStage>,
    store: Arc<MediaStore>,
}

impl YoutubeBot {
    pub fn new(
        config: Config,
        registry: Arc<GuildRegistry>,
        fetcher: Arc<FetchStage>,
        store: Arc<MediaStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            fetcher,
            store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &GuildRegistry {
        &self.registry
    }

    pub fn fetcher(&self) -> &FetchStage {
        &self.fetcher
    }

    /// Registers slash commands with Discord.
    ///
    /// Commands go to a single guild when `GUILD_ID` is set (propagates in
    /// about a second, useful for development), otherwise globally.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registering slash commands...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                commands::register_guild_commands(ctx, guild_id).await?;
                info!("✅ Guild commands registered for: {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await?;
                info!("✅ Global commands registered");
            }
        }

        Ok(())
    }

    /// Returns the guild's call, joining `channel_id` unless already connected.
    ///
    /// An existing connection is reused even if it is in another channel.
    pub async fn join_voice_channel(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<Mutex<Call>>> {
        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird not initialised"))?;

        if let Some(call) = manager.get(guild_id) {
            if call.lock().await.current_connection().is_some() {
                return Ok(call);
            }
        }

        match manager.join(guild_id, channel_id).await {
            Ok(call) => {
                info!("🔊 Connected to voice channel {} in guild {}", channel_id, guild_id);
                Ok(call)
            }
            Err(e) => {
                // The driver may still have come up even though joining
                // reported an error (e.g. already in that channel).
                warn!("⚠️ Voice join reported an error in guild {}: {:?}", guild_id, e);
                manager
                    .get(guild_id)
                    .ok_or_else(|| anyhow::anyhow!("Could not connect to the voice channel: {}", e))
            }
        }
    }

    /// Makes sure the guild's player streams into `call` and returns it.
    pub async fn ensure_sink(&self, guild_id: GuildId, call: Arc<Mutex<Call>>) -> Result<GuildHandle> {
        let guild = self.registry.get_or_create(guild_id);
        if !guild.has_connected_sink().await? {
            guild
                .attach_sink(Box::new(SongbirdSink::new(guild_id, call)))
                .await?;
        }
        Ok(guild)
    }

    pub async fn leave_voice_channel(&self, ctx: &Context, guild_id: GuildId) -> Result<bool> {
        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird not initialised"))?;

        if manager.get(guild_id).is_none() {
            return Ok(false);
        }

        manager.remove(guild_id).await?;
        info!("👋 Left voice channel in guild {}", guild_id);
        Ok(true)
    }

    /// Drops the guild's playback state, then its downloaded media.
    pub async fn teardown(&self, guild_id: GuildId) {
        self.registry.remove(guild_id).await;

        if let Err(e) = self.store.remove_guild_dir(guild_id).await {
            warn!("⚠️ Could not remove media for guild {}: {}", guild_id, e);
        }
    }

    fn log_command_error(&self, command: &str, e: &anyhow::Error) {
        if self.config.print_stack_trace {
            error!("❌ Error handling /{}: {:?}", command, e);
        } else {
            error!("❌ Error handling /{}: {}", command, e);
        }
    }
}

#[async_trait]
impl EventHandler for YoutubeBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} guilds", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("❌ Error registering commands: {:?}", e);
        }
    }

    /// Errors are logged and never crash the bot; a failed interaction shows
    /// up to the user as "This interaction failed".
    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            let name = command.data.name.clone();
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                self.log_command_error(&name, &e);
            }
        }
    }

    /// Tears the guild down when the bot itself leaves or is kicked from
    /// voice.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }

        let was_connected = old.as_ref().and_then(|o| o.channel_id).is_some();
        if !was_connected || new.channel_id.is_some() {
            return;
        }

        let Some(guild_id) = new.guild_id.or_else(|| old.and_then(|o| o.guild_id)) else {
            return;
        };

        info!("🔌 Disconnected from voice in guild {}", guild_id);
        self.teardown(guild_id).await;
        debug!("{} guilds still active", self.registry.len());
    }
}
