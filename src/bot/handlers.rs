use anyhow::Result;
use serenity::{
    builder::{
        CreateEmbed, CreateInteractionResponse, CreateInteractionResponseFollowup,
        CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{info, warn};

use crate::{
    audio::player::SkipOutcome,
    bot::YoutubeBot,
    ui::embeds,
};

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &YoutubeBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Command used outside of a server"))?;

    info!(
        "📝 /{} used by {} in guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, bot, guild_id).await?,
        "skip" => handle_skip(ctx, &command, bot, guild_id).await?,
        "queue" => handle_queue(ctx, &command, bot, guild_id).await?,
        "loop" => handle_loop(ctx, &command, bot, guild_id).await?,
        "stop" => handle_stop(ctx, &command, bot, guild_id).await?,
        "leave" => handle_leave(ctx, &command, bot, guild_id).await?,
        "help" => {
            let embed = embeds::create_help_embed(bot.config().embed_color);
            respond_embed(ctx, &command, embed).await?
        }
        _ => {
            if bot.config().report_command_not_found {
                respond(
                    ctx,
                    &command,
                    "Command not recognized. Type `/help` to see available commands.",
                )
                .await?;
            }
        }
    }

    Ok(())
}

// Handlers específicos para cada comando

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &YoutubeBot,
    guild_id: GuildId,
) -> Result<()> {
    let query = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "query")
        .and_then(|opt| opt.value.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing query option"))?
        .to_string();

    let Some(channel_id) = get_user_voice_channel(ctx, guild_id, command.user.id) else {
        return respond(ctx, command, "You must be in a voice channel.").await;
    };

    // La descarga puede tardar más que el plazo de respuesta
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let call = bot.join_voice_channel(ctx, guild_id, channel_id).await?;
    let guild = bot.ensure_sink(guild_id, call).await?;

    command
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new().content(format!("Downloading `{}`...", query)),
        )
        .await?;

    let track = match bot.fetcher().fetch(guild_id, &query).await {
        Ok(track) => track,
        Err(e) => {
            let message = embeds::download_error_message(&e, bot.config().report_download_errors);
            return followup(ctx, command, message).await;
        }
    };

    // A guild torn down while downloading rejects the track.
    let outcome = guild.enqueue(track.clone()).await;
    if let Err(e) = &outcome {
        warn!("⚠️ Could not queue '{}' in guild {}: {}", track.display_title(), guild_id, e);
    }
    let message = embeds::enqueue_message(&track, &outcome);

    followup(ctx, command, message).await
}

async fn handle_skip(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &YoutubeBot,
    guild_id: GuildId,
) -> Result<()> {
    if get_user_voice_channel(ctx, guild_id, command.user.id).is_none() {
        return respond(ctx, command, "You must be in a voice channel to skip.").await;
    }

    let outcome = match bot.registry().get(guild_id) {
        Some(guild) => guild.skip().await.ok(),
        None => None,
    };

    let message = match outcome {
        Some(SkipOutcome::Skipped(_)) => "Skipped the current track.",
        Some(SkipOutcome::NothingPlaying) => "No audio is currently playing.",
        None => "Nothing is playing here.",
    };
    respond(ctx, command, message).await
}

async fn handle_queue(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &YoutubeBot,
    guild_id: GuildId,
) -> Result<()> {
    let snapshot = match bot.registry().get(guild_id) {
        Some(guild) => guild.snapshot().await.ok(),
        None => None,
    };

    match snapshot {
        None => respond(ctx, command, "No queue in this server.").await,
        Some(snapshot) if snapshot.queue.is_empty() && snapshot.is_idle() => {
            respond(ctx, command, "The queue is empty.").await
        }
        Some(snapshot) => {
            let embed = embeds::create_queue_embed(&snapshot, bot.config().embed_color);
            respond_embed(ctx, command, embed).await
        }
    }
}

async fn handle_loop(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &YoutubeBot,
    guild_id: GuildId,
) -> Result<()> {
    let enabled = match bot.registry().get(guild_id) {
        Some(guild) => guild.toggle_loop().await.ok(),
        None => None,
    };

    match enabled {
        Some(enabled) => respond(ctx, command, format!("Looping is now **{}**.", enabled)).await,
        None => respond(ctx, command, "Nothing is playing here.").await,
    }
}

async fn handle_stop(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &YoutubeBot,
    guild_id: GuildId,
) -> Result<()> {
    let stopped = match bot.registry().get(guild_id) {
        Some(guild) => guild.stop().await.ok(),
        None => None,
    };

    match stopped {
        Some(_) => respond(ctx, command, "Playback stopped and queue cleared.").await,
        None => respond(ctx, command, "Nothing to stop here.").await,
    }
}

async fn handle_leave(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &YoutubeBot,
    guild_id: GuildId,
) -> Result<()> {
    // El resto de la limpieza llega con el evento de voz
    if bot.leave_voice_channel(ctx, guild_id).await? {
        respond(ctx, command, "👋 Disconnected from the voice channel.").await
    } else {
        respond(ctx, command, "I'm not in a voice channel.").await
    }
}

// Funciones auxiliares

async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    content: impl Into<String>,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(content),
            ),
        )
        .await?;
    Ok(())
}

async fn respond_embed(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;
    Ok(())
}

async fn followup(
    ctx: &Context,
    command: &CommandInteraction,
    content: impl Into<String>,
) -> Result<()> {
    command
        .create_followup(
            &ctx.http,
            CreateInteractionResponseFollowup::new().content(content),
        )
        .await?;
    Ok(())
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;

    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}
