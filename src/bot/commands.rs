use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{
        application::{Command, CommandOptionType},
        id::GuildId,
    },
    prelude::Context,
};

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    Command::set_global_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        skip_command(),
        queue_command(),
        loop_command(),
        stop_command(),
        leave_command(),
        help_command(),
    ]
}

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Download a video or search result and queue its audio")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "YouTube URL or search terms",
            )
            .required(true),
        )
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Skip the current track")
}

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue").description("Show the tracks waiting to play")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop").description("Toggle re-queueing of finished tracks")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Stop playback and clear the queue")
}

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Disconnect from the voice channel")
}

fn help_command() -> CreateCommand {
    CreateCommand::new("help").description("List the available commands")
}
