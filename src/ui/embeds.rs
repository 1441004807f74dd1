use serenity::{
    all::{Colour, Timestamp},
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::{
    audio::player::{EnqueueOutcome, GuildSnapshot, PlaybackError},
    sources::{DownloadError, TrackDescriptor},
};

/// Discord rejects embed descriptions longer than this.
const DESCRIPTION_LIMIT: usize = 4096;

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 YouTube Bot";

/// Embed listing the waiting tracks, with the current one as a field.
pub fn create_queue_embed(snapshot: &GuildSnapshot, color: u32) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("Queue")
        .color(Colour::new(color));

    if !snapshot.queue.is_empty() {
        embed = embed.description(queue_description(&snapshot.queue));
    }

    if let Some(current) = &snapshot.now_playing {
        let value = match current.webpage_url() {
            Some(url) => format!("[{}]({})", track_line(current), url),
            None => track_line(current),
        };
        embed = embed.field("Now Playing", value, false);
    }

    let footer = if snapshot.loop_enabled {
        format!("🔁 Loop on • {}", STANDARD_FOOTER)
    } else {
        STANDARD_FOOTER.to_string()
    };

    embed
        .footer(CreateEmbedFooter::new(footer))
        .timestamp(Timestamp::now())
}

/// Crea un embed de ayuda general
pub fn create_help_embed(color: u32) -> CreateEmbed {
    CreateEmbed::default()
        .title("🎵 YouTube Bot - Commands")
        .color(Colour::new(color))
        .description("Plays audio from YouTube in your voice channel.")
        .field(
            "🎵 Playback",
            "• `/play <query>` - Download a URL or search term and queue it\n\
            • `/skip` - Skip the current track\n\
            • `/stop` - Stop playback and clear the queue",
            false,
        )
        .field(
            "📜 Queue",
            "• `/queue` - Show the queue\n\
            • `/loop` - Toggle looping of finished tracks",
            false,
        )
        .field("🔊 Connection", "• `/leave` - Disconnect from voice", false)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Reply to `/play` once the downloaded track has been handed to the guild.
pub fn enqueue_message(
    track: &TrackDescriptor,
    outcome: &Result<EnqueueOutcome, PlaybackError>,
) -> String {
    let title = track_line(track);
    match outcome {
        Ok(EnqueueOutcome::Started(_)) => format!("Queued: **{}**\n▶️ Now playing.", title),
        Ok(EnqueueOutcome::Queued { .. }) => format!("Queued: **{}**", title),
        Err(PlaybackError::NotConnected(_)) => format!(
            "❌ Not connected to a voice channel. **{}** will play once I'm back in one.",
            title
        ),
        Err(PlaybackError::UnknownGuild(_)) => format!(
            "❌ I was disconnected while downloading, so **{}** was not queued.",
            title
        ),
        Err(e @ PlaybackError::Unplayable { .. }) => format!("❌ {}", e),
    }
}

/// User-facing text for a failed download.
///
/// The sanitised backend message is only shown when `report` is set.
pub fn download_error_message(error: &DownloadError, report: bool) -> String {
    if report {
        format!("**Download error**: {}", error.message())
    } else {
        "Failed to download that video.".to_string()
    }
}

/// Numbered list of titles, cut short with a count of what was left out.
fn queue_description(queue: &[TrackDescriptor]) -> String {
    let mut description = String::new();

    for (i, track) in queue.iter().enumerate() {
        let line = format!("{}. {}\n", i + 1, track_line(track));
        let remaining = queue.len() - i;
        let tail = format!("…and {} more", remaining);

        if description.chars().count() + line.chars().count() + tail.chars().count()
            > DESCRIPTION_LIMIT
        {
            description.push_str(&tail);
            return description;
        }
        description.push_str(&line);
    }

    description.trim_end().to_string()
}

fn track_line(track: &TrackDescriptor) -> String {
    match track.duration() {
        Some(duration) => format!("{} `[{}]`", track.display_title(), format_duration(duration)),
        None => track.display_title().to_string(),
    }
}

/// Formatea una duración en formato legible
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
