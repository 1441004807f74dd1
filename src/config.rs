use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_COLOR: u32 = 0xff0000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub bot_token: String,
    pub guild_id: Option<u64>, // Registro de comandos en un solo servidor

    // yt-dlp
    pub ytdl_format: String,
    pub ytdl_binary: String,
    pub download_dir: PathBuf,
    pub fetch_workers: usize,

    // Reporting
    pub print_stack_trace: bool,
    pub report_command_not_found: bool,
    pub report_download_errors: bool,
    pub embed_color: u32,
}

impl Config {
    /// Loads `.env` (if present) and then the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Builds the configuration from any key lookup.
    ///
    /// Unset keys take their defaults. `BOT_TOKEN` is the only required one.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            bot_token: lookup("BOT_TOKEN").context("BOT_TOKEN must be set")?,
            guild_id: match lookup("GUILD_ID") {
                Some(val) if !val.trim().is_empty() => Some(
                    val.trim()
                        .parse()
                        .with_context(|| format!("GUILD_ID is not a valid id: {}", val))?,
                ),
                _ => None,
            },

            ytdl_format: var("YTDL_FORMAT", "worstaudio"),
            ytdl_binary: var("YTDL_BINARY", "yt-dlp"),
            download_dir: var("DOWNLOAD_DIR", "./dl").into(),
            fetch_workers: var("FETCH_WORKERS", "2")
                .trim()
                .parse()
                .context("FETCH_WORKERS must be a positive integer")?,

            print_stack_trace: parse_flag(&var("PRINT_STACK_TRACE", "1")),
            report_command_not_found: parse_flag(&var("BOT_REPORT_COMMAND_NOT_FOUND", "1")),
            report_download_errors: parse_flag(&var("BOT_REPORT_DL_ERROR", "0")),
            embed_color: parse_color(&var("BOT_COLOR", "ff0000")),
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - The bot token must not be blank
    /// - At least one fetch worker
    /// - A non-empty yt-dlp format selector
    pub fn validate(&self) -> Result<()> {
        if self.bot_token.trim().is_empty() {
            anyhow::bail!("BOT_TOKEN must not be empty");
        }

        if self.fetch_workers == 0 {
            anyhow::bail!("FETCH_WORKERS must be at least 1");
        }

        if self.ytdl_format.trim().is_empty() {
            anyhow::bail!("YTDL_FORMAT must not be empty");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: commands {}\n  \
            yt-dlp: {} (format {}), {} workers\n  \
            Downloads: {}\n  \
            Reporting: stack traces={}, unknown commands={}, download errors={}, color=#{:06x}",
            self.guild_id
                .map_or("global".to_string(), |id| format!("for guild {}", id)),
            self.ytdl_binary,
            self.ytdl_format,
            self.fetch_workers,
            self.download_dir.display(),
            self.print_stack_trace,
            self.report_command_not_found,
            self.report_download_errors,
            self.embed_color
        )
    }
}

/// `true`, `t` and `1` in any case are true; everything else is false.
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "t" | "1")
}

/// Parses a hex colour such as `ff0000` or `#1db954`.
///
/// Falls back to [`DEFAULT_COLOR`] with a warning.
pub fn parse_color(value: &str) -> u32 {
    let hex = value.trim().trim_start_matches('#');
    match u32::from_str_radix(hex, 16) {
        Ok(color) if hex.len() <= 6 => color,
        _ => {
            warn!(
                "⚠️ Invalid BOT_COLOR '{}', using default #{:06x}",
                value, DEFAULT_COLOR
            );
            DEFAULT_COLOR
        }
    }
}
