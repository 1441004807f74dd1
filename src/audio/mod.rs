//! # Audio Module
//!
//! Per-guild playback scheduling for the bot.
//!
//! Every guild with activity owns one playback task that holds its queue,
//! the track currently playing, the loop flag and the voice connection.
//! Commands and stream completions reach the task through its mailbox and
//! are applied one at a time, so a guild never has two tracks starting at
//! once.
//!
//! ## Components
//!
//! ### [`player`] - Guild Player
//! - Advances through the queue when a stream ends
//! - Re-queues finished tracks at the tail while looping
//! - Ignores completions of streams it already retired
//!
//! ### [`queue`] - Track Queue
//! - Plain FIFO of downloaded tracks
//!
//! ### [`registry`] - Guild Registry
//! - Lazily creates one player per guild and tears it down on leave
//!
//! ### [`sink`] - Voice Sink
//! - The outbound stream abstraction, implemented over songbird
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use youtube_bot::audio::registry::GuildRegistry;
//! use serenity::all::GuildId;
//!
//! # async fn example(track: youtube_bot::sources::TrackDescriptor) -> anyhow::Result<()> {
//! let registry = GuildRegistry::new();
//! let guild = registry.get_or_create(GuildId::new(123456789));
//!
//! guild.enqueue(track).await?;
//! guild.toggle_loop().await?;
//! guild.skip().await?;
//! # Ok(())
//! # }
//! ```

pub mod player;
pub mod queue;
pub mod registry;
pub mod sink;
