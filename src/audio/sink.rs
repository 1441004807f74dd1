use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use songbird::{
    input::{File, Input},
    tracks::{PlayMode, TrackHandle},
    Call, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent,
};
use std::{path::Path, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::player::GuildCommand;

/// Identifies one started stream within a guild.
pub type StreamId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Ran to the end, or was stopped on request.
    Finished,
    Errored(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("voice connection is not established")]
    NotConnected,
    #[error("could not start stream: {0}")]
    Start(String),
}

/// One-shot completion signal for a started stream.
///
/// Clones share the same slot, so however many transport events fire for a
/// stream, only the first [`notify`](Self::notify) reaches the guild.
#[derive(Clone)]
pub struct StreamEndNotifier {
    stream: StreamId,
    slot: Arc<Mutex<Option<mpsc::UnboundedSender<GuildCommand>>>>,
}

impl StreamEndNotifier {
    pub(crate) fn new(stream: StreamId, mailbox: mpsc::UnboundedSender<GuildCommand>) -> Self {
        Self {
            stream,
            slot: Arc::new(Mutex::new(Some(mailbox))),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    /// Delivers the end of the stream to its guild.
    ///
    /// Returns `false` when this stream was already reported or the guild no
    /// longer exists.
    pub fn notify(&self, outcome: StreamOutcome) -> bool {
        let Some(mailbox) = self.slot.lock().take() else {
            return false;
        };

        mailbox
            .send(GuildCommand::StreamEnded {
                stream: self.stream,
                outcome,
            })
            .is_ok()
    }
}

/// The live outbound audio connection of one guild.
///
/// `start_stream` must arrange for `on_end` to be notified exactly once when
/// the stream finishes, errors or is stopped through [`stop`](Self::stop).
#[async_trait]
pub trait VoiceSink: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn is_streaming(&self) -> bool;

    async fn start_stream(&self, media: &Path, on_end: StreamEndNotifier) -> Result<(), SinkError>;

    async fn stop(&self);
}

/// [`VoiceSink`] backed by a songbird call.
pub struct SongbirdSink {
    guild_id: GuildId,
    call: Arc<tokio::sync::Mutex<Call>>,
    current: Mutex<Option<TrackHandle>>,
}

impl SongbirdSink {
    pub fn new(guild_id: GuildId, call: Arc<tokio::sync::Mutex<Call>>) -> Self {
        Self {
            guild_id,
            call,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl VoiceSink for SongbirdSink {
    async fn is_connected(&self) -> bool {
        self.call.lock().await.current_connection().is_some()
    }

    async fn is_streaming(&self) -> bool {
        let handle = self.current.lock().clone();
        match handle {
            Some(track) => match track.get_info().await {
                Ok(info) => matches!(info.playing, PlayMode::Play | PlayMode::Pause),
                Err(_) => false,
            },
            None => false,
        }
    }

    async fn start_stream(&self, media: &Path, on_end: StreamEndNotifier) -> Result<(), SinkError> {
        if !self.is_connected().await {
            return Err(SinkError::NotConnected);
        }

        let input: Input = File::new(media.to_path_buf()).into();
        let track = self.call.lock().await.play_only_input(input);

        let registered = [TrackEvent::End, TrackEvent::Error]
            .into_iter()
            .try_for_each(|event| {
                track.add_event(
                    Event::Track(event),
                    StreamEndHandler {
                        guild_id: self.guild_id,
                        notifier: on_end.clone(),
                    },
                )
            });

        // The track can finish before the handlers are attached, in which
        // case nothing else would ever report it.
        if let Err(e) = registered {
            warn!(
                "⚠️ Stream {} in guild {} ended before it was observed: {:?}",
                on_end.stream_id(),
                self.guild_id,
                e
            );
            on_end.notify(StreamOutcome::Errored(format!("{:?}", e)));
        }

        debug!("▶️ Streaming {} in guild {}", media.display(), self.guild_id);
        *self.current.lock() = Some(track);
        Ok(())
    }

    async fn stop(&self) {
        let current = self.current.lock().take();
        if let Some(track) = current {
            let _ = track.stop();
            info!("⏹️ Stream stopped in guild {}", self.guild_id);
        }
    }
}

/// Forwards songbird's end/error events for a track to its notifier.
struct StreamEndHandler {
    guild_id: GuildId,
    notifier: StreamEndNotifier,
}

#[async_trait]
impl VoiceEventHandler for StreamEndHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let error = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(format!("{:?}", e)),
                _ => None,
            }),
            _ => None,
        };

        let outcome = match error {
            Some(message) => {
                warn!(
                    "❌ Stream {} errored in guild {}: {}",
                    self.notifier.stream_id(),
                    self.guild_id,
                    message
                );
                StreamOutcome::Errored(message)
            }
            None => StreamOutcome::Finished,
        };

        self.notifier.notify(outcome);
        Some(Event::Cancel)
    }
}
