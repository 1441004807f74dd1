use serenity::model::id::GuildId;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{
    queue::TrackQueue,
    sink::{SinkError, StreamEndNotifier, StreamId, StreamOutcome, VoiceSink},
};
use crate::sources::TrackDescriptor;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlaybackError {
    /// No live voice connection to stream into. The track stays queued.
    #[error("not connected to a voice channel in guild {0}")]
    NotConnected(GuildId),
    /// The guild has no live state; there is nothing to do.
    #[error("no playback state for guild {0}")]
    UnknownGuild(GuildId),
    #[error("could not play '{title}': {message}")]
    Unplayable { title: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// The guild was idle and this track is now playing.
    Started(TrackDescriptor),
    /// Waiting behind the current track, at this 1-based position.
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipOutcome {
    Skipped(TrackDescriptor),
    NothingPlaying,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopOutcome {
    pub stopped: Option<TrackDescriptor>,
    pub dropped: usize,
}

/// Point-in-time view of a guild, for display.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GuildSnapshot {
    pub now_playing: Option<TrackDescriptor>,
    pub queue: Vec<TrackDescriptor>,
    pub loop_enabled: bool,
}

impl GuildSnapshot {
    pub fn is_idle(&self) -> bool {
        self.now_playing.is_none()
    }
}

/// Intents processed, one at a time, by a guild's player task.
pub(crate) enum GuildCommand {
    AttachSink {
        sink: Box<dyn VoiceSink>,
        reply: oneshot::Sender<()>,
    },
    SinkConnected {
        reply: oneshot::Sender<bool>,
    },
    Enqueue {
        track: TrackDescriptor,
        reply: oneshot::Sender<Result<EnqueueOutcome, PlaybackError>>,
    },
    Skip {
        reply: oneshot::Sender<SkipOutcome>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
    ToggleLoop {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<GuildSnapshot>,
    },
    StreamEnded {
        stream: StreamId,
        outcome: StreamOutcome,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable address of a guild's player task.
///
/// Every method is a request to the task; once the guild has been torn down
/// they all fail with [`PlaybackError::UnknownGuild`].
#[derive(Clone)]
pub struct GuildHandle {
    guild_id: GuildId,
    tx: mpsc::UnboundedSender<GuildCommand>,
}

impl GuildHandle {
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Hands the guild its voice connection, replacing any previous one.
    pub async fn attach_sink(&self, sink: Box<dyn VoiceSink>) -> Result<(), PlaybackError> {
        self.request(|reply| GuildCommand::AttachSink { sink, reply })
            .await
    }

    pub async fn has_connected_sink(&self) -> Result<bool, PlaybackError> {
        self.request(|reply| GuildCommand::SinkConnected { reply })
            .await
    }

    pub async fn enqueue(&self, track: TrackDescriptor) -> Result<EnqueueOutcome, PlaybackError> {
        self.request(|reply| GuildCommand::Enqueue { track, reply })
            .await?
    }

    pub async fn skip(&self) -> Result<SkipOutcome, PlaybackError> {
        self.request(|reply| GuildCommand::Skip { reply }).await
    }

    pub async fn stop(&self) -> Result<StopOutcome, PlaybackError> {
        self.request(|reply| GuildCommand::Stop { reply }).await
    }

    /// Flips loop mode and returns the new value.
    pub async fn toggle_loop(&self) -> Result<bool, PlaybackError> {
        self.request(|reply| GuildCommand::ToggleLoop { reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<GuildSnapshot, PlaybackError> {
        self.request(|reply| GuildCommand::Snapshot { reply })
            .await
    }

    /// Stops playback, drops all state and ends the task.
    pub(crate) async fn shutdown(&self) {
        if self
            .request(|reply| GuildCommand::Shutdown { reply })
            .await
            .is_err()
        {
            debug!("Guild {} was already shut down", self.guild_id);
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> GuildCommand,
    ) -> Result<T, PlaybackError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| PlaybackError::UnknownGuild(self.guild_id))?;
        response
            .await
            .map_err(|_| PlaybackError::UnknownGuild(self.guild_id))
    }
}

struct ActiveStream {
    id: StreamId,
    track: TrackDescriptor,
}

enum Advance {
    Started(TrackDescriptor),
    Idle,
}

/// Playback state of one guild, owned by its task.
///
/// All mutations arrive through the mailbox, so enqueue, skip, stop and
/// stream completions are applied strictly one after another.
pub(crate) struct GuildPlayer {
    guild_id: GuildId,
    queue: TrackQueue,
    now_playing: Option<ActiveStream>,
    loop_enabled: bool,
    sink: Option<Box<dyn VoiceSink>>,
    last_stream: StreamId,
    mailbox: mpsc::WeakUnboundedSender<GuildCommand>,
}

impl GuildPlayer {
    /// Starts the task for a guild and returns its handle.
    pub(crate) fn spawn(guild_id: GuildId) -> GuildHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let player = Self {
            guild_id,
            queue: TrackQueue::new(),
            now_playing: None,
            loop_enabled: false,
            sink: None,
            last_stream: 0,
            mailbox: tx.downgrade(),
        };

        tokio::spawn(player.run(rx));
        GuildHandle { guild_id, tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<GuildCommand>) {
        info!("🎛️ Player started for guild {}", self.guild_id);

        let mut shutdown_ack = None;
        while let Some(command) = rx.recv().await {
            match command {
                GuildCommand::AttachSink { sink, reply } => {
                    self.attach_sink(sink).await;
                    let _ = reply.send(());
                }
                GuildCommand::SinkConnected { reply } => {
                    let connected = match &self.sink {
                        Some(sink) => sink.is_connected().await,
                        None => false,
                    };
                    let _ = reply.send(connected);
                }
                GuildCommand::Enqueue { track, reply } => {
                    let _ = reply.send(self.enqueue(track).await);
                }
                GuildCommand::Skip { reply } => {
                    let _ = reply.send(self.skip().await);
                }
                GuildCommand::Stop { reply } => {
                    let _ = reply.send(self.stop().await);
                }
                GuildCommand::ToggleLoop { reply } => {
                    self.loop_enabled = !self.loop_enabled;
                    info!("🔁 Loop {} in guild {}", self.loop_enabled, self.guild_id);
                    let _ = reply.send(self.loop_enabled);
                }
                GuildCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                GuildCommand::StreamEnded { stream, outcome } => {
                    self.on_stream_ended(stream, outcome).await;
                }
                GuildCommand::Shutdown { reply } => {
                    self.stop().await;
                    self.sink = None;
                    shutdown_ack = Some(reply);
                    break;
                }
            }
        }

        // Handles must already see a closed mailbox when shutdown returns.
        drop(rx);
        info!("👋 Player stopped for guild {}", self.guild_id);
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    async fn attach_sink(&mut self, sink: Box<dyn VoiceSink>) {
        if let Some(previous) = self.sink.replace(sink) {
            if let Some(active) = self.now_playing.take() {
                warn!(
                    "⚠️ Voice connection replaced in guild {} while playing '{}'",
                    self.guild_id,
                    active.track.display_title()
                );
                previous.stop().await;
            }
        }
        debug!("🔊 Voice sink attached in guild {}", self.guild_id);

        // Tracks left waiting without a connection start on the new one.
        if self.now_playing.is_none() && !self.queue.is_empty() {
            if let Err(e) = self.advance(None).await {
                warn!("⚠️ Could not resume playback in guild {}: {}", self.guild_id, e);
            }
        }
    }

    async fn enqueue(&mut self, track: TrackDescriptor) -> Result<EnqueueOutcome, PlaybackError> {
        let position = self.queue.push(track);
        info!(
            "➕ Queued at position {} in guild {} ({} waiting)",
            position,
            self.guild_id,
            self.queue.len()
        );

        if self.now_playing.is_some() {
            return Ok(EnqueueOutcome::Queued { position });
        }

        match self.advance(None).await? {
            Advance::Started(track) => Ok(EnqueueOutcome::Started(track)),
            Advance::Idle => Ok(EnqueueOutcome::Queued { position: 0 }),
        }
    }

    /// Retires the finished track and starts the next one, or idles.
    ///
    /// With loop on, `last` goes to the tail first, behind anything users
    /// queued while it played. Tracks the sink refuses are dropped and the
    /// next one is tried; losing the connection puts the popped track back.
    async fn advance(&mut self, last: Option<TrackDescriptor>) -> Result<Advance, PlaybackError> {
        if self.loop_enabled {
            if let Some(track) = last {
                debug!("🔁 Re-queueing '{}'", track.display_title());
                self.queue.push(track);
            }
        }

        let mut failure = None;
        loop {
            let Some(track) = self.queue.pop() else {
                self.now_playing = None;
                info!("📭 Queue empty, guild {} is idle", self.guild_id);
                return match failure {
                    Some(err) => Err(err),
                    None => Ok(Advance::Idle),
                };
            };

            match self.start(&track).await {
                Ok(id) => {
                    info!(
                        "🎵 Now playing '{}' in guild {}",
                        track.display_title(),
                        self.guild_id
                    );
                    self.now_playing = Some(ActiveStream {
                        id,
                        track: track.clone(),
                    });
                    return Ok(Advance::Started(track));
                }
                Err(err @ PlaybackError::Unplayable { .. }) => {
                    warn!("⏭️ Dropping track in guild {}: {}", self.guild_id, err);
                    failure = Some(err);
                }
                Err(err) => {
                    self.queue.push_front(track);
                    self.now_playing = None;
                    return Err(err);
                }
            }
        }
    }

    async fn start(&mut self, track: &TrackDescriptor) -> Result<StreamId, PlaybackError> {
        let mailbox = self
            .mailbox
            .upgrade()
            .ok_or(PlaybackError::UnknownGuild(self.guild_id))?;

        self.last_stream += 1;
        let stream = self.last_stream;

        let sink = self
            .sink
            .as_ref()
            .ok_or(PlaybackError::NotConnected(self.guild_id))?;

        if !sink.is_connected().await {
            return Err(PlaybackError::NotConnected(self.guild_id));
        }

        sink.start_stream(track.local_path(), StreamEndNotifier::new(stream, mailbox))
            .await
            .map_err(|e| match e {
                SinkError::NotConnected => PlaybackError::NotConnected(self.guild_id),
                SinkError::Start(message) => PlaybackError::Unplayable {
                    title: track.display_title().to_string(),
                    message,
                },
            })?;

        Ok(stream)
    }

    async fn on_stream_ended(&mut self, stream: StreamId, outcome: StreamOutcome) {
        let is_current = self.now_playing.as_ref().is_some_and(|a| a.id == stream);
        if !is_current {
            debug!("Ignoring end of retired stream {} in guild {}", stream, self.guild_id);
            return;
        }

        if let StreamOutcome::Errored(message) = &outcome {
            warn!("⚠️ Playback error in guild {}: {}", self.guild_id, message);
        }

        if self.sink.is_none() {
            return;
        }

        let finished = self.now_playing.take().map(|a| a.track);
        if let Err(e) = self.advance(finished).await {
            error!("❌ Could not start next track in guild {}: {}", self.guild_id, e);
        }
    }

    /// Stops the current stream; its completion drives the next advance.
    async fn skip(&mut self) -> SkipOutcome {
        let Some(active) = &self.now_playing else {
            return SkipOutcome::NothingPlaying;
        };
        let skipped = active.track.clone();

        // A stream that already ended has its completion in the mailbox.
        if let Some(sink) = &self.sink {
            if sink.is_streaming().await {
                sink.stop().await;
            }
        }

        info!("⏭️ Skipped '{}' in guild {}", skipped.display_title(), self.guild_id);
        SkipOutcome::Skipped(skipped)
    }

    /// Clears the queue and retires the current stream before stopping it,
    /// so its completion finds nothing to loop or play.
    async fn stop(&mut self) -> StopOutcome {
        let dropped = self.queue.clear();
        let stopped = self.now_playing.take().map(|a| a.track);

        if stopped.is_some() {
            if let Some(sink) = &self.sink {
                sink.stop().await;
            }
        }

        info!(
            "⏹️ Stopped guild {} ({} queued tracks dropped)",
            self.guild_id, dropped
        );
        StopOutcome { stopped, dropped }
    }

    fn snapshot(&self) -> GuildSnapshot {
        GuildSnapshot {
            now_playing: self.now_playing.as_ref().map(|a| a.track.clone()),
            queue: self.queue.to_vec(),
            loop_enabled: self.loop_enabled,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashSet,
        path::{Path, PathBuf},
        sync::Arc,
    };

    pub(crate) fn track(id: &str) -> TrackDescriptor {
        TrackDescriptor::new(id, Some(id.to_uppercase()), PathBuf::from(format!("/dl/{}.webm", id)))
    }

    #[derive(Default)]
    struct FakeSinkState {
        connected: bool,
        started: Vec<PathBuf>,
        active: Option<StreamEndNotifier>,
        stops: usize,
        broken: HashSet<PathBuf>,
    }

    /// In-memory sink; the test decides when streams end.
    #[derive(Clone, Default)]
    pub(crate) struct FakeSink(Arc<Mutex<FakeSinkState>>);

    impl FakeSink {
        pub(crate) fn connected() -> Self {
            let sink = Self::default();
            sink.0.lock().connected = true;
            sink
        }

        fn set_connected(&self, connected: bool) {
            self.0.lock().connected = connected;
        }

        fn mark_broken(&self, id: &str) {
            self.0.lock().broken.insert(track(id).local_path().to_path_buf());
        }

        /// Ids of every stream started so far, in order.
        pub(crate) fn played(&self) -> Vec<String> {
            self.0
                .lock()
                .started
                .iter()
                .map(|p| p.file_stem().unwrap().to_string_lossy().into_owned())
                .collect()
        }

        fn stops(&self) -> usize {
            self.0.lock().stops
        }

        fn end_current(&self, outcome: StreamOutcome) -> bool {
            let active = self.0.lock().active.take();
            active.map(|n| n.notify(outcome)).unwrap_or(false)
        }

        pub(crate) fn finish(&self) -> bool {
            self.end_current(StreamOutcome::Finished)
        }
    }

    #[async_trait]
    impl VoiceSink for FakeSink {
        async fn is_connected(&self) -> bool {
            self.0.lock().connected
        }

        async fn is_streaming(&self) -> bool {
            self.0.lock().active.is_some()
        }

        async fn start_stream(
            &self,
            media: &Path,
            on_end: StreamEndNotifier,
        ) -> Result<(), SinkError> {
            let mut state = self.0.lock();
            if !state.connected {
                return Err(SinkError::NotConnected);
            }
            if state.broken.contains(media) {
                return Err(SinkError::Start("unsupported codec".into()));
            }
            state.started.push(media.to_path_buf());
            state.active = Some(on_end);
            Ok(())
        }

        async fn stop(&self) {
            let active = {
                let mut state = self.0.lock();
                state.stops += 1;
                state.active.take()
            };
            // Stopping reports completion through the normal path.
            if let Some(notifier) = active {
                notifier.notify(StreamOutcome::Finished);
            }
        }
    }

    async fn guild_with_sink() -> (GuildHandle, FakeSink) {
        let handle = GuildPlayer::spawn(GuildId::new(1));
        let sink = FakeSink::connected();
        handle.attach_sink(Box::new(sink.clone())).await.unwrap();
        (handle, sink)
    }

    fn playing_id(snapshot: &GuildSnapshot) -> Option<String> {
        snapshot.now_playing.as_ref().map(|t| t.id().to_string())
    }

    fn queued_ids(snapshot: &GuildSnapshot) -> Vec<String> {
        snapshot.queue.iter().map(|t| t.id().to_string()).collect()
    }

    fn assert_invariants(snapshot: &GuildSnapshot) {
        if let Some(current) = &snapshot.now_playing {
            assert!(!snapshot.queue.iter().any(|t| t == current));
        }
    }

    #[tokio::test]
    async fn test_tracks_play_in_enqueue_order() {
        let (guild, sink) = guild_with_sink().await;

        assert_eq!(
            guild.enqueue(track("a")).await.unwrap(),
            EnqueueOutcome::Started(track("a"))
        );
        assert_eq!(
            guild.enqueue(track("b")).await.unwrap(),
            EnqueueOutcome::Queued { position: 1 }
        );
        assert_eq!(
            guild.enqueue(track("c")).await.unwrap(),
            EnqueueOutcome::Queued { position: 2 }
        );

        for _ in 0..3 {
            assert_invariants(&guild.snapshot().await.unwrap());
            assert!(sink.finish());
        }

        let snapshot = guild.snapshot().await.unwrap();
        assert!(snapshot.is_idle());
        assert!(snapshot.queue.is_empty());
        assert_eq!(sink.played(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_loop_cycles_queue() {
        let (guild, sink) = guild_with_sink().await;
        assert!(guild.toggle_loop().await.unwrap());
        guild.enqueue(track("a")).await.unwrap();
        guild.enqueue(track("b")).await.unwrap();

        for _ in 0..5 {
            assert!(sink.finish());
            assert_invariants(&guild.snapshot().await.unwrap());
        }

        assert_eq!(sink.played(), vec!["a", "b", "a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_loop_does_not_jump_new_arrivals() {
        let (guild, sink) = guild_with_sink().await;
        guild.toggle_loop().await.unwrap();
        guild.enqueue(track("a")).await.unwrap();
        guild.enqueue(track("b")).await.unwrap();

        sink.finish();

        let snapshot = guild.snapshot().await.unwrap();
        assert_eq!(playing_id(&snapshot), Some("b".to_string()));
        assert_eq!(queued_ids(&snapshot), vec!["a"]);

        guild.enqueue(track("c")).await.unwrap();
        sink.finish();

        let snapshot = guild.snapshot().await.unwrap();
        assert_eq!(playing_id(&snapshot), Some("a".to_string()));
        assert_eq!(queued_ids(&snapshot), vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_stop_while_playing_lands_idle() {
        let (guild, sink) = guild_with_sink().await;
        guild.toggle_loop().await.unwrap();
        for id in ["x", "a", "b", "c"] {
            guild.enqueue(track(id)).await.unwrap();
        }

        let outcome = guild.stop().await.unwrap();
        assert_eq!(outcome.stopped, Some(track("x")));
        assert_eq!(outcome.dropped, 3);

        // Processed after the completion the stop triggered.
        let snapshot = guild.snapshot().await.unwrap();
        assert!(snapshot.is_idle());
        assert!(snapshot.queue.is_empty());
        assert!(snapshot.loop_enabled);
        assert_eq!(sink.played(), vec!["x"]);
        assert_eq!(sink.stops(), 1);

        // Still usable afterwards.
        guild.enqueue(track("d")).await.unwrap();
        assert_eq!(sink.played(), vec!["x", "d"]);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_harmless() {
        let (guild, sink) = guild_with_sink().await;
        let outcome = guild.stop().await.unwrap();
        assert_eq!(outcome, StopOutcome { stopped: None, dropped: 0 });
        assert_eq!(sink.stops(), 0);
    }

    #[tokio::test]
    async fn test_skip_moves_to_next() {
        let (guild, sink) = guild_with_sink().await;
        guild.enqueue(track("x")).await.unwrap();
        guild.enqueue(track("y")).await.unwrap();

        assert_eq!(guild.skip().await.unwrap(), SkipOutcome::Skipped(track("x")));

        let snapshot = guild.snapshot().await.unwrap();
        assert_eq!(playing_id(&snapshot), Some("y".to_string()));
        assert!(snapshot.queue.is_empty());
        assert_eq!(sink.played(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_skip_with_loop_requeues_skipped_track() {
        let (guild, _sink) = guild_with_sink().await;
        guild.toggle_loop().await.unwrap();
        guild.enqueue(track("x")).await.unwrap();
        guild.enqueue(track("y")).await.unwrap();

        guild.skip().await.unwrap();

        let snapshot = guild.snapshot().await.unwrap();
        assert_eq!(playing_id(&snapshot), Some("y".to_string()));
        assert_eq!(queued_ids(&snapshot), vec!["x"]);
    }

    #[tokio::test]
    async fn test_skip_when_idle() {
        let (guild, sink) = guild_with_sink().await;
        assert_eq!(guild.skip().await.unwrap(), SkipOutcome::NothingPlaying);
        assert_eq!(sink.stops(), 0);
    }

    #[tokio::test]
    async fn test_errored_stream_still_advances() {
        let (guild, sink) = guild_with_sink().await;
        guild.enqueue(track("a")).await.unwrap();
        guild.enqueue(track("b")).await.unwrap();

        assert!(sink.end_current(StreamOutcome::Errored("broken pipe".into())));

        let snapshot = guild.snapshot().await.unwrap();
        assert_eq!(playing_id(&snapshot), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_enqueue_without_sink_keeps_track() {
        let guild = GuildPlayer::spawn(GuildId::new(2));

        let err = guild.enqueue(track("a")).await.unwrap_err();
        assert_eq!(err, PlaybackError::NotConnected(GuildId::new(2)));

        let snapshot = guild.snapshot().await.unwrap();
        assert!(snapshot.is_idle());
        assert_eq!(queued_ids(&snapshot), vec!["a"]);
        assert!(!guild.has_connected_sink().await.unwrap());

        let sink = FakeSink::connected();
        guild.attach_sink(Box::new(sink.clone())).await.unwrap();
        assert!(guild.has_connected_sink().await.unwrap());

        // Attaching resumes the waiting track right away.
        let snapshot = guild.snapshot().await.unwrap();
        assert_eq!(playing_id(&snapshot), Some("a".to_string()));
        assert!(snapshot.queue.is_empty());

        assert_eq!(
            guild.enqueue(track("b")).await.unwrap(),
            EnqueueOutcome::Queued { position: 1 }
        );
        assert_eq!(sink.played(), vec!["a"]);
        assert_eq!(queued_ids(&guild.snapshot().await.unwrap()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_replacing_sink_continues_with_next_track() {
        let (guild, first) = guild_with_sink().await;
        guild.enqueue(track("a")).await.unwrap();
        guild.enqueue(track("b")).await.unwrap();

        let second = FakeSink::connected();
        guild.attach_sink(Box::new(second.clone())).await.unwrap();

        // Processed after the stale completion of "a".
        let snapshot = guild.snapshot().await.unwrap();
        assert_eq!(playing_id(&snapshot), Some("b".to_string()));
        assert!(snapshot.queue.is_empty());
        assert_eq!(first.played(), vec!["a"]);
        assert_eq!(first.stops(), 1);
        assert_eq!(second.played(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_attaching_to_idle_empty_guild_plays_nothing() {
        let guild = GuildPlayer::spawn(GuildId::new(3));
        let sink = FakeSink::connected();
        guild.attach_sink(Box::new(sink.clone())).await.unwrap();

        assert!(guild.snapshot().await.unwrap().is_idle());
        assert!(sink.played().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_keep_one_track_playing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 6;

        let (guild, sink) = guild_with_sink().await;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let guild = guild.clone();
                tokio::spawn(async move {
                    for i in 0..PER_PRODUCER {
                        guild.enqueue(track(&format!("p{}t{}", p, i))).await.unwrap();
                        if i % 2 == 1 {
                            guild.skip().await.unwrap();
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let finisher = {
            let guild = guild.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                loop {
                    sink.finish();
                    let snapshot = guild.snapshot().await.unwrap();
                    assert_invariants(&snapshot);
                    if sink.played().len() == PRODUCERS * PER_PRODUCER && snapshot.is_idle() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for producer in futures::future::join_all(producers).await {
            producer.unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(10), finisher)
            .await
            .expect("playback drained")
            .unwrap();

        let played = sink.played();
        let unique: HashSet<_> = played.iter().collect();
        assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);

        // Each producer's tracks play in the order it queued them.
        for p in 0..PRODUCERS {
            let prefix = format!("p{}t", p);
            let order: Vec<_> = played.iter().filter(|id| id.starts_with(&prefix)).cloned().collect();
            let expected: Vec<_> = (0..PER_PRODUCER).map(|i| format!("p{}t{}", p, i)).collect();
            assert_eq!(order, expected);
        }
    }

    #[tokio::test]
    async fn test_lost_connection_rolls_back_pop() {
        let (guild, sink) = guild_with_sink().await;
        guild.enqueue(track("a")).await.unwrap();
        guild.enqueue(track("b")).await.unwrap();

        sink.set_connected(false);
        sink.finish();

        let snapshot = guild.snapshot().await.unwrap();
        assert!(snapshot.is_idle());
        assert_eq!(queued_ids(&snapshot), vec!["b"]);
        assert_eq!(sink.played(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_unplayable_track_is_dropped() {
        let (guild, sink) = guild_with_sink().await;
        sink.mark_broken("bad");

        let err = guild.enqueue(track("bad")).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Unplayable { .. }));
        assert!(guild.snapshot().await.unwrap().queue.is_empty());

        guild.enqueue(track("a")).await.unwrap();
        guild.enqueue(track("bad")).await.unwrap();
        guild.enqueue(track("c")).await.unwrap();
        sink.finish();

        let snapshot = guild.snapshot().await.unwrap();
        assert_eq!(playing_id(&snapshot), Some("c".to_string()));
        assert_eq!(sink.played(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_stale_completion_is_ignored() {
        let (guild, sink) = guild_with_sink().await;
        guild.enqueue(track("a")).await.unwrap();

        // Keep a copy of a's notifier, then let stop retire the stream.
        let stale = sink.0.lock().active.clone().unwrap();
        guild.stop().await.unwrap();
        guild.enqueue(track("b")).await.unwrap();

        let forged = StreamEndNotifier::new(stale.stream_id(), guild.tx.clone());
        assert!(forged.notify(StreamOutcome::Finished));

        let snapshot = guild.snapshot().await.unwrap();
        assert_eq!(playing_id(&snapshot), Some("b".to_string()));
        assert_eq!(sink.played(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_toggle_loop_flips() {
        let (guild, _sink) = guild_with_sink().await;
        assert!(guild.toggle_loop().await.unwrap());
        assert!(!guild.toggle_loop().await.unwrap());
        assert!(!guild.snapshot().await.unwrap().loop_enabled);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown_reports_unknown_guild() {
        let (guild, sink) = guild_with_sink().await;
        guild.enqueue(track("a")).await.unwrap();
        guild.enqueue(track("b")).await.unwrap();

        guild.shutdown().await;
        assert_eq!(sink.stops(), 1);
        assert!(guild.is_closed());
        assert_eq!(
            guild.snapshot().await.unwrap_err(),
            PlaybackError::UnknownGuild(GuildId::new(1))
        );
        assert_eq!(sink.played(), vec!["a"]);
    }
}
