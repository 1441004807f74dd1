use std::collections::VecDeque;
use tracing::debug;

use crate::sources::TrackDescriptor;

/// FIFO of tracks waiting to play in one guild.
///
/// Unbounded; insertion order is playback order.
#[derive(Debug, Default, Clone)]
pub struct TrackQueue {
    items: VecDeque<TrackDescriptor>,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the tail and returns the 1-based position.
    pub fn push(&mut self, track: TrackDescriptor) -> usize {
        debug!("➕ Queued: {}", track.display_title());
        self.items.push_back(track);
        self.items.len()
    }

    /// Puts a track back at the head, undoing a [`pop`](Self::pop).
    pub fn push_front(&mut self, track: TrackDescriptor) {
        self.items.push_front(track);
    }

    pub fn pop(&mut self) -> Option<TrackDescriptor> {
        self.items.pop_front()
    }

    /// Drops every waiting track and returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackDescriptor> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<TrackDescriptor> {
        self.iter().cloned().collect()
    }
}
