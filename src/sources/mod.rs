//! # Sources Module
//!
//! Everything needed to turn a user query into a file on disk:
//!
//! - [`MediaBackend`]: the blocking resolve + download contract
//! - [`ytdlp::YtDlpBackend`]: the backend implemented over the `yt-dlp` executable
//! - [`fetch::FetchStage`]: runs a backend off the async scheduler behind a
//!   bounded worker pool
//!
//! The result of a successful fetch is a [`TrackDescriptor`], the only thing
//! the playback queue ever holds.

pub mod fetch;
pub mod ytdlp;

use regex::Regex;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use thiserror::Error;

pub use fetch::FetchStage;
pub use ytdlp::YtDlpBackend;

/// Title shown when the backend did not report one.
pub const UNKNOWN_TITLE: &str = "Unknown Title";

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[^m]*m").expect("valid ANSI regex"));

/// Resolve or download failure, carrying a message fit to show a user.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DownloadError {
    message: String,
}

impl DownloadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Builds an error from raw downloader stderr.
    ///
    /// Colour codes are removed and the `ERROR:` prefix is dropped. When the
    /// output spans several lines the last `ERROR` line wins, falling back to
    /// the last non-empty line.
    pub fn from_stderr(stderr: &str) -> Self {
        let cleaned = ANSI_ESCAPE.replace_all(stderr, "");
        let lines: Vec<&str> = cleaned
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        let line = lines
            .iter()
            .rev()
            .find(|line| starts_with_error(line))
            .or_else(|| lines.last())
            .copied()
            .unwrap_or("");

        Self::new(sanitize_line(line))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn starts_with_error(line: &str) -> bool {
    line.get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("error"))
}

fn sanitize_line(line: &str) -> String {
    let line = line.trim();
    let stripped = if starts_with_error(line) {
        line[5..].trim_matches(|c| c == ' ' || c == ':')
    } else {
        line
    };

    if stripped.is_empty() {
        "unknown download error".to_string()
    } else {
        stripped.to_string()
    }
}

/// Blocking resolve + download contract.
///
/// Implementations resolve `query` to exactly one media item, store it in
/// `destination` under the item's stable id and report what they stored.
/// They are called from the blocking thread pool, never from async code.
#[cfg_attr(test, mockall::automock)]
pub trait MediaBackend: Send + Sync {
    fn resolve_and_download(
        &self,
        query: &str,
        destination: &Path,
    ) -> Result<TrackMetadata, DownloadError>;
}

/// Metadata reported by a backend for one downloaded item.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TrackMetadata {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub filepath: Option<PathBuf>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// A resolved, downloaded item ready to stream.
///
/// Built once by the fetch stage and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDescriptor {
    id: String,
    title: Option<String>,
    local_path: PathBuf,
    webpage_url: Option<String>,
    duration: Option<Duration>,
}

impl TrackDescriptor {
    pub fn new(id: impl Into<String>, title: Option<String>, local_path: PathBuf) -> Self {
        Self {
            id: id.into(),
            title,
            local_path,
            webpage_url: None,
            duration: None,
        }
    }

    /// Builds a descriptor from backend metadata.
    ///
    /// When the backend did not report the final file path it is derived from
    /// the `<id>.<ext>` layout inside `directory`.
    pub fn from_metadata(metadata: TrackMetadata, directory: &Path) -> Self {
        let local_path = match metadata.filepath {
            Some(path) => path,
            None => {
                let file_name = match &metadata.ext {
                    Some(ext) => format!("{}.{}", metadata.id, ext),
                    None => metadata.id.clone(),
                };
                directory.join(file_name)
            }
        };

        let mut track = Self::new(metadata.id, metadata.title, local_path);
        if let Some(url) = metadata.webpage_url {
            track = track.with_webpage_url(url);
        }
        if let Some(seconds) = metadata.duration.filter(|d| d.is_finite() && *d >= 0.0) {
            track = track.with_duration(Duration::from_secs_f64(seconds));
        }
        track
    }

    pub fn with_webpage_url(mut self, url: String) -> Self {
        self.webpage_url = Some(url);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Title for display, falling back to [`UNKNOWN_TITLE`].
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .unwrap_or(UNKNOWN_TITLE)
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn webpage_url(&self) -> Option<&str> {
        self.webpage_url.as_deref()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
}
