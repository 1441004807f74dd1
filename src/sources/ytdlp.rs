use anyhow::Result;
use regex::Regex;
use std::{path::Path, sync::LazyLock};
use tracing::{debug, error, info};
use url::Url;

use super::{DownloadError, MediaBackend, TrackMetadata};

/// Fields printed by yt-dlp once the file is in its final location.
const PRINT_TEMPLATE: &str = "after_move:%(.{id,title,ext,filepath,webpage_url,duration})j";

/// A single token that starts with a host name, e.g. `youtu.be/abc`.
static BARE_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s/:?#]+\.[A-Za-z]{2,}(?:[/?#]\S*)?$").expect("valid host regex")
});

/// A user query, classified the way yt-dlp should receive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Url(String),
    Search(String),
}

impl Query {
    pub fn parse(raw: &str) -> Result<Self, DownloadError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DownloadError::new("empty query"));
        }

        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Self::Url(raw.to_string())),
            _ => Ok(Self::without_scheme(raw).unwrap_or_else(|| Self::Search(raw.to_string()))),
        }
    }

    /// Links pasted without `https://` are still links.
    fn without_scheme(raw: &str) -> Option<Self> {
        if !BARE_HOST.is_match(raw) {
            return None;
        }
        let url = Url::parse(&format!("https://{}", raw)).ok()?;
        url.host_str()?;
        Some(Self::Url(url.to_string()))
    }

    /// Argument handed to yt-dlp. Searches resolve to their first hit only.
    pub fn as_target(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Search(term) => format!("ytsearch1:{}", term),
        }
    }
}

/// Media backend that shells out to `yt-dlp`.
pub struct YtDlpBackend {
    binary: String,
    format: String,
}

impl YtDlpBackend {
    pub fn new(binary: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            format: format.into(),
        }
    }

    /// Checks that yt-dlp and ffmpeg can be executed.
    pub async fn verify_dependencies(&self) -> Result<()> {
        let ytdlp_check = async_process::Command::new(&self.binary)
            .arg("--version")
            .output()
            .await;

        match ytdlp_check {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp version: {}", version.trim());
            }
            _ => {
                error!("❌ {} not found. Install with: pip install yt-dlp", self.binary);
                anyhow::bail!("yt-dlp not available");
            }
        }

        let ffmpeg_check = async_process::Command::new("ffmpeg")
            .arg("-version")
            .output()
            .await;

        match ffmpeg_check {
            Ok(output) if output.status.success() => {
                info!("✅ ffmpeg available");
            }
            _ => {
                error!("❌ ffmpeg not found. Install with: sudo apt install ffmpeg");
                anyhow::bail!("ffmpeg not available");
            }
        }

        Ok(())
    }

    fn build_args(&self, query: &Query, destination: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "--format",
            self.format.as_str(),
            "--source-address",
            "0.0.0.0",
            "--no-playlist",
            "--playlist-items",
            "1",
            "--no-simulate",
            "--quiet",
            "--no-warnings",
            "--no-progress",
            "--output",
            "%(id)s.%(ext)s",
            "--print",
            PRINT_TEMPLATE,
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();

        args.push("--paths".to_string());
        args.push(format!("home:{}", destination.display()));
        args.push(query.as_target());
        args
    }
}

impl MediaBackend for YtDlpBackend {
    fn resolve_and_download(
        &self,
        query: &str,
        destination: &Path,
    ) -> Result<TrackMetadata, DownloadError> {
        let query = Query::parse(query)?;
        debug!("⬇️ yt-dlp {:?} -> {}", query, destination.display());

        let output = std::process::Command::new(&self.binary)
            .args(self.build_args(&query, destination))
            .output()
            .map_err(|e| DownloadError::new(format!("could not run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(DownloadError::from_stderr(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }

        parse_metadata(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Reads the metadata line printed by yt-dlp. Only the last line counts.
fn parse_metadata(stdout: &str) -> Result<TrackMetadata, DownloadError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or_else(|| DownloadError::new("no results found"))?;

    serde_json::from_str(line)
        .map_err(|e| DownloadError::new(format!("unexpected yt-dlp output: {}", e)))
}
