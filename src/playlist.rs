//! Turns a YouTube playlist URL into the watch URLs of its entries.
//!
//! A playlist is never queued as one job: each entry becomes its own
//! download so progress, cancellation and failures stay per video.

use crate::classify::{classify_youtube_url, SourceKind};
use crate::cmd;
use crate::invoker::classify_failure;
use crate::locate::ToolKind;
use crate::{EngineError, Result};
use std::collections::HashSet;
use std::path::Path;

/// Lists the entries of `url` without downloading anything.
pub fn expand_playlist(ytdlp: &Path, url: &str) -> Result<Vec<String>> {
    let output = cmd::command(ytdlp)
        .args([
            "--socket-timeout",
            "30",
            "--flat-playlist",
            "--skip-download",
            "--ignore-errors",
            "--no-warnings",
            "--print",
            "webpage_url",
            "--",
        ])
        .arg(url.trim())
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ToolMissing {
                tool: ToolKind::YtDlp.as_str().to_string(),
            },
            _ => EngineError::Io(e),
        })?;

    let entries = parse_expanded_urls(&String::from_utf8_lossy(&output.stdout));
    if !entries.is_empty() {
        // --ignore-errors keeps listing past unavailable entries but still
        // exits non-zero; the entries it did print are usable.
        if !output.status.success() {
            tracing::warn!(code = ?output.status.code(), entries = entries.len(), "playlist listed with errors");
        }
        return Ok(entries);
    }

    if !output.status.success() {
        let tail: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::to_string)
            .collect();
        return Err(EngineError::ToolExecution {
            tool: ToolKind::YtDlp.as_str().to_string(),
            code: output.status.code(),
            reason: classify_failure(ToolKind::YtDlp, output.status.code(), &tail),
        });
    }
    Err(EngineError::Validation("playlist has no videos".to_string()))
}

/// Keeps each video URL once, in listing order.
pub fn parse_expanded_urls(stdout: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| classify_youtube_url(line) == SourceKind::YouTubeVideo)
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}
