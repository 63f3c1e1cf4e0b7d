//! Command-line dialects of the external tools.
//!
//! A dialect turns a [`JobRequest`] into a ready-to-spawn [`PreparedRun`]:
//! the `Command`, a parser for the tool's output lines, and where the result
//! is expected to land.

use crate::cmd;
use crate::ffmpeg;
use crate::job::{JobRequest, OutputKind};
use crate::locate::{ToolKind, ToolLocator};
use crate::progress::{self, FfmpegProgressParser, ProgressUpdate};
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_FILE_STEM_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Per-run, stateful reader of a tool's output.
pub trait LineParser: Send {
    fn feed(&mut self, stream: Stream, line: &str) -> Option<ProgressUpdate>;

    /// Output path announced by the tool itself, if it announces one.
    fn reported_output(&self) -> Option<PathBuf> {
        None
    }
}

pub struct PreparedRun {
    pub tool: ToolKind,
    pub command: Command,
    pub parser: Box<dyn LineParser>,
    pub expected_output: Option<PathBuf>,
    /// Treat a non-zero exit as success when the output file exists.
    pub accept_output_on_error: bool,
}

pub trait ToolDialect: Send + Sync {
    fn tool(&self) -> ToolKind;

    /// `binary` is the resolved main tool; helpers such as ffprobe are looked
    /// up through `locator` and are optional.
    fn prepare(
        &self,
        binary: &Path,
        request: &JobRequest,
        locator: &dyn ToolLocator,
    ) -> Result<PreparedRun>;
}

#[derive(Debug, Clone, Default)]
pub struct YtDlpDialect {
    pub rate_limit: Option<String>,
    pub force_compatibility: bool,
}

impl YtDlpDialect {
    pub fn new(rate_limit: Option<String>, force_compatibility: bool) -> Self {
        Self {
            rate_limit,
            force_compatibility,
        }
    }

    fn format_args(&self, request: &JobRequest) -> Vec<&'static str> {
        let compatibility = request.compatibility || self.force_compatibility;
        match (request.output, compatibility) {
            (OutputKind::Video, false) => vec![
                "-f",
                "bv*+ba/b",
                "--merge-output-format",
                "mp4",
                "--postprocessor-args",
                "ffmpeg:-c:a aac",
            ],
            (OutputKind::Video, true) => vec![
                "-f",
                "bv*+ba/b",
                "--merge-output-format",
                "mp4",
                "--recode-video",
                "mp4",
                "--postprocessor-args",
                "ffmpeg:-c:v libx264 -c:a aac",
            ],
            (OutputKind::Audio, false) => vec![
                "-f",
                "ba",
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "0",
                "--embed-thumbnail",
            ],
            (OutputKind::Audio, true) => vec![
                "-f",
                "ba",
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "0",
                "--embed-thumbnail",
                "--postprocessor-args",
                "ffmpeg:-acodec libmp3lame -ar 44100 -ac 2",
            ],
        }
    }
}

impl ToolDialect for YtDlpDialect {
    fn tool(&self) -> ToolKind {
        ToolKind::YtDlp
    }

    fn prepare(
        &self,
        binary: &Path,
        request: &JobRequest,
        locator: &dyn ToolLocator,
    ) -> Result<PreparedRun> {
        std::fs::create_dir_all(&request.destination)?;

        let (template, expected_output) = match request.file_name.as_deref() {
            Some(name) => {
                let target = unique_path(
                    &request.destination,
                    &sanitize_file_stem(name),
                    request.output.extension(),
                );
                let template = target.with_extension("%(ext)s");
                (template, Some(target))
            }
            None => (request.destination.join("%(title)s.%(ext)s"), None),
        };

        let mut command = cmd::command(binary);
        command
            .args(self.format_args(request))
            .arg("-o")
            .arg(&template)
            .args([
                "--no-playlist",
                "--add-metadata",
                "--concurrent-fragments",
                "1",
                "--no-part",
                "--no-mtime",
                "--newline",
                "--progress",
                "--progress-template",
                progress::YTDLP_PROGRESS_TEMPLATE,
                "--print",
                "after_move:filepath",
            ]);
        if let Some(rate) = self.rate_limit.as_deref().filter(|r| !r.trim().is_empty()) {
            command.args(["--limit-rate", rate.trim()]);
        }
        if let Ok(ffmpeg) = locator.locate(ToolKind::Ffmpeg) {
            command.arg("--ffmpeg-location").arg(ffmpeg);
        }
        command.arg("--").arg(request.source.trim());

        Ok(PreparedRun {
            tool: ToolKind::YtDlp,
            command,
            parser: Box::new(YtDlpLineParser::default()),
            expected_output,
            // yt-dlp exits non-zero when only a post-processing step (e.g.
            // thumbnail embedding) failed; the media file is still good.
            accept_output_on_error: true,
        })
    }
}

#[derive(Debug, Default)]
struct YtDlpLineParser {
    final_path: Option<PathBuf>,
}

impl LineParser for YtDlpLineParser {
    fn feed(&mut self, stream: Stream, line: &str) -> Option<ProgressUpdate> {
        if let Some(update) = progress::parse_ytdlp_line(line) {
            return Some(update);
        }
        let trimmed = line.trim();
        if stream == Stream::Stdout && !trimmed.is_empty() && Path::new(trimmed).is_absolute() {
            self.final_path = Some(PathBuf::from(trimmed));
        }
        None
    }

    fn reported_output(&self) -> Option<PathBuf> {
        self.final_path.clone()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegDialect;

impl FfmpegDialect {
    fn codec_args(output: OutputKind) -> &'static [&'static str] {
        match output {
            OutputKind::Video => &[
                "-c:v",
                "libx264",
                "-preset",
                "medium",
                "-crf",
                "23",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-movflags",
                "+faststart",
            ],
            OutputKind::Audio => &[
                "-vn",
                "-c:a",
                "libmp3lame",
                "-b:a",
                "192k",
                "-ar",
                "44100",
                "-ac",
                "2",
            ],
        }
    }
}

impl ToolDialect for FfmpegDialect {
    fn tool(&self) -> ToolKind {
        ToolKind::Ffmpeg
    }

    fn prepare(
        &self,
        binary: &Path,
        request: &JobRequest,
        locator: &dyn ToolLocator,
    ) -> Result<PreparedRun> {
        let input = PathBuf::from(request.source.trim());
        if !input.is_file() {
            return Err(EngineError::Validation(format!(
                "source file no longer exists: {}",
                file_label(&input)
            )));
        }

        let mut duration_ms = None;
        if let Ok(ffprobe) = locator.locate(ToolKind::Ffprobe) {
            match ffmpeg::probe(&ffprobe, &input) {
                Ok(probe) => {
                    if request.output == OutputKind::Video && !probe.has_video() {
                        return Err(EngineError::Validation(
                            "source has no video stream; convert it to audio instead".to_string(),
                        ));
                    }
                    duration_ms = probe.duration_ms;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ffprobe failed; relying on ffmpeg for duration");
                }
            }
        }

        std::fs::create_dir_all(&request.destination)?;
        let stem = match request.file_name.as_deref() {
            Some(name) => sanitize_file_stem(name),
            None => {
                let source_stem = input
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                format!("{}_converted", sanitize_file_stem(&source_stem))
            }
        };
        let output = unique_path(&request.destination, &stem, request.output.extension());

        let mut command = cmd::command(binary);
        command
            .args(["-nostdin", "-y", "-hide_banner", "-i"])
            .arg(&input)
            .args(Self::codec_args(request.output))
            .args(["-progress", "pipe:1", "-nostats"])
            .arg(&output);

        Ok(PreparedRun {
            tool: ToolKind::Ffmpeg,
            command,
            parser: Box::new(FfmpegLineParser(FfmpegProgressParser::new(duration_ms))),
            expected_output: Some(output),
            accept_output_on_error: false,
        })
    }
}

struct FfmpegLineParser(FfmpegProgressParser);

impl LineParser for FfmpegLineParser {
    fn feed(&mut self, _stream: Stream, line: &str) -> Option<ProgressUpdate> {
        self.0.feed(line)
    }
}

/// Replaces characters that are invalid in file names on common platforms.
pub fn sanitize_file_stem(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c == ' ' || c == '.');
    let limited: String = trimmed.chars().take(MAX_FILE_STEM_CHARS).collect();
    if limited.is_empty() {
        "untitled".to_string()
    } else {
        limited
    }
}

/// `dir/stem.ext`, or `dir/stem_N.ext` with the first free N.
pub fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "<unnamed>".to_string())
}
