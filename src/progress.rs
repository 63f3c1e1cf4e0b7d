//! Progress line grammar for the external tools.
//!
//! Every function here takes one line of tool output and either recognises a
//! progress report or returns `None`. Lines that do not match are ignored by
//! the caller, never treated as errors.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One structured progress report. `percent` is in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percent: f32,
    pub rate: Option<String>,
    pub eta_secs: Option<u64>,
}

/// Marks our own progress lines. yt-dlp reads a leading `download:` in
/// `--progress-template` as the progress type and strips it, so the printed
/// line starts with this marker.
pub const YTDLP_PROGRESS_MARKER: &str = "mqprogress:";

/// Printed as `mqprogress:<downloaded>/<total>/<speed>/<eta>` where any field
/// may be `NA`.
pub const YTDLP_PROGRESS_TEMPLATE: &str = "download:mqprogress:%(progress.downloaded_bytes)s/%(progress.total_bytes,progress.total_bytes_estimate)s/%(progress.speed)s/%(progress.eta)s";

pub fn parse_ytdlp_line(line: &str) -> Option<ProgressUpdate> {
    parse_ytdlp_template_line(line).or_else(|| parse_ytdlp_default_line(line))
}

fn parse_ytdlp_template_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.trim().strip_prefix(YTDLP_PROGRESS_MARKER)?;
    let mut parts = rest.split('/');
    let downloaded = parse_number(parts.next()?)?;
    let total = parse_number(parts.next()?)?;
    let speed = parts.next().and_then(parse_number);
    let eta = parts.next().and_then(parse_number);

    if total <= 0.0 {
        return None;
    }

    Some(ProgressUpdate {
        percent: ((downloaded / total) * 100.0).clamp(0.0, 100.0) as f32,
        rate: speed.filter(|s| *s > 0.0).map(format_byte_rate),
        eta_secs: eta.filter(|e| *e >= 0.0).map(|e| e.round() as u64),
    })
}

/// yt-dlp's stock progress line, e.g.
/// `[download]  42.3% of ~ 10.00MiB at  1.20MiB/s ETA 00:07`.
fn parse_ytdlp_default_line(line: &str) -> Option<ProgressUpdate> {
    static DEFAULT_RE: OnceLock<Regex> = OnceLock::new();
    let re = DEFAULT_RE.get_or_init(|| {
        Regex::new(
            r"^\[download\]\s+(?P<pct>\d+(?:\.\d+)?)%(?:.*?\bat\s+(?P<rate>\S+/s))?(?:.*?\bETA\s+(?P<eta>[\d:]+))?",
        )
        .unwrap()
    });

    let caps = re.captures(line.trim())?;
    let percent: f32 = caps.name("pct")?.as_str().parse().ok()?;
    Some(ProgressUpdate {
        percent: percent.clamp(0.0, 100.0),
        rate: caps.name("rate").map(|m| m.as_str().to_string()),
        eta_secs: caps
            .name("eta")
            .and_then(|m| parse_clock(m.as_str()))
            .map(|secs| secs.round() as u64),
    })
}

/// Stateful parser for ffmpeg. Percent needs the input duration, which comes
/// either from a probe up front or from ffmpeg's own `Duration:` header line.
#[derive(Debug, Clone, Default)]
pub struct FfmpegProgressParser {
    duration_ms: Option<i64>,
    out_time_ms: Option<i64>,
    speed: Option<f64>,
}

impl FfmpegProgressParser {
    pub fn new(duration_ms: Option<i64>) -> Self {
        Self {
            duration_ms: duration_ms.filter(|d| *d > 0),
            out_time_ms: None,
            speed: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.duration_ms
    }

    pub fn feed(&mut self, line: &str) -> Option<ProgressUpdate> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        // `-progress pipe:1` key=value block; a block ends with `progress=...`.
        if let Some((key, value)) = line.split_once('=') {
            if !key.contains(' ') {
                match key {
                    // Despite the name, ffmpeg reports microseconds here.
                    "out_time_us" | "out_time_ms" => {
                        if let Ok(us) = value.trim().parse::<i64>() {
                            self.out_time_ms = Some(us / 1000);
                        }
                        return None;
                    }
                    "out_time" => {
                        if let Some(secs) = parse_clock(value) {
                            self.out_time_ms = Some((secs * 1000.0) as i64);
                        }
                        return None;
                    }
                    "speed" => {
                        self.speed = parse_speed(value);
                        return None;
                    }
                    "progress" => return self.current(),
                    _ => {}
                }
            }
        }

        if self.duration_ms.is_none() {
            if let Some(ms) = parse_duration_header(line) {
                self.duration_ms = Some(ms);
                return None;
            }
        }

        // Classic stats line on stderr: `frame=  120 ... time=00:00:04.00 bitrate=... speed=2.0x`
        static STATS_RE: OnceLock<Regex> = OnceLock::new();
        let re = STATS_RE.get_or_init(|| {
            Regex::new(r"time=\s*(?P<time>-?[\d:.]+).*?speed=\s*(?P<speed>[\d.]+x|N/A)").unwrap()
        });
        let caps = re.captures(line)?;
        let secs = parse_clock(caps.name("time")?.as_str())?;
        self.out_time_ms = Some((secs * 1000.0) as i64);
        self.speed = caps.name("speed").and_then(|m| parse_speed(m.as_str()));
        self.current()
    }

    fn current(&self) -> Option<ProgressUpdate> {
        let duration = self.duration_ms?;
        let out = self.out_time_ms?.max(0);
        let percent = ((out as f64 / duration as f64) * 100.0).clamp(0.0, 100.0);
        let eta_secs = self.speed.filter(|s| *s > 0.0).map(|speed| {
            let remaining_ms = (duration - out).max(0) as f64;
            ((remaining_ms / 1000.0) / speed).round() as u64
        });
        Some(ProgressUpdate {
            percent: percent as f32,
            rate: self.speed.map(|s| format!("{s:.2}x")),
            eta_secs,
        })
    }
}

/// `  Duration: 00:01:02.50, start: 0.000000, bitrate: 128 kb/s`
pub fn parse_duration_header(line: &str) -> Option<i64> {
    let rest = line.trim().strip_prefix("Duration:")?;
    let clock = rest.split(',').next()?.trim();
    parse_clock(clock).map(|secs| (secs * 1000.0).round() as i64)
}

/// Parses `HH:MM:SS(.frac)`, `MM:SS` or plain seconds.
pub fn parse_clock(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('-') {
        return None;
    }
    let mut total = 0.0_f64;
    for part in value.split(':') {
        let n: f64 = part.parse().ok()?;
        if !n.is_finite() || n < 0.0 {
            return None;
        }
        total = total * 60.0 + n;
    }
    Some(total)
}

fn parse_speed(value: &str) -> Option<f64> {
    let speed: f64 = value.trim().trim_end_matches('x').parse().ok()?;
    (speed.is_finite() && speed > 0.0).then_some(speed)
}

fn parse_number(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("na") || value.eq_ignore_ascii_case("none") {
        return None;
    }
    let n: f64 = value.parse().ok()?;
    n.is_finite().then_some(n)
}

fn format_byte_rate(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_sec;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ytdlp_template_line_yields_percent_rate_and_eta() {
        let update = parse_ytdlp_line("mqprogress:524288/1048576/1048576.0/3").expect("update");
        assert_eq!(update.percent, 50.0);
        assert_eq!(update.rate.as_deref(), Some("1.00 MiB/s"));
        assert_eq!(update.eta_secs, Some(3));
    }

    #[test]
    fn template_survives_ytdlp_stripping_the_type_selector() {
        // yt-dlp consumes `download:` as the progress type; what it prints
        // must still carry the marker.
        let printed = YTDLP_PROGRESS_TEMPLATE
            .strip_prefix("download:")
            .expect("type selector");
        assert!(printed.starts_with(YTDLP_PROGRESS_MARKER));

        let rendered = printed
            .replace("%(progress.downloaded_bytes)s", "524288")
            .replace("%(progress.total_bytes,progress.total_bytes_estimate)s", "1048576")
            .replace("%(progress.speed)s", "NA")
            .replace("%(progress.eta)s", "NA");
        assert_eq!(rendered, "mqprogress:524288/1048576/NA/NA");
        let update = parse_ytdlp_line(&rendered).expect("update");
        assert_eq!(update.percent, 50.0);
        assert_eq!(update.rate, None);
    }

    #[test]
    fn bare_numbers_are_not_progress() {
        assert!(parse_ytdlp_line("524288/1048576/1048576.0/3").is_none());
    }

    #[test]
    fn ytdlp_template_line_without_total_is_ignored() {
        assert!(parse_ytdlp_line("mqprogress:1000/NA/NA/NA").is_none());
        assert!(parse_ytdlp_line("mqprogress:garbage").is_none());
    }

    #[test]
    fn ytdlp_default_line_is_understood() {
        let update =
            parse_ytdlp_line("[download]  42.3% of ~  10.00MiB at    1.20MiB/s ETA 01:07")
                .expect("update");
        assert!((update.percent - 42.3).abs() < 0.01);
        assert_eq!(update.rate.as_deref(), Some("1.20MiB/s"));
        assert_eq!(update.eta_secs, Some(67));
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        assert!(parse_ytdlp_line("[youtube] abc: Downloading webpage").is_none());
        assert!(parse_ytdlp_line("").is_none());
        let mut parser = FfmpegProgressParser::new(None);
        assert!(parser.feed("Stream #0:0: Video: h264").is_none());
    }

    #[test]
    fn ffmpeg_progress_block_uses_known_duration() {
        let mut parser = FfmpegProgressParser::new(Some(10_000));
        assert!(parser.feed("out_time_us=2500000").is_none());
        assert!(parser.feed("speed=2.5x").is_none());
        let update = parser.feed("progress=continue").expect("update");
        assert_eq!(update.percent, 25.0);
        assert_eq!(update.rate.as_deref(), Some("2.50x"));
        assert_eq!(update.eta_secs, Some(3));
    }

    #[test]
    fn ffmpeg_learns_duration_from_header_and_reads_stats_lines() {
        let mut parser = FfmpegProgressParser::new(None);
        assert!(parser
            .feed("  Duration: 00:00:20.00, start: 0.000000, bitrate: 128 kb/s")
            .is_none());
        assert_eq!(parser.duration_ms(), Some(20_000));
        let update = parser
            .feed("size=  512kB time=00:00:05.00 bitrate= 838.9kbits/s speed=1.00x")
            .expect("update");
        assert_eq!(update.percent, 25.0);
        assert_eq!(update.eta_secs, Some(15));
    }

    #[test]
    fn ffmpeg_without_duration_reports_nothing() {
        let mut parser = FfmpegProgressParser::new(None);
        parser.feed("out_time=00:00:03.000000");
        assert!(parser.feed("progress=continue").is_none());
    }

    #[test]
    fn clock_parsing() {
        assert_eq!(parse_clock("01:02:03.5"), Some(3723.5));
        assert_eq!(parse_clock("00:07"), Some(7.0));
        assert_eq!(parse_clock("N/A"), None);
        assert_eq!(parse_clock("-00:00:01"), None);
    }
}
