use crate::cmd;
use crate::locate::ToolKind;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaProbe {
    pub duration_ms: Option<i64>,
    pub container: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

impl MediaProbe {
    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

pub fn probe(ffprobe: &Path, input: &Path) -> Result<MediaProbe> {
    let output = cmd::command(ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(input)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ToolMissing {
                tool: ToolKind::Ffprobe.as_str().to_string(),
            },
            _ => EngineError::Io(e),
        })?;

    if !output.status.success() {
        return Err(EngineError::ToolExecution {
            tool: ToolKind::Ffprobe.as_str().to_string(),
            code: output.status.code(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(stdout: &[u8]) -> Result<MediaProbe> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;

    let container = parsed
        .format
        .as_ref()
        .and_then(|f| f.format_name.as_deref())
        .map(first_format_name);
    let duration_ms = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(parse_seconds_to_ms);

    let streams = parsed.streams.unwrap_or_default();
    let codec_of = |kind: &str| {
        streams
            .iter()
            .filter(|st| st.codec_type.as_deref() == Some(kind))
            // Embedded cover art shows up as a single-frame video stream.
            .find(|st| st.disposition.as_ref().map_or(true, |d| d.attached_pic == 0))
            .map(|st| st.codec_name.clone().unwrap_or_else(|| "unknown".to_string()))
    };

    Ok(MediaProbe {
        duration_ms,
        container,
        video_codec: codec_of("video"),
        audio_codec: codec_of("audio"),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    disposition: Option<FfprobeDisposition>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    attached_pic: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

fn first_format_name(value: &str) -> String {
    value.split(',').next().unwrap_or(value).trim().to_string()
}

fn parse_seconds_to_ms(value: &str) -> Option<i64> {
    let seconds: f64 = value.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_output_with_video_and_audio() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264"},
                {"codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "12.345000"}
        }"#;
        let probe = parse_probe_output(json).expect("parse");
        assert_eq!(probe.duration_ms, Some(12_345));
        assert_eq!(probe.container.as_deref(), Some("mov"));
        assert!(probe.has_video());
        assert!(probe.has_audio());
    }

    #[test]
    fn cover_art_is_not_a_video_stream() {
        let json = br#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "mp3"},
                {"codec_type": "video", "codec_name": "mjpeg", "disposition": {"attached_pic": 1}}
            ],
            "format": {"format_name": "mp3", "duration": "N/A"}
        }"#;
        let probe = parse_probe_output(json).expect("parse");
        assert!(!probe.has_video());
        assert!(probe.has_audio());
        assert_eq!(probe.duration_ms, None);
    }
}
