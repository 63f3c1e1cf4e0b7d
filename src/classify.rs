use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

const MAX_URL_LEN: usize = 2048;
const SHELL_METACHARACTERS: &[char] = &[';', '|', '`', '$', '<', '>', '\n', '\r', '\\', '"', '\''];
const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

pub const SUPPORTED_INPUT_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "mp3", "m4a", "wav", "flac", "ogg", "aac",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    YouTubeVideo,
    YouTubePlaylist,
    MediaFile,
    Unrecognized,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::YouTubeVideo => "youtube_video",
            SourceKind::YouTubePlaylist => "youtube_playlist",
            SourceKind::MediaFile => "media_file",
            SourceKind::Unrecognized => "unrecognized",
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, SourceKind::Unrecognized)
    }
}

/// Decides whether a raw source string is something a queue can work on.
/// New source kinds are added as `SourceKind` variants plus a classifier.
pub trait SourceClassifier: Send + Sync {
    fn classify(&self, source: &str) -> SourceKind;
}

/// Download sources: YouTube video, shorts and playlist URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct YouTubeClassifier;

impl SourceClassifier for YouTubeClassifier {
    fn classify(&self, source: &str) -> SourceKind {
        classify_youtube_url(source)
    }
}

/// Conversion sources: an existing regular file with a known media extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaFileClassifier;

impl SourceClassifier for MediaFileClassifier {
    fn classify(&self, source: &str) -> SourceKind {
        classify_media_file(Path::new(source.trim()))
    }
}

pub fn classify_youtube_url(source: &str) -> SourceKind {
    let trimmed = source.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_URL_LEN
        || trimmed.contains(SHELL_METACHARACTERS)
    {
        return SourceKind::Unrecognized;
    }

    let Ok(parsed) = Url::parse(trimmed) else {
        return SourceKind::Unrecognized;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return SourceKind::Unrecognized;
    }
    let Some(host) = parsed.host_str().map(|h| h.to_ascii_lowercase()) else {
        return SourceKind::Unrecognized;
    };
    if !YOUTUBE_HOSTS.contains(&host.as_str()) {
        return SourceKind::Unrecognized;
    }

    let path = parsed.path().trim_end_matches('/');

    if host == "youtu.be" {
        let id = path.trim_start_matches('/');
        return if id.is_empty() || id.contains('/') {
            SourceKind::Unrecognized
        } else {
            SourceKind::YouTubeVideo
        };
    }

    if let Some(id) = path.strip_prefix("/shorts/") {
        return if id.is_empty() {
            SourceKind::Unrecognized
        } else {
            SourceKind::YouTubeVideo
        };
    }

    let has_param = |name: &str| {
        parsed
            .query_pairs()
            .any(|(key, value)| key == name && !value.is_empty())
    };

    match path {
        "/watch" if has_param("v") => SourceKind::YouTubeVideo,
        "/watch" | "/playlist" if has_param("list") => SourceKind::YouTubePlaylist,
        _ => SourceKind::Unrecognized,
    }
}

pub fn classify_media_file(path: &Path) -> SourceKind {
    let supported = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| SUPPORTED_INPUT_EXTENSIONS.contains(&e.as_str()));
    if supported && path.is_file() {
        SourceKind::MediaFile
    } else {
        SourceKind::Unrecognized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_video_urls() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/abc123",
            "https://www.youtube.com/watch?v=abc&list=PL123",
        ] {
            assert_eq!(classify_youtube_url(url), SourceKind::YouTubeVideo, "{url}");
        }
    }

    #[test]
    fn youtube_playlist_urls() {
        assert_eq!(
            classify_youtube_url("https://www.youtube.com/playlist?list=PL123"),
            SourceKind::YouTubePlaylist
        );
        assert_eq!(
            classify_youtube_url("https://www.youtube.com/watch?list=PL123"),
            SourceKind::YouTubePlaylist
        );
    }

    #[test]
    fn rejects_other_sources() {
        let long = format!("https://youtu.be/{}", "a".repeat(MAX_URL_LEN));
        for url in [
            "",
            "video A",
            "ftp://youtube.com/watch?v=abc",
            "https://vimeo.com/123",
            "https://www.youtube.com/watch",
            "https://www.youtube.com/channel/xyz",
            "https://youtu.be/",
            "https://www.youtube.com/watch?v=abc;rm -rf",
            long.as_str(),
        ] {
            assert_eq!(classify_youtube_url(url), SourceKind::Unrecognized, "{url}");
        }
    }

    #[test]
    fn media_files_need_known_extension_and_existence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clip = dir.path().join("clip.MKV");
        let notes = dir.path().join("notes.txt");
        std::fs::write(&clip, b"x").expect("write clip");
        std::fs::write(&notes, b"x").expect("write notes");

        let classifier = MediaFileClassifier;
        assert_eq!(
            classifier.classify(&clip.to_string_lossy()),
            SourceKind::MediaFile
        );
        assert_eq!(
            classifier.classify(&notes.to_string_lossy()),
            SourceKind::Unrecognized
        );
        assert_eq!(
            classifier.classify(&dir.path().join("missing.mp4").to_string_lossy()),
            SourceKind::Unrecognized
        );
        assert_eq!(
            classifier.classify(&dir.path().to_string_lossy()),
            SourceKind::Unrecognized
        );
    }
}
