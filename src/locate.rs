use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    YtDlp,
    Ffmpeg,
    Ffprobe,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::YtDlp => "yt-dlp",
            ToolKind::Ffmpeg => "ffmpeg",
            ToolKind::Ffprobe => "ffprobe",
        }
    }

    fn version_arg(&self) -> &'static str {
        match self {
            ToolKind::YtDlp => "--version",
            ToolKind::Ffmpeg | ToolKind::Ffprobe => "-version",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Resolves an external tool to a runnable path. A queue refuses to start
/// until its tool resolves.
pub trait ToolLocator: Send + Sync {
    fn locate(&self, tool: ToolKind) -> Result<PathBuf>;
}

/// Explicit override, then the bundled copy under `<base>/tools`, then `PATH`.
#[derive(Debug, Clone, Default)]
pub struct SystemToolLocator {
    paths: Option<AppPaths>,
    overrides: BTreeMap<ToolKind, PathBuf>,
}

impl SystemToolLocator {
    pub fn new(paths: Option<AppPaths>, overrides: BTreeMap<ToolKind, PathBuf>) -> Self {
        Self { paths, overrides }
    }

    fn bundled_path(&self, tool: ToolKind) -> Option<PathBuf> {
        let paths = self.paths.as_ref()?;
        Some(match tool {
            ToolKind::YtDlp => paths.ytdlp_bin_path(),
            ToolKind::Ffmpeg => paths.ffmpeg_bin_path(),
            ToolKind::Ffprobe => paths.ffprobe_bin_path(),
        })
    }
}

impl ToolLocator for SystemToolLocator {
    fn locate(&self, tool: ToolKind) -> Result<PathBuf> {
        if let Some(path) = self.overrides.get(&tool) {
            if path.is_file() {
                return Ok(path.clone());
            }
            tracing::warn!(tool = %tool, path = %path.display(), "configured tool override does not exist");
        }

        if let Some(path) = self.bundled_path(tool).filter(|p| p.is_file()) {
            return Ok(path);
        }

        which::which(tool.as_str()).map_err(|_| EngineError::ToolMissing {
            tool: tool.as_str().to_string(),
        })
    }
}

/// Fixed tool table. Tools not in the table are missing.
#[derive(Debug, Clone, Default)]
pub struct StaticToolLocator {
    tools: BTreeMap<ToolKind, PathBuf>,
}

impl StaticToolLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: ToolKind, path: impl Into<PathBuf>) -> Self {
        self.tools.insert(tool, path.into());
        self
    }
}

impl ToolLocator for StaticToolLocator {
    fn locate(&self, tool: ToolKind) -> Result<PathBuf> {
        self.tools
            .get(&tool)
            .cloned()
            .ok_or_else(|| EngineError::ToolMissing {
                tool: tool.as_str().to_string(),
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub tool: ToolKind,
    pub available: bool,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

pub fn tool_status(locator: &dyn ToolLocator, tool: ToolKind) -> ToolStatus {
    let path = locator.locate(tool).ok();
    let version = path
        .as_ref()
        .and_then(|p| tool_version_first_line(p, tool.version_arg()));
    ToolStatus {
        tool,
        available: path.is_some(),
        path,
        version,
    }
}

fn tool_version_first_line(program: &std::path::Path, arg: &str) -> Option<String> {
    let output = crate::cmd::command(program).arg(arg).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}
