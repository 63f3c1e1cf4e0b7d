use crate::locate::ToolKind;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_DOWNLOAD_CAPACITY: usize = 100;
pub const DEFAULT_CONVERSION_CAPACITY: usize = 50;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// App data directory: bundled tools under `tools/`, job logs under `logs/jobs/`.
    pub base_dir: Option<PathBuf>,
    pub download_capacity: usize,
    pub conversion_capacity: usize,
    pub event_capacity: usize,
    /// How often a running invocation checks for termination.
    pub poll_interval_ms: u64,
    /// Explicit tool paths; these win over bundled and `PATH` lookups.
    pub tool_overrides: BTreeMap<ToolKind, PathBuf>,
    pub compatibility_mode: bool,
    /// Passed to yt-dlp `--limit-rate`, e.g. `"4M"`.
    pub rate_limit: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            download_capacity: DEFAULT_DOWNLOAD_CAPACITY,
            conversion_capacity: DEFAULT_CONVERSION_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            tool_overrides: BTreeMap::new(),
            compatibility_mode: false,
            rate_limit: None,
        }
    }
}

impl EngineConfig {
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn paths(&self) -> Option<AppPaths> {
        self.base_dir.clone().map(AppPaths::new)
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_capacity == 0 || self.conversion_capacity == 0 {
            return Err(EngineError::Validation(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::Validation(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(EngineError::Validation(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Missing file means defaults.
pub fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let bytes = std::fs::read(path)?;
    let parsed: EngineConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Validation(format!(
            "failed to parse engine config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn save_engine_config(path: &Path, config: &EngineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_engine_config(&dir.path().join("engine.json")).expect("load");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.download_capacity, 100);
        assert_eq!(config.conversion_capacity, 50);
    }

    #[test]
    fn save_then_load_keeps_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = AppPaths::new(dir.path().to_path_buf()).engine_config_path();
        let mut config = EngineConfig::default().with_base_dir(dir.path());
        config.rate_limit = Some("4M".to_string());
        config
            .tool_overrides
            .insert(ToolKind::Ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));

        save_engine_config(&path, &config).expect("save");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"ffmpeg\""));

        assert_eq!(load_engine_config(&path).expect("load"), config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"download_capacity": 5}"#).expect("write");
        let config = load_engine_config(&path).expect("load");
        assert_eq!(config.download_capacity, 5);
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"event_capacity": 0}"#).expect("write");
        assert!(matches!(
            load_engine_config(&path),
            Err(EngineError::Validation(_))
        ));
        std::fs::write(&path, "not json").expect("write");
        assert!(matches!(
            load_engine_config(&path),
            Err(EngineError::Validation(_))
        ));
    }
}
