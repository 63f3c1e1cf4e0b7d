use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.config_dir().join("engine.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn job_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("jobs")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ytdlp_dir(&self) -> PathBuf {
        self.tools_dir().join("yt-dlp")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        exe_path(&self.ffmpeg_dir(), "ffmpeg")
    }

    pub fn ffprobe_bin_path(&self) -> PathBuf {
        exe_path(&self.ffmpeg_dir(), "ffprobe")
    }

    pub fn ytdlp_bin_path(&self) -> PathBuf {
        exe_path(&self.ytdlp_dir(), "yt-dlp")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.job_logs_dir())?;
        std::fs::create_dir_all(self.tools_dir())?;
        Ok(())
    }
}

fn exe_path(dir: &Path, name: &str) -> PathBuf {
    let mut path = dir.join(name);
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_paths_live_under_tools_dir() {
        let paths = AppPaths::new(PathBuf::from("/data/app"));
        assert!(paths.ytdlp_bin_path().starts_with("/data/app/tools/yt-dlp"));
        assert!(paths.ffprobe_bin_path().starts_with("/data/app/tools/ffmpeg"));
        assert_eq!(paths.job_logs_dir(), PathBuf::from("/data/app/logs/jobs"));
    }
}
