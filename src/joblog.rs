use crate::job::{now_ms, JobId, QueueKind};
use crate::Result;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const JOB_LOG_ROTATE_BYTES: u64 = 5 * 1024 * 1024;
const JOB_LOG_MAX_BACKUPS: usize = 3;
const JOB_LOG_MAX_AGE_DAYS: u64 = 30;
const JOB_LOG_TOTAL_CAP_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct JobLogRetentionPolicy {
    pub rotate_bytes: u64,
    pub max_backups: usize,
    pub max_age_days: u64,
    pub total_cap_bytes: u64,
}

impl Default for JobLogRetentionPolicy {
    fn default() -> Self {
        Self {
            rotate_bytes: JOB_LOG_ROTATE_BYTES,
            max_backups: JOB_LOG_MAX_BACKUPS,
            max_age_days: JOB_LOG_MAX_AGE_DAYS,
            total_cap_bytes: JOB_LOG_TOTAL_CAP_BYTES,
        }
    }
}

/// Per-job JSONL files under `<base>/logs/jobs`. Writing is best-effort:
/// callers log a warning and carry on when a line cannot be written.
#[derive(Debug, Clone)]
pub struct JobLogs {
    dir: PathBuf,
    policy: JobLogRetentionPolicy,
}

impl JobLogs {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            policy: JobLogRetentionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: JobLogRetentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, queue: QueueKind, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{}-{job_id}.jsonl", queue.as_str()))
    }

    pub fn log_line(
        &self,
        queue: QueueKind,
        job_id: JobId,
        level: &str,
        event: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "queue": queue.as_str(),
            "job_id": job_id,
            "level": level,
            "event": event,
            "data": data
        })
        .to_string();

        let path = self.path_for(queue, job_id);
        std::fs::create_dir_all(&self.dir)?;
        self.rotate_if_needed(&path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    fn rotate_if_needed(&self, path: &Path) -> Result<()> {
        let oversized =
            std::fs::metadata(path).is_ok_and(|meta| meta.len() >= self.policy.rotate_bytes);
        if oversized {
            self.rotate(path)?;
        }
        Ok(())
    }

    /// `x.jsonl` becomes `x.jsonl.1`, each older backup moves up one slot and
    /// whatever would land past `max_backups` is dropped.
    fn rotate(&self, path: &Path) -> std::io::Result<()> {
        let keep = self.policy.max_backups;
        if keep == 0 {
            return remove_if_present(path);
        }
        remove_if_present(&backup_path(path, keep))?;
        for n in (1..keep).rev() {
            let older = backup_path(path, n);
            if older.exists() {
                std::fs::rename(&older, backup_path(path, n + 1))?;
            }
        }
        std::fs::rename(path, backup_path(path, 1))
    }

    /// Drops logs older than the age limit, then the oldest files until the
    /// directory fits under the total cap. Returns how many files were removed.
    pub fn prune(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let cutoff = now
            .checked_sub(Duration::from_secs(self.policy.max_age_days * 24 * 60 * 60))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        let mut candidates: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = match entry {
                Ok(v) => v,
                Err(_) => continue,
            };
            let meta = match entry.metadata() {
                Ok(v) => v,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let path = entry.path();

            if modified < cutoff {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
                continue;
            }
            candidates.push((path, modified, meta.len()));
        }

        candidates.sort_by_key(|(_, modified, _)| *modified);
        let mut total: u64 = candidates.iter().map(|(_, _, size)| *size).sum();
        for (path, _modified, size) in candidates {
            if total <= self.policy.total_cap_bytes {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
            total = total.saturating_sub(size);
        }

        Ok(removed)
    }

    /// Runs `prune` on a detached thread.
    pub fn prune_in_background(&self) {
        let logs = self.clone();
        let spawned = std::thread::Builder::new()
            .name("job-log-prune".to_string())
            .spawn(move || match logs.prune() {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "pruned job logs"),
                Err(e) => tracing::warn!(error = %e, "job log pruning failed"),
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "could not start job log pruning");
        }
    }
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_line_appends_json_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = JobLogs::new(dir.path().join("jobs"));
        let id = JobId::next();

        logs.log_line(QueueKind::Download, id, "info", "spawned", serde_json::json!({"pid": 7}))
            .expect("first");
        logs.log_line(QueueKind::Download, id, "info", "completed", serde_json::Value::Null)
            .expect("second");

        let text = std::fs::read_to_string(logs.path_for(QueueKind::Download, id)).expect("read");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "spawned");
        assert_eq!(lines[0]["data"]["pid"], 7);
        assert_eq!(lines[1]["queue"], "download");
        assert_eq!(lines[1]["job_id"], id.get());
    }

    #[test]
    fn rotation_shifts_backups_and_drops_the_oldest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = JobLogs::new(dir.path().to_path_buf()).with_policy(JobLogRetentionPolicy {
            max_backups: 2,
            ..JobLogRetentionPolicy::default()
        });
        let log = dir.path().join("download-9.jsonl");
        std::fs::write(&log, "live").expect("live");
        std::fs::write(backup_path(&log, 1), "newer").expect("newer");
        std::fs::write(backup_path(&log, 2), "oldest").expect("oldest");

        logs.rotate(&log).expect("rotate");

        assert!(!log.exists());
        assert_eq!(std::fs::read_to_string(backup_path(&log, 1)).expect("1"), "live");
        assert_eq!(std::fs::read_to_string(backup_path(&log, 2)).expect("2"), "newer");
        assert!(!backup_path(&log, 3).exists());
        assert_eq!(backup_path(&log, 2), dir.path().join("download-9.jsonl.2"));
    }

    #[test]
    fn rotation_without_backups_discards_the_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = JobLogs::new(dir.path().to_path_buf()).with_policy(JobLogRetentionPolicy {
            max_backups: 0,
            ..JobLogRetentionPolicy::default()
        });
        let log = dir.path().join("conversion-3.jsonl");
        std::fs::write(&log, "live").expect("live");

        logs.rotate(&log).expect("rotate");
        assert!(!log.exists());
        assert!(!backup_path(&log, 1).exists());
    }

    #[test]
    fn oversized_log_rotates_before_append() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = JobLogs::new(dir.path().to_path_buf()).with_policy(JobLogRetentionPolicy {
            rotate_bytes: 16,
            ..JobLogRetentionPolicy::default()
        });
        let id = JobId::next();
        let path = logs.path_for(QueueKind::Conversion, id);
        std::fs::write(&path, "x".repeat(64)).expect("seed");

        logs.log_line(QueueKind::Conversion, id, "info", "progress", serde_json::json!({"percent": 50}))
            .expect("log");

        assert!(backup_path(&path, 1).exists());
        let fresh = std::fs::read_to_string(&path).expect("read");
        assert_eq!(fresh.lines().count(), 1);
    }

    #[test]
    fn prune_enforces_total_cap_oldest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = JobLogs::new(dir.path().to_path_buf()).with_policy(JobLogRetentionPolicy {
            total_cap_bytes: 10,
            ..JobLogRetentionPolicy::default()
        });
        let old = dir.path().join("download-1.jsonl");
        std::fs::write(&old, "0123456789").expect("old");
        std::thread::sleep(Duration::from_millis(1100));
        let new = dir.path().join("download-2.jsonl");
        std::fs::write(&new, "0123456789").expect("new");

        let removed = logs.prune().expect("prune");
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(new.exists());
    }
}
