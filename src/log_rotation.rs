use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Retention limits for the files written by `tracing_appender::rolling`.
///
/// The appender rotates; this prunes what it leaves behind. The newest file
/// matching a prefix is never removed.
#[derive(Clone, Debug)]
pub struct LogRotationConfig {
    pub max_files: usize,
    pub max_age: Duration,
    pub max_total_size_bytes: u64,
}

impl Default for LogRotationConfig {
    fn default() -> Self {
        Self {
            max_files: 30,
            max_age: Duration::from_secs(10 * 24 * 60 * 60),
            max_total_size_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    len: u64,
}

#[derive(Clone, Debug)]
pub struct LogRotationManager {
    config: LogRotationConfig,
}

impl LogRotationManager {
    pub fn new(config: LogRotationConfig) -> Self {
        Self { config }
    }

    /// Deletes old files whose name starts with `log_prefix`. Returns how many were removed.
    pub fn check_and_rotate(&self, log_dir: &Path, log_prefix: &str) -> std::io::Result<usize> {
        let mut files = Self::find_log_files(log_dir, log_prefix)?;
        if files.len() <= 1 {
            return Ok(0);
        }

        // Oldest first; the last entry is kept unconditionally.
        files.sort_by_key(|f| f.modified);
        let newest = files.pop();

        let now = SystemTime::now();
        let mut total: u64 = files.iter().map(|f| f.len).sum::<u64>()
            + newest.as_ref().map_or(0, |f| f.len);
        let mut remaining = files.len() + 1;
        let mut removed = 0;

        for file in &files {
            let too_old = now
                .duration_since(file.modified)
                .map(|age| age > self.config.max_age)
                .unwrap_or(false);
            let too_big = total > self.config.max_total_size_bytes;
            let too_many = remaining > self.config.max_files;
            if !(too_old || too_big || too_many) {
                continue;
            }

            match fs::remove_file(&file.path) {
                Ok(()) => {
                    total = total.saturating_sub(file.len);
                    remaining -= 1;
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to remove old log file {}: {}", file.path.display(), e);
                }
            }
        }

        if removed > 0 {
            tracing::info!("Log retention removed {} file(s) for {}", removed, log_prefix);
        }
        Ok(removed)
    }

    fn find_log_files(log_dir: &Path, log_prefix: &str) -> std::io::Result<Vec<LogFile>> {
        let mut files = Vec::new();
        if !log_dir.exists() {
            return Ok(files);
        }

        for entry in fs::read_dir(log_dir)? {
            let entry = entry?;
            let path = entry.path();
            let matches = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with(log_prefix))
                .unwrap_or(false);
            if !matches || !path.is_file() {
                continue;
            }
            // Files we cannot stat are left alone.
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            files.push(LogFile {
                path,
                modified,
                len: metadata.len(),
            });
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![b'x'; bytes]).unwrap();
        path
    }

    #[test]
    fn test_default_retention_is_ten_days() {
        let config = LogRotationConfig::default();
        assert_eq!(config.max_age, Duration::from_secs(864_000));
        assert_eq!(config.max_files, 30);
    }

    #[test]
    fn test_max_files_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            touch(dir.path(), &format!("toolfix.log.2026-01-0{}", i + 1), 10);
            std::thread::sleep(Duration::from_millis(20));
        }
        let other = touch(dir.path(), "unrelated.txt", 10);

        let manager = LogRotationManager::new(LogRotationConfig {
            max_files: 2,
            ..LogRotationConfig::default()
        });
        let removed = manager.check_and_rotate(dir.path(), "toolfix.log").unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("toolfix.log.2026-01-04").exists());
        assert!(dir.path().join("toolfix.log.2026-01-03").exists());
        assert!(!dir.path().join("toolfix.log.2026-01-01").exists());
        assert!(other.exists());
    }

    #[test]
    fn test_size_limit_never_removes_last_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "app.log.a", 100);
        std::thread::sleep(Duration::from_millis(20));
        touch(dir.path(), "app.log.b", 100);

        let manager = LogRotationManager::new(LogRotationConfig {
            max_total_size_bytes: 10,
            ..LogRotationConfig::default()
        });
        assert_eq!(manager.check_and_rotate(dir.path(), "app.log").unwrap(), 1);
        assert!(dir.path().join("app.log.b").exists());
    }

    #[test]
    fn test_missing_directory_is_fine() {
        let manager = LogRotationManager::new(LogRotationConfig::default());
        let removed = manager
            .check_and_rotate(Path::new("/nonexistent/toolfix-logs"), "toolfix.log")
            .unwrap();
        assert_eq!(removed, 0);
    }
}
