use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Installs the global tracing subscriber: stderr always, plus a rotating file
/// sink when `log_dir`/`log_file` are configured. The returned guard must be
/// held for the lifetime of the process or buffered file writes are dropped.
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(true);

    match (&config.log_dir, &config.log_file) {
        (Some(dir), Some(file)) => {
            let path = dir.join(file);
            match SizeRotatingAppender::new(path, config.log_max_bytes, config.log_backup_count) {
                Ok(appender) => {
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
                    tracing_subscriber::registry().with(filter).with(stderr_layer).with(file_layer).init();
                    Some(guard)
                }
                Err(e) => {
                    tracing_subscriber::registry().with(filter).with(stderr_layer).init();
                    tracing::error!(error = %e, "failed to open log file, logging to stderr only");
                    None
                }
            }
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(stderr_layer).init();
            None
        }
    }
}

/// Rotates `path` to `path.1`, `path.2`, ... once it exceeds `max_bytes`,
/// pruning the oldest rotated file once there are more than `backup_count`.
struct SizeRotatingAppender {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
    file: File,
    written: u64,
}

impl SizeRotatingAppender {
    fn new(path: PathBuf, max_bytes: u64, backup_count: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, max_bytes, backup_count, file, written })
    }

    fn rotated_path(&self, index: u32) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        if self.backup_count == 0 {
            self.file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        let oldest = self.rotated_path(self.backup_count);
        let _ = fs::remove_file(&oldest);
        for index in (1..self.backup_count).rev() {
            let from = self.rotated_path(index);
            if from.exists() {
                let _ = fs::rename(&from, self.rotated_path(index + 1));
            }
        }
        let _ = fs::rename(&self.path, self.rotated_path(1));

        self.file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for SizeRotatingAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0 && self.written >= self.max_bytes {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_once_max_bytes_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vman.log");
        let mut appender = SizeRotatingAppender::new(path.clone(), 8, 2).unwrap();

        appender.write_all(b"12345678").unwrap();
        appender.write_all(b"more").unwrap();

        assert!(path.exists());
        assert!(dir.path().join("vman.log.1").exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "more");
    }

    #[test]
    fn prunes_beyond_backup_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vman.log");
        let mut appender = SizeRotatingAppender::new(path.clone(), 4, 1).unwrap();

        appender.write_all(b"aaaa").unwrap();
        appender.write_all(b"bbbb").unwrap();
        appender.write_all(b"cccc").unwrap();

        assert!(dir.path().join("vman.log.1").exists());
        assert!(!dir.path().join("vman.log.2").exists());
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested").join("vman.log");
        SizeRotatingAppender::new(nested.clone(), 1024, 5).unwrap();
        assert!(nested.exists());
    }
}
