use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;

use crate::{
    config::models::AuditLogOptions, core::audit::EncodedBatch, metrics,
    ports::audit_backend::AuditBackend,
};

const BYTES_PER_MB: u64 = 1024 * 1024;
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const BACKUP_TIMESTAMP: &str = "%Y-%m-%dT%H-%M-%S%.9f";

/// Appends every batch as JSON lines to a size-rotated file.
pub struct LogFileBackend {
    file: Arc<Mutex<RotatingFile>>,
}

impl LogFileBackend {
    pub fn new(options: &AuditLogOptions) -> Self {
        let file = RotatingFile::new(
            &options.path,
            options.max_size_mb.saturating_mul(BYTES_PER_MB),
            Duration::from_secs(options.max_age_days.saturating_mul(SECONDS_PER_DAY)),
            options.max_backups,
        );
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

#[async_trait]
impl AuditBackend for LogFileBackend {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn process(&self, batch: Arc<EncodedBatch>) {
        let file = self.file.clone();
        let lines = batch.to_ndjson();
        let written = tokio::task::spawn_blocking(move || {
            let mut file = match file.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            file.write(lines.as_bytes())
        })
        .await;

        match written {
            Ok(Ok(())) => metrics::increment_audit_batches(self.name(), "delivered"),
            Ok(Err(e)) => {
                metrics::increment_audit_batches(self.name(), "failed");
                tracing::error!(events = batch.len(), error = %e, "Failed to write audit batch");
            }
            Err(e) => {
                metrics::increment_audit_batches(self.name(), "failed");
                tracing::error!(error = %e, "Audit log writer task failed");
            }
        }
    }
}

/// A file that moves aside to `{stem}-{timestamp}{ext}` once it would grow past
/// `max_bytes`. Zero disables the matching limit.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_age: Duration,
    max_backups: usize,
    file: Option<File>,
    size: u64,
}

impl RotatingFile {
    pub fn new(path: impl AsRef<Path>, max_bytes: u64, max_age: Duration, max_backups: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes,
            max_age,
            max_backups,
            file: None,
            size: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.file.is_none() {
            self.open()?;
        }
        if self.max_bytes > 0 && self.size > 0 && self.size + data.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("audit log is not open"));
        };
        file.write_all(data)?;
        file.flush()?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn open(&mut self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        let backup = self.backup_path();
        fs::rename(&self.path, &backup)?;
        tracing::info!(backup = %backup.display(), "Rotated audit log");
        self.open()?;
        if let Err(e) = self.prune() {
            tracing::warn!(error = %e, "Failed to prune audit log backups");
        }
        Ok(())
    }

    fn stem_and_ext(&self) -> (String, String) {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audit".to_string());
        let ext = self
            .path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        (stem, ext)
    }

    fn backup_path(&self) -> PathBuf {
        let (stem, ext) = self.stem_and_ext();
        let timestamp = chrono::Utc::now().format(BACKUP_TIMESTAMP);
        let mut candidate = self.path.with_file_name(format!("{stem}-{timestamp}{ext}"));
        let mut attempt = 1;
        while candidate.exists() {
            candidate = self
                .path
                .with_file_name(format!("{stem}-{timestamp}-{attempt}{ext}"));
            attempt += 1;
        }
        candidate
    }

    /// Backups, oldest first.
    fn backups(&self) -> io::Result<Vec<(SystemTime, PathBuf)>> {
        let (stem, ext) = self.stem_and_ext();
        let prefix = format!("{stem}-");
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut backups = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stamp) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&ext))
            else {
                continue;
            };
            if !is_backup_stamp(stamp) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            backups.push((modified, entry.path()));
        }
        backups.sort();
        Ok(backups)
    }

    fn prune(&self) -> io::Result<()> {
        let mut backups = self.backups()?;
        if !self.max_age.is_zero() {
            let now = SystemTime::now();
            backups.retain(|(modified, path)| {
                let expired = now
                    .duration_since(*modified)
                    .is_ok_and(|age| age > self.max_age);
                if expired {
                    remove_backup(path);
                }
                !expired
            });
        }
        if self.max_backups > 0 && backups.len() > self.max_backups {
            let excess = backups.len() - self.max_backups;
            for (_, path) in backups.drain(..excess) {
                remove_backup(&path);
            }
        }
        Ok(())
    }
}

fn remove_backup(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(backup = %path.display(), "Removed audit log backup"),
        Err(e) => tracing::warn!(backup = %path.display(), error = %e, "Failed to remove audit log backup"),
    }
}

/// Matches `{timestamp}` or `{timestamp}-{attempt}` as written by `backup_path`.
fn is_backup_stamp(stamp: &str) -> bool {
    let parses = |s: &str| chrono::NaiveDateTime::parse_from_str(s, BACKUP_TIMESTAMP).is_ok();
    if parses(stamp) {
        return true;
    }
    match stamp.rsplit_once('-') {
        Some((timestamp, attempt)) => {
            !attempt.is_empty() && attempt.bytes().all(|b| b.is_ascii_digit()) && parses(timestamp)
        }
        None => false,
    }
}
