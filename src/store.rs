//! Rotating log store for sensor readings.
//!
//! Readings are buffered in memory and written as CSV rows to an active file
//! named from the current local time. After every capacity-triggered flush
//! the store checks its rotation policy; a rotated file is compressed into
//! the archive directory, expired archives are pruned, and a new active file
//! is opened.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::config::{ConfigError, StoreConfig};
use crate::query::ReadingQuery;
use crate::reading::Reading;

/// Header row written at the top of every new log file.
pub const LOG_HEADER: [&str; 4] = ["timestamp", "sensor_id", "value", "unit"];

/// Errors raised by the log store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode rows: {0}")]
    Encode(#[from] csv::Error),

    #[error("log store is stopped")]
    Stopped,
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Narrow write interface the collector depends on.
pub trait ReadingSink: Send {
    /// Accept one reading. Implementations may buffer.
    fn append(&mut self, reading: Reading) -> Result<(), StorageError>;

    /// Make every accepted reading durable.
    fn flush(&mut self) -> Result<(), StorageError>;
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReadingSink for NullSink {
    fn append(&mut self, _reading: Reading) -> Result<(), StorageError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Sink that keeps every reading in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub readings: Vec<Reading>,
}

impl ReadingSink for MemorySink {
    fn append(&mut self, reading: Reading) -> Result<(), StorageError> {
        self.readings.push(reading);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// One CSV row as stored on disk.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LogRow {
    pub timestamp: String,
    pub sensor_id: String,
    pub value: f64,
    pub unit: String,
}

impl LogRow {
    pub(crate) fn from_reading(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            sensor_id: reading.sensor_id.clone(),
            value: reading.value,
            unit: reading.unit.clone(),
        }
    }

    /// Convert back into a reading. Returns `None` for rows that do not hold one.
    pub(crate) fn into_reading(self) -> Option<Reading> {
        let timestamp = parse_timestamp(&self.timestamp)?;
        let reading = Reading::new(self.sensor_id, timestamp, self.value, self.unit);
        reading.validate().ok()?;
        Some(reading)
    }
}

/// Parse an RFC 3339 timestamp, or a naive ISO-8601 one interpreted as UTC.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Counters describing store activity since it was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of flushes that wrote at least one row
    pub flushes: u64,

    /// Total number of rows written to disk
    pub rows_written: u64,

    /// Number of completed rotations
    pub rotations: u64,

    /// Number of rotations that failed and left the active file in place
    pub failed_rotations: u64,

    /// Number of attempts to open a new active file that failed
    pub failed_reopens: u64,

    /// Number of expired archives removed
    pub archives_pruned: u64,
}

/// The file currently receiving rows.
#[derive(Debug)]
struct ActiveFile {
    path: PathBuf,
    file: File,
    opened_at: Instant,
}

/// Buffered, rotating, archiving store for readings.
///
/// # Example
///
/// ```no_run
/// use sensor_telemetry::config::StoreConfig;
/// use sensor_telemetry::reading::Reading;
/// use sensor_telemetry::store::LogStore;
///
/// let mut store = LogStore::open(StoreConfig::new("logs")).expect("Failed to open store");
/// store.append(Reading::now("T1", 21.5, "°C")).expect("Failed to append");
/// store.stop().expect("Failed to stop store");
/// ```
#[derive(Debug)]
pub struct LogStore {
    config: StoreConfig,
    /// Set between `start` and `stop`, even while no file could be opened
    running: bool,
    active: Option<ActiveFile>,
    buffer: Vec<Reading>,
    line_count: u64,
    stats: StoreStats,
}

impl LogStore {
    /// Validate the configuration and create the log and archive directories.
    ///
    /// The store is created stopped; call [`LogStore::start`] to open the
    /// active file.
    pub fn new(config: StoreConfig) -> Result<Self, StorageError> {
        config.validate()?;

        fs::create_dir_all(&config.log_dir).map_err(|e| StorageError::io(&config.log_dir, e))?;
        fs::create_dir_all(&config.archive_dir)
            .map_err(|e| StorageError::io(&config.archive_dir, e))?;

        Ok(Self {
            buffer: Vec::with_capacity(config.buffer_size),
            config,
            running: false,
            active: None,
            line_count: 0,
            stats: StoreStats::default(),
        })
    }

    /// Create and start a store in one step.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut store = Self::new(config)?;
        store.start()?;
        Ok(store)
    }

    /// Open the active file for the current time.
    ///
    /// Writes the header row if the file did not exist. Starting a store that
    /// is already started is a no-op.
    pub fn start(&mut self) -> Result<(), StorageError> {
        if self.active.is_none() {
            self.open_file(self.current_file_path())?;
        }
        self.running = true;
        Ok(())
    }

    /// Open the file for the current time if a rotation left the store without one.
    fn reopen_if_needed(&mut self) -> Result<(), StorageError> {
        if !self.running {
            return Err(StorageError::Stopped);
        }
        if self.active.is_some() {
            return Ok(());
        }

        let path = self.current_file_path();
        self.open_file(path).map_err(|e| {
            self.stats.failed_reopens += 1;
            e
        })
    }

    /// Make `path` the active file, writing the header if it is new.
    fn open_file(&mut self, path: PathBuf) -> Result<(), StorageError> {
        let is_new = !path.exists();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        if is_new {
            let mut header = csv::Writer::from_writer(Vec::new());
            header.write_record(LOG_HEADER)?;
            let bytes = header
                .into_inner()
                .map_err(|e| StorageError::io(&path, e.into_error()))?;
            file.write_all(&bytes)
                .and_then(|_| file.sync_data())
                .map_err(|e| StorageError::io(&path, e))?;
        }

        info!(path = %path.display(), new_file = is_new, "Opened log file");

        self.active = Some(ActiveFile {
            path,
            file,
            opened_at: Instant::now(),
        });
        self.line_count = 0;
        Ok(())
    }

    /// Buffer a reading, flushing and checking rotation once the buffer is full.
    ///
    /// While no active file can be opened the reading is refused with the
    /// I/O error, and opening is retried on the next call.
    pub fn append(&mut self, reading: Reading) -> Result<(), StorageError> {
        self.reopen_if_needed()?;

        self.buffer.push(reading);
        self.line_count += 1;

        if self.buffer.len() >= self.config.buffer_size {
            self.flush()?;

            if self.should_rotate() {
                if let Err(e) = self.rotate() {
                    // The flushed rows are on disk either way.
                    match self.active_path() {
                        Some(path) => error!(
                            path = %path.display(),
                            error = %e,
                            "Rotation failed, keeping current log file"
                        ),
                        None => error!(
                            error = %e,
                            "Rotated log file but could not open the next one, retrying on next append"
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    /// Write buffered readings to the active file and sync them to disk.
    ///
    /// The buffer is only cleared once the write succeeded, so a failed flush
    /// can be retried without losing readings.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.reopen_if_needed()?;
        let active = self.active.as_mut().ok_or(StorageError::Stopped)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for reading in &self.buffer {
            writer.serialize(LogRow::from_reading(reading))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| StorageError::io(&active.path, e.into_error()))?;

        active
            .file
            .write_all(&bytes)
            .and_then(|_| active.file.sync_data())
            .map_err(|e| StorageError::io(&active.path, e))?;

        let rows = self.buffer.len();
        self.buffer.clear();
        self.stats.flushes += 1;
        self.stats.rows_written += rows as u64;

        debug!(rows = rows, path = %active.path.display(), "Flushed log buffer");
        Ok(())
    }

    /// Whether any rotation threshold has been reached.
    fn should_rotate(&self) -> bool {
        let Some(active) = &self.active else {
            return false;
        };

        if active.opened_at.elapsed() >= self.config.rotate_every() {
            debug!(path = %active.path.display(), "Rotation due: file age");
            return true;
        }

        match fs::metadata(&active.path) {
            Ok(meta) if meta.len() >= self.config.max_size_bytes() => {
                debug!(path = %active.path.display(), size = meta.len(), "Rotation due: file size");
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(path = %active.path.display(), error = %e, "Cannot read log file size");
            }
        }

        if let Some(limit) = self.config.rotate_after_lines {
            if self.line_count >= limit {
                debug!(path = %active.path.display(), lines = self.line_count, "Rotation due: line count");
                return true;
            }
        }

        false
    }

    /// Archive the active file and open a fresh one.
    ///
    /// The plain file is only deleted after its archive has been fully
    /// written. If archiving or deleting fails, the archive is discarded,
    /// the file stays active and `StorageError::Archive` is returned. If the
    /// next file cannot be opened, the rotation still counts and the I/O
    /// error is returned; opening is retried by the next append or flush.
    pub fn rotate(&mut self) -> Result<(), StorageError> {
        self.flush()?;
        let path = match &self.active {
            Some(active) => active.path.clone(),
            None => return Err(StorageError::Stopped),
        };

        let archive_path = match archive::compress_file(&path, &self.config.archive_dir) {
            Ok(archive_path) => archive_path,
            Err(source) => {
                self.stats.failed_rotations += 1;
                return Err(StorageError::Archive { path, source });
            }
        };

        // Close the handle before removing the file.
        let opened_at = self.active.take().map(|active| active.opened_at);
        if let Err(source) = archive::commit_archive(&path, &archive_path) {
            self.stats.failed_rotations += 1;
            let line_count = self.line_count;
            self.open_file(path.clone())?;
            self.line_count = line_count;
            if let (Some(active), Some(opened_at)) = (self.active.as_mut(), opened_at) {
                active.opened_at = opened_at;
            }
            return Err(StorageError::Archive { path, source });
        }

        match archive::prune_archives(&self.config.archive_dir, self.config.retention()) {
            Ok(removed) => self.stats.archives_pruned += removed as u64,
            Err(e) => {
                warn!(dir = %self.config.archive_dir.display(), error = %e, "Archive cleanup failed");
            }
        }

        self.stats.rotations += 1;
        info!(
            path = %path.display(),
            archive = %archive_path.display(),
            "Rotated log file"
        );

        self.reopen_if_needed()
    }

    /// Flush the buffer and close the active file. Stopping twice is a no-op.
    pub fn stop(&mut self) -> Result<(), StorageError> {
        if !self.running {
            return Ok(());
        }
        self.flush()?;

        if let Some(active) = self.active.take() {
            info!(path = %active.path.display(), "Closed log file");
        }
        self.running = false;
        Ok(())
    }

    /// Lazily read stored readings with timestamps in `[start, end]`.
    ///
    /// Covers the plain log files in the log directory and every archive.
    /// Buffered readings that were not flushed yet are not included.
    pub fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sensor_id: Option<&str>,
    ) -> Result<ReadingQuery, StorageError> {
        ReadingQuery::new(
            &self.config.log_dir,
            &self.config.archive_dir,
            self.log_extension().as_deref(),
            start,
            end,
            sensor_id,
        )
    }

    /// Path the active file has, or would have if started now.
    fn current_file_path(&self) -> PathBuf {
        let name = Local::now().format(&self.config.filename_pattern).to_string();
        self.config.log_dir.join(name)
    }

    /// Extension of the files the pattern produces, if any.
    fn log_extension(&self) -> Option<String> {
        self.current_file_path()
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_string)
    }

    /// Path of the active file, if the store is started.
    pub fn active_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    /// Whether the store is started. A started store may be between files
    /// after a rotation whose next file could not be opened yet.
    pub fn is_started(&self) -> bool {
        self.running
    }

    /// Readings appended since the active file was opened.
    pub fn line_count(&self) -> u64 {
        self.line_count
    }

    /// Readings waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Store activity counters.
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl ReadingSink for LogStore {
    fn append(&mut self, reading: Reading) -> Result<(), StorageError> {
        LogStore::append(self, reading)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        LogStore::flush(self)
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, dropped = self.buffer.len(), "Failed to flush log store on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::time::{Duration, SystemTime};

    fn test_config(dir: &Path) -> StoreConfig {
        StoreConfig {
            filename_pattern: "readings_%Y%m%d.csv".to_string(),
            buffer_size: 3,
            rotate_every_hours: 24,
            max_size_mb: 100.0,
            rotate_after_lines: None,
            retention_days: 7,
            ..StoreConfig::new(dir.join("logs"))
        }
    }

    fn reading(sensor: &str, minute: u32, value: f64) -> Reading {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 10, minute, 0).unwrap();
        Reading::new(sensor, ts, value, "°C")
    }

    fn all_readings(store: &LogStore) -> Vec<Reading> {
        let start = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
        store.query(start, end, None).unwrap().collect()
    }

    fn plain_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_start_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let mut store = LogStore::open(config.clone()).unwrap();
        let path = store.active_path().unwrap().to_path_buf();
        store.stop().unwrap();

        // Reopening an existing file must not add a second header.
        let mut store = LogStore::open(config).unwrap();
        store.stop().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "timestamp,sensor_id,value,unit\n");
    }

    #[test]
    fn test_append_then_stop_is_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(test_config(dir.path())).unwrap();

        let r = reading("T1", 5, 21.25);
        store.append(r.clone()).unwrap();
        assert_eq!(store.buffered(), 1);
        store.stop().unwrap();

        let found: Vec<Reading> = store.query(r.timestamp, r.timestamp, None).unwrap().collect();
        assert_eq!(found, vec![r]);
    }

    #[test]
    fn test_buffer_flushes_exactly_once_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(test_config(dir.path())).unwrap();

        store.append(reading("T1", 1, 1.0)).unwrap();
        store.append(reading("T1", 2, 2.0)).unwrap();
        assert_eq!(store.stats().flushes, 0);
        assert!(all_readings(&store).is_empty());

        store.append(reading("T1", 3, 3.0)).unwrap();
        assert_eq!(store.stats().flushes, 1);
        assert_eq!(store.stats().rows_written, 3);
        assert_eq!(store.buffered(), 0);

        let values: Vec<f64> = all_readings(&store).iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_append_to_stopped_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::new(test_config(dir.path())).unwrap();

        assert!(matches!(
            store.append(reading("T1", 1, 1.0)),
            Err(StorageError::Stopped)
        ));

        store.start().unwrap();
        store.append(reading("T1", 1, 1.0)).unwrap();
        store.stop().unwrap();
        store.stop().unwrap();
        assert!(!store.is_started());
    }

    #[test]
    fn test_line_threshold_rotation_archives_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            buffer_size: 2,
            rotate_after_lines: Some(4),
            ..test_config(dir.path())
        };
        let log_dir = config.log_dir.clone();
        let archive_dir = config.archive_dir.clone();
        let mut store = LogStore::open(config).unwrap();
        let first_path = store.active_path().unwrap().to_path_buf();

        for minute in 0..3 {
            store.append(reading("T1", minute, minute as f64)).unwrap();
        }
        assert_eq!(store.line_count(), 3);
        assert_eq!(store.stats().rotations, 0);

        store.append(reading("T1", 3, 3.0)).unwrap();
        assert_eq!(store.stats().rotations, 1);
        assert_eq!(store.line_count(), 0);

        let archives = archive::list_archives(&archive_dir).unwrap();
        let first_name = first_path.file_name().unwrap().to_str().unwrap();
        assert_eq!(archives, vec![archive_dir.join(archive::archive_name(first_name))]);

        // The new active file only holds the header; the rotated rows live in the archive.
        let active = store.active_path().unwrap().to_path_buf();
        assert_eq!(plain_files(&log_dir), vec![active.clone()]);
        assert_eq!(
            fs::read_to_string(&active).unwrap(),
            "timestamp,sensor_id,value,unit\n"
        );
        assert_eq!(all_readings(&store).len(), 4);
    }

    #[test]
    fn test_repeated_rotation_keeps_every_archive() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            buffer_size: 1,
            rotate_after_lines: Some(1),
            ..test_config(dir.path())
        };
        let archive_dir = config.archive_dir.clone();
        let mut store = LogStore::open(config).unwrap();

        for minute in 0..3 {
            store.append(reading("T1", minute, minute as f64)).unwrap();
        }

        assert_eq!(store.stats().rotations, 3);
        assert_eq!(archive::list_archives(&archive_dir).unwrap().len(), 3);

        let mut values: Vec<f64> = all_readings(&store).iter().map(|r| r.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_size_threshold_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            buffer_size: 1,
            max_size_mb: 0.0,
            ..test_config(dir.path())
        };
        let mut store = LogStore::open(config).unwrap();

        store.append(reading("T1", 0, 1.0)).unwrap();
        assert_eq!(store.stats().rotations, 1);
    }

    #[test]
    fn test_time_threshold_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            buffer_size: 1,
            rotate_every_hours: 0,
            ..test_config(dir.path())
        };
        let mut store = LogStore::open(config).unwrap();

        store.append(reading("T1", 0, 1.0)).unwrap();
        assert_eq!(store.stats().rotations, 1);
    }

    #[test]
    fn test_rotation_prunes_expired_archives() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            buffer_size: 1,
            rotate_after_lines: Some(1),
            retention_days: 2,
            ..test_config(dir.path())
        };
        let archive_dir = config.archive_dir.clone();
        let mut store = LogStore::open(config).unwrap();

        let expired = archive_dir.join("expired.gz");
        let recent = archive_dir.join("recent.gz");
        fs::write(&expired, b"").unwrap();
        fs::write(&recent, b"").unwrap();
        let age = |path: &Path, days: u64| {
            let file = File::options().write(true).open(path).unwrap();
            file.set_modified(SystemTime::now() - Duration::from_secs(days * 86_400))
                .unwrap();
        };
        age(&expired, 3);
        age(&recent, 1);

        store.append(reading("T1", 0, 1.0)).unwrap();

        assert!(!expired.exists());
        assert!(recent.exists());
        assert_eq!(store.stats().archives_pruned, 1);
    }

    #[test]
    fn test_failed_archive_keeps_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            buffer_size: 1,
            rotate_after_lines: Some(1),
            ..test_config(dir.path())
        };
        let archive_dir = config.archive_dir.clone();
        let mut store = LogStore::open(config).unwrap();
        let active = store.active_path().unwrap().to_path_buf();

        // A plain file where the archive directory should be makes archiving fail.
        fs::remove_dir_all(&archive_dir).unwrap();
        fs::write(&archive_dir, b"blocker").unwrap();

        store.append(reading("T1", 0, 1.0)).unwrap();
        assert_eq!(store.stats().failed_rotations, 1);
        assert_eq!(store.stats().rotations, 0);
        assert_eq!(store.active_path(), Some(active.as_path()));
        assert!(active.exists());

        // Once the archive directory is usable again the next check rotates.
        fs::remove_file(&archive_dir).unwrap();
        store.append(reading("T1", 1, 2.0)).unwrap();
        assert_eq!(store.stats().rotations, 1);
        assert_eq!(all_readings(&store).len(), 2);
    }

    #[test]
    fn test_failed_reopen_is_retried_on_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = "r_%Y%m%d%H%M%S.csv";
        let config = StoreConfig {
            filename_pattern: pattern.to_string(),
            buffer_size: 1,
            rotate_after_lines: Some(2),
            ..test_config(dir.path())
        };
        let log_dir = config.log_dir.clone();
        let mut store = LogStore::open(config).unwrap();
        let first = store.active_path().unwrap().to_path_buf();
        store.append(reading("T1", 0, 0.0)).unwrap();

        // Directories under the names of the coming seconds make opening the next file fail.
        std::thread::sleep(Duration::from_millis(1100));
        let now = Local::now();
        let blockers: Vec<PathBuf> = (-1..=30)
            .map(|secs| {
                let name = (now + ChronoDuration::seconds(secs)).format(pattern).to_string();
                log_dir.join(name)
            })
            .filter(|path| *path != first)
            .collect();
        for blocker in &blockers {
            fs::create_dir(blocker).unwrap();
        }

        // The rotation itself succeeds; only the next file is missing.
        store.append(reading("T1", 1, 1.0)).unwrap();
        assert!(store.is_started());
        assert!(store.active_path().is_none());
        assert!(!first.exists());
        assert_eq!(store.stats().rotations, 1);
        assert_eq!(store.stats().failed_rotations, 0);
        assert_eq!(store.stats().failed_reopens, 1);

        assert!(matches!(
            store.append(reading("T1", 2, 2.0)),
            Err(StorageError::Io { .. })
        ));
        assert_eq!(store.stats().failed_reopens, 2);

        for blocker in &blockers {
            fs::remove_dir(blocker).unwrap();
        }
        store.append(reading("T1", 3, 3.0)).unwrap();
        assert!(store.active_path().is_some());
        store.stop().unwrap();

        let mut values: Vec<f64> = all_readings(&store).iter().map(|r| r.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![0.0, 1.0, 3.0]);
    }

    #[test]
    fn test_failed_flush_keeps_buffer_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(test_config(dir.path())).unwrap();
        let path = store.active_path().unwrap().to_path_buf();

        store.append(reading("T1", 1, 1.0)).unwrap();
        store.append(reading("T1", 2, 2.0)).unwrap();

        // A read-only handle makes the write fail.
        store.active.as_mut().unwrap().file = File::open(&path).unwrap();
        assert!(matches!(store.flush(), Err(StorageError::Io { .. })));
        assert_eq!(store.buffered(), 2);
        assert_eq!(store.stats().flushes, 0);

        store.active.as_mut().unwrap().file = OpenOptions::new().append(true).open(&path).unwrap();
        store.flush().unwrap();
        assert_eq!(store.buffered(), 0);
        assert_eq!(store.stats().rows_written, 2);

        let values: Vec<f64> = all_readings(&store).iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_query_filters_range_and_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(test_config(dir.path())).unwrap();

        store.append(reading("T1", 0, 1.0)).unwrap();
        store.append(reading("H1", 10, 2.0)).unwrap();
        store.append(reading("T1", 20, 3.0)).unwrap();
        store.append(reading("T1", 30, 4.0)).unwrap();
        store.stop().unwrap();

        let start = Utc.with_ymd_and_hms(2024, 6, 1, 10, 10, 0).unwrap();
        let end = start + ChronoDuration::minutes(10);

        let in_range: Vec<f64> = store.query(start, end, None).unwrap().map(|r| r.value).collect();
        assert_eq!(in_range, vec![2.0, 3.0]);

        let t1_only: Vec<f64> = store
            .query(start, end, Some("T1"))
            .unwrap()
            .map(|r| r.value)
            .collect();
        assert_eq!(t1_only, vec![3.0]);
    }

    #[test]
    fn test_query_skips_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let log_dir = config.log_dir.clone();
        let mut store = LogStore::open(config).unwrap();
        store.append(reading("T1", 0, 1.0)).unwrap();
        store.stop().unwrap();

        fs::write(
            log_dir.join("legacy.csv"),
            "timestamp,sensor_id,value,unit\n\
             2024-06-01T10:01:00,L1,350.5,lux\n\
             not-a-time,L1,1.0,lux\n\
             2024-06-01T10:02:00Z,L1,abc,lux\n\
             2024-06-01T10:03:00Z,L1\n\
             2024-06-01T10:04:00Z,,5.0,lux\n\
             2024-06-01T10:05:00+00:00,L1,360.0,lux\n",
        )
        .unwrap();

        let mut values: Vec<f64> = all_readings(&store).iter().map(|r| r.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![1.0, 350.5, 360.0]);
    }

    #[test]
    fn test_timestamps_survive_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(test_config(dir.path())).unwrap();

        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
            + ChronoDuration::nanoseconds(123_456_789);
        let r = Reading::new("P1", ts, 1013.1, "hPa");
        store.append(r.clone()).unwrap();
        store.stop().unwrap();

        assert_eq!(all_readings(&store), vec![r]);
    }

    #[test]
    fn test_drop_flushes_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        {
            let mut store = LogStore::open(config.clone()).unwrap();
            store.append(reading("T1", 0, 7.0)).unwrap();
        }

        let store = LogStore::new(config).unwrap();
        assert_eq!(all_readings(&store).len(), 1);
    }

    #[test]
    fn test_invalid_config_aborts_construction() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            buffer_size: 0,
            ..test_config(dir.path())
        };

        assert!(matches!(LogStore::new(config), Err(StorageError::Config(_))));
        assert!(!dir.path().join("logs").exists());
    }

    #[test]
    fn test_sinks() {
        let mut sink = MemorySink::default();
        sink.append(reading("T1", 0, 1.0)).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.readings.len(), 1);

        let mut null = NullSink;
        assert!(null.append(reading("T1", 0, 1.0)).is_ok());
        assert!(null.flush().is_ok());
    }
}
