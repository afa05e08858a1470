//! Range queries over plain log files and archives.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::archive;
use crate::reading::Reading;
use crate::store::{LogRow, StorageError};

/// Where a query reads rows from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Plain(PathBuf),
    Archive(PathBuf),
}

impl Source {
    fn path(&self) -> &Path {
        match self {
            Source::Plain(path) | Source::Archive(path) => path,
        }
    }

    fn open(&self) -> io::Result<Box<dyn Read>> {
        match self {
            Source::Plain(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
            Source::Archive(path) => Ok(Box::new(archive::open_archive(path)?)),
        }
    }
}

type Rows = csv::DeserializeRecordsIntoIter<Box<dyn Read>, LogRow>;

/// Lazy iterator over stored readings in a time range.
///
/// The set of files is fixed when the query is created; each file is only
/// opened once the previous one is exhausted. Rows that cannot be parsed are
/// skipped, as are files that cannot be opened.
pub struct ReadingQuery {
    sources: VecDeque<Source>,
    current: Option<(PathBuf, Rows)>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sensor_id: Option<String>,
    skipped_rows: u64,
}

impl ReadingQuery {
    /// Build a query over `log_dir` and `archive_dir`.
    ///
    /// Plain files are the regular files in `log_dir` with the given
    /// extension (every regular file when `extension` is `None`).
    pub fn new(
        log_dir: &Path,
        archive_dir: &Path,
        extension: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sensor_id: Option<&str>,
    ) -> Result<Self, StorageError> {
        let mut sources: VecDeque<Source> = list_plain_files(log_dir, extension)
            .map_err(|source| StorageError::Io {
                path: log_dir.to_path_buf(),
                source,
            })?
            .into_iter()
            .map(Source::Plain)
            .collect();

        let archives = archive::list_archives(archive_dir).map_err(|source| StorageError::Io {
            path: archive_dir.to_path_buf(),
            source,
        })?;
        sources.extend(archives.into_iter().map(Source::Archive));

        debug!(sources = sources.len(), %start, %end, sensor_id = ?sensor_id, "Starting log query");

        Ok(Self {
            sources,
            current: None,
            start,
            end,
            sensor_id: sensor_id.map(str::to_string),
            skipped_rows: 0,
        })
    }

    /// Rows skipped so far because they could not be parsed.
    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows
    }

    fn matches(&self, reading: &Reading) -> bool {
        reading.timestamp >= self.start
            && reading.timestamp <= self.end
            && self
                .sensor_id
                .as_deref()
                .map_or(true, |id| reading.sensor_id == id)
    }

    /// Advance to the next source that can be opened.
    fn open_next(&mut self) -> bool {
        while let Some(source) = self.sources.pop_front() {
            match source.open() {
                Ok(reader) => {
                    let rows = csv::ReaderBuilder::new()
                        .has_headers(true)
                        .from_reader(reader)
                        .into_deserialize();
                    self.current = Some((source.path().to_path_buf(), rows));
                    return true;
                }
                Err(e) => {
                    warn!(path = %source.path().display(), error = %e, "Skipping unreadable log source");
                }
            }
        }
        false
    }
}

impl Iterator for ReadingQuery {
    type Item = Reading;

    fn next(&mut self) -> Option<Reading> {
        loop {
            if self.current.is_none() && !self.open_next() {
                return None;
            }

            let Some((path, rows)) = self.current.as_mut() else {
                continue;
            };

            match rows.next() {
                Some(Ok(row)) => match row.into_reading() {
                    Some(reading) if self.matches(&reading) => return Some(reading),
                    Some(_) => {}
                    None => self.skipped_rows += 1,
                },
                Some(Err(e)) => {
                    if matches!(e.kind(), csv::ErrorKind::Io(_)) {
                        warn!(path = %path.display(), error = %e, "Stopped reading log source");
                        self.current = None;
                    } else {
                        debug!(path = %path.display(), error = %e, "Skipping malformed row");
                        self.skipped_rows += 1;
                    }
                }
                None => self.current = None,
            }
        }
    }
}

/// Regular files in `dir`, optionally restricted to one extension, sorted by name.
fn list_plain_files(dir: &Path, extension: Option<&str>) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let wanted = match extension {
            Some(ext) => path.extension().and_then(|e| e.to_str()) == Some(ext),
            None => true,
        };
        if wanted {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
