//! Archive helpers for rotated log files.
//!
//! A rotated file is compressed into a single-member gzip archive whose header
//! records the original file name. Archives are written to a temporary name
//! and renamed into place, so a reader never sees a partially written archive
//! under its final name.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use tracing::{debug, info, warn};

/// Extension used for archives.
pub const ARCHIVE_EXTENSION: &str = "gz";

/// Suffix of archives still being written.
const PARTIAL_SUFFIX: &str = ".partial";

/// Archive name for a log file: the file's extension replaced by `gz`.
///
/// `readings_2024-05-01.csv` becomes `readings_2024-05-01.gz`.
pub fn archive_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    format!("{}.{}", stem, ARCHIVE_EXTENSION)
}

/// First free archive path for `file_name` inside `archive_dir`.
///
/// Existing archives are never overwritten; a numeric suffix is appended to
/// the stem instead (`name.gz`, `name-1.gz`, `name-2.gz`, ...).
pub fn unique_archive_path(archive_dir: &Path, file_name: &str) -> PathBuf {
    let candidate = archive_dir.join(archive_name(file_name));
    if !candidate.exists() {
        return candidate;
    }

    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let mut n = 1u32;
    loop {
        let candidate = archive_dir.join(format!("{}-{}.{}", stem, n, ARCHIVE_EXTENSION));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Compress `src` into a new archive in `archive_dir` and return its path.
///
/// The source file is left untouched; deleting it is the caller's decision
/// once this returns successfully.
pub fn compress_file(src: &Path, archive_dir: &Path) -> io::Result<PathBuf> {
    let file_name = src
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no usable file name", src.display()),
            )
        })?;

    fs::create_dir_all(archive_dir)?;
    let dest = unique_archive_path(archive_dir, file_name);
    let partial = dest.with_file_name(format!(
        "{}{}",
        dest.file_name().and_then(|n| n.to_str()).unwrap_or(file_name),
        PARTIAL_SUFFIX
    ));

    let result = write_archive(src, &partial, file_name).and_then(|size| {
        fs::rename(&partial, &dest)?;
        Ok(size)
    });

    match result {
        Ok((uncompressed, compressed)) => {
            debug!(
                src = %src.display(),
                archive = %dest.display(),
                uncompressed_size = uncompressed,
                compressed_size = compressed,
                "Archived log file"
            );
            Ok(dest)
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&partial) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial archive");
                }
            }
            Err(e)
        }
    }
}

fn write_archive(src: &Path, partial: &Path, entry_name: &str) -> io::Result<(u64, u64)> {
    let mut input = BufReader::new(File::open(src)?);
    let output = File::create(partial)?;

    let mut encoder = GzBuilder::new()
        .filename(entry_name)
        .write(BufWriter::new(output), Compression::default());
    let uncompressed = io::copy(&mut input, &mut encoder)?;

    let mut writer = encoder.finish()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    let compressed = file.metadata()?.len();

    Ok((uncompressed, compressed))
}

/// Remove `src` now that `archive` holds its contents.
///
/// A source that is already gone counts as removed. If the source cannot be
/// removed the archive is deleted instead, so the rows never exist both as a
/// plain file and inside an archive.
pub fn commit_archive(src: &Path, archive: &Path) -> io::Result<()> {
    match fs::remove_file(src) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %src.display(), error = %e, "Failed to remove archived log file, discarding archive");
            if let Err(cleanup) = fs::remove_file(archive) {
                warn!(path = %archive.display(), error = %cleanup, "Failed to discard archive");
            }
            Err(e)
        }
    }
}

/// Open an archive for streaming reads of its single member.
pub fn open_archive(path: &Path) -> io::Result<impl Read> {
    let file = File::open(path)?;
    Ok(GzDecoder::new(BufReader::new(file)))
}

/// Whether a path names a finished archive.
pub fn is_archive(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION)
}

/// Finished archives in `archive_dir`, sorted by name. A missing directory is empty.
pub fn list_archives(archive_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(archive_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut archives = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if is_archive(&path) {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

/// Delete archives whose modification time is older than `retention`.
///
/// Returns the number of archives removed. Individual failures are logged
/// and do not stop the scan.
pub fn prune_archives(archive_dir: &Path, retention: Duration) -> io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for path in list_archives(archive_dir)? {
        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read archive modification time");
                continue;
            }
        };

        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "Removed expired archive");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove expired archive");
                }
            }
        }
    }
    Ok(removed)
}
