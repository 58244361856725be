//! Quarantine files and the device last-request record
//!
//! Bad stampings (parsed but not delivered) and parse errors (lines the
//! grammar rejected) are kept in flat append-only files so nothing is ever
//! silently dropped. The last-request file records the most recent stamping
//! returned by the badge reader and when it was asked for it.

use chrono::NaiveDateTime;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const LAST_REQUEST_SECTION: &str = "[Last_Request]";
const LAST_STAMPING_FIELD: &str = "lastStamping";
const LAST_REQUEST_FIELD: &str = "lastrequest";
const LAST_REQUEST_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Quarantine I/O errors
#[derive(Debug, thiserror::Error)]
#[error("failed to update {path}: {message}")]
pub struct QuarantineError {
    /// Path that was attempted
    pub path: String,
    /// Underlying I/O error
    pub message: String,
}

/// Appends raw lines to a flat quarantine file.
#[derive(Debug, Clone)]
pub struct QuarantineStore {
    path: PathBuf,
}

impl QuarantineStore {
    /// Create a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the given lines, creating the file on first use.
    ///
    /// An empty batch leaves the filesystem untouched.
    pub fn append(&self, lines: &[String]) -> Result<(), QuarantineError> {
        if lines.is_empty() {
            return Ok(());
        }

        let io_err = |e: std::io::Error| QuarantineError {
            path: self.path.display().to_string(),
            message: e.to_string(),
        };

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        for line in lines {
            writeln!(file, "{line}").map_err(io_err)?;
        }

        info!(count = lines.len(), path = %self.path.display(), "lines quarantined");
        Ok(())
    }
}

/// Reads and writes the device last-request file.
///
/// The file has a single `[Last_Request]` section with the raw line of the
/// most recent stamping received and the timestamp it was requested at.
#[derive(Debug, Clone)]
pub struct LastRequestStore {
    path: PathBuf,
}

impl LastRequestStore {
    /// Create a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the last recorded stamping line and request time.
    ///
    /// A missing or unreadable file yields `None`; a malformed file is
    /// logged and also yields `None`, so the caller falls back to the
    /// configured default history window.
    pub fn load(&self) -> Option<(String, NaiveDateTime)> {
        let contents = std::fs::read_to_string(&self.path).ok()?;

        let mut in_section = false;
        let mut stamping = None;
        let mut request = None;
        for line in contents.lines() {
            let line = line.trim();
            if line == LAST_REQUEST_SECTION {
                in_section = true;
                continue;
            }
            if !in_section {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim();
                // configparser lowercases keys on write
                match key.trim().to_ascii_lowercase().as_str() {
                    k if k == LAST_STAMPING_FIELD.to_ascii_lowercase() => {
                        stamping = Some(value.to_string())
                    }
                    k if k == LAST_REQUEST_FIELD => request = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        let stamping = stamping?;
        let request = request?;
        match NaiveDateTime::parse_from_str(&request, LAST_REQUEST_FORMAT) {
            Ok(date) => {
                info!(%stamping, %date, "last request loaded");
                Some((stamping, date))
            }
            Err(_) => {
                warn!(path = %self.path.display(), "bad date format in last-request file");
                None
            }
        }
    }

    /// Record the most recent stamping line and the request time.
    pub fn save(&self, stamping: &str, date: NaiveDateTime) -> Result<(), QuarantineError> {
        let contents = format!(
            "{LAST_REQUEST_SECTION}\n{LAST_STAMPING_FIELD} = {stamping}\n{LAST_REQUEST_FIELD} = {}\n",
            date.format(LAST_REQUEST_FORMAT)
        );
        std::fs::write(&self.path, contents).map_err(|e| QuarantineError {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        info!(%stamping, %date, "last request saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[test]
    fn test_empty_batch_creates_no_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad_stampings.txt");
        QuarantineStore::new(&path).append(&[]).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_append_accumulates_across_calls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad_stampings.txt");
        let store = QuarantineStore::new(&path);
        store.append(&["one".to_string()]).unwrap();
        store.append(&["two".to_string(), "three".to_string()]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "one\ntwo\nthree\n");
    }

    #[test]
    fn test_last_request_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LastRequestStore::new(dir.path().join("last_request.txt"));
        let date = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        store.save("E13000232000013505605031400", date).unwrap();
        let (stamping, loaded) = store.load().unwrap();
        assert_eq!(stamping, "E13000232000013505605031400");
        assert_eq!(loaded, date);
    }

    #[test]
    fn test_missing_last_request_file_yields_none() {
        let dir = TempDir::new().unwrap();
        let store = LastRequestStore::new(dir.path().join("last_request.txt"));
        assert!(store.load().is_none());
    }

    #[test]
    fn test_bad_date_format_yields_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_request.txt");
        std::fs::write(
            &path,
            "[Last_Request]\nlaststamping = X\nlastrequest = 15/01/2024\n",
        )
        .unwrap();
        assert!(LastRequestStore::new(path).load().is_none());
    }

    #[test]
    fn test_lowercased_keys_accepted() {
        // files written by older client versions have lowercased keys
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_request.txt");
        std::fs::write(
            &path,
            "[Last_Request]\nlaststamping = LINE\nlastrequest = 2024-01-15 08:30:00\n",
        )
        .unwrap();
        let (stamping, _) = LastRequestStore::new(path).load().unwrap();
        assert_eq!(stamping, "LINE");
    }
}
