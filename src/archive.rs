//! Per-day archive of device-exported stampings
//!
//! The badge reader re-exports overlapping history windows, so everything it
//! returns is appended to a per-day file named after the stamping date and
//! the directory is deduplicated afterwards. The archive is the durable
//! record of what the reader produced, independent of delivery outcomes.

use crate::grammar::RecordGrammar;
use chrono::NaiveDateTime;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

const ARCHIVE_FILE_FORMAT: &str = "%Y%m%d";

/// Archive I/O errors
#[derive(Debug, thiserror::Error)]
#[error("archive failure on {path}: {message}")]
pub struct ArchiveError {
    /// Path that was attempted
    pub path: String,
    /// Underlying I/O error
    pub message: String,
}

/// Appends raw lines to per-day files and deduplicates them.
#[derive(Debug)]
pub struct ArchiveStore {
    dir: PathBuf,
}

impl ArchiveStore {
    /// Create a store writing into the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Archive the given raw lines and report the most recent stamping.
    ///
    /// Each line is parsed with the grammar to derive its calendar day;
    /// lines that do not parse or do not form a real datetime are logged
    /// and skipped (they still reach the parse-error quarantine through the
    /// delivery pipeline). Returns the line with the latest parsed
    /// timestamp, or `None` when nothing was archivable.
    pub fn archive(
        &self,
        lines: &[String],
        grammar: &RecordGrammar,
    ) -> Result<Option<(String, NaiveDateTime)>, ArchiveError> {
        let mut latest: Option<(String, NaiveDateTime)> = None;

        for line in lines {
            let stamping = match grammar.parse(line) {
                Ok(stamping) => stamping,
                Err(e) => {
                    warn!(line, error = %e, "line not archivable");
                    continue;
                }
            };
            let date_time = match stamping.date_time() {
                Some(dt) => dt,
                None => {
                    warn!(line, "stamping has no calendar datetime, not archived");
                    continue;
                }
            };

            let path = self.dir.join(date_time.format(ARCHIVE_FILE_FORMAT).to_string());
            let io_err = |e: std::io::Error| ArchiveError {
                path: path.display().to_string(),
                message: e.to_string(),
            };
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(io_err)?;
            writeln!(file, "{}", line.trim_end()).map_err(io_err)?;

            if latest.as_ref().map_or(true, |(_, dt)| *dt < date_time) {
                latest = Some((line.clone(), date_time));
            }
        }

        self.remove_duplicates()?;
        Ok(latest)
    }

    /// Rewrite every archive file keeping each distinct line once, in first
    /// occurrence order. Files without duplicates are left untouched.
    fn remove_duplicates(&self) -> Result<(), ArchiveError> {
        let dir_err = |e: std::io::Error| ArchiveError {
            path: self.dir.display().to_string(),
            message: e.to_string(),
        };

        for entry in std::fs::read_dir(&self.dir).map_err(dir_err)? {
            let path = entry.map_err(dir_err)?.path();
            if !path.is_file() {
                continue;
            }
            let io_err = |e: std::io::Error| ArchiveError {
                path: path.display().to_string(),
                message: e.to_string(),
            };

            let contents = std::fs::read_to_string(&path).map_err(io_err)?;
            let mut seen = std::collections::HashSet::new();
            let distinct: Vec<&str> = contents
                .lines()
                .filter(|line| seen.insert(*line))
                .collect();

            let total = contents.lines().count();
            if distinct.len() != total {
                let mut rewritten = distinct.join("\n");
                rewritten.push('\n');
                std::fs::write(&path, rewritten).map_err(io_err)?;
                info!(
                    removed = total - distinct.len(),
                    path = %path.display(),
                    "duplicate stampings removed from archive"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrammarConfig;
    use tempfile::TempDir;

    fn grammar() -> RecordGrammar {
        RecordGrammar::new(&GrammarConfig::default()).unwrap()
    }

    // badge 000232, 13:50:56 on 2014-03-05 / 08:15:00 on 2014-03-06
    const DAY1: &str = "E13000232000013505605031400";
    const DAY2: &str = "U14000232000008150006031400";

    #[test]
    fn test_lines_land_in_per_day_files() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path());
        store
            .archive(&[DAY1.to_string(), DAY2.to_string()], &grammar())
            .unwrap();
        assert!(dir.path().join("20140305").exists());
        assert!(dir.path().join("20140306").exists());
    }

    #[test]
    fn test_latest_stamping_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path());
        let (line, date) = store
            .archive(&[DAY2.to_string(), DAY1.to_string()], &grammar())
            .unwrap()
            .unwrap();
        // DAY2 is a day later than DAY1 regardless of input order
        assert_eq!(line, DAY2);
        assert_eq!(date.format("%Y-%m-%d %H:%M:%S").to_string(), "2014-03-06 08:15:00");
    }

    #[test]
    fn test_duplicates_collapse_to_one_line() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path());
        store
            .archive(
                &[DAY1.to_string(), DAY1.to_string(), DAY1.to_string()],
                &grammar(),
            )
            .unwrap();
        let contents = std::fs::read_to_string(dir.path().join("20140305")).unwrap();
        assert_eq!(contents, format!("{DAY1}\n"));
    }

    #[test]
    fn test_dedup_spans_archive_runs() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path());
        store.archive(&[DAY1.to_string()], &grammar()).unwrap();
        store.archive(&[DAY1.to_string()], &grammar()).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("20140305")).unwrap();
        assert_eq!(contents, format!("{DAY1}\n"));
    }

    #[test]
    fn test_unparsable_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(dir.path());
        let latest = store
            .archive(&["garbage".to_string()], &grammar())
            .unwrap();
        assert!(latest.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
