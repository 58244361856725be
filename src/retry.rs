//! Retry store for bad stampings
//!
//! A bad stamping is a line that parsed but could not be delivered. Bad
//! lines accumulate in a flat file between cycles and are resent by the
//! resend cycle, which prunes entries older than the configured age first.
//! The age of an entry is derived from its own embedded date at resend
//! time, nothing extra is stored.

use crate::grammar::RecordGrammar;
use chrono::{Duration, NaiveDateTime};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Retry store I/O errors
#[derive(Debug, thiserror::Error)]
#[error("retry store failure on {path}: {message}")]
pub struct RetryError {
    /// Path that was attempted
    pub path: String,
    /// Underlying I/O error
    pub message: String,
}

/// Outcome of loading the retry store.
#[derive(Debug, Default)]
pub struct RetryBatch {
    /// Deduplicated lines still young enough to resend
    pub lines: Vec<String>,
    /// Lines that no longer parse; destined for the parse-error quarantine
    pub unparsable: Vec<String>,
}

/// Loads, prunes and persists the bad-stampings file.
#[derive(Debug, Clone)]
pub struct RetryStore {
    path: PathBuf,
    max_age_days: u64,
}

impl RetryStore {
    /// Create a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>, max_age_days: u64) -> Self {
        Self {
            path: path.into(),
            max_age_days,
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether any bad stampings are currently persisted.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the stored lines, removing the file and pruning stale entries.
    ///
    /// Lines are deduplicated by exact equality. An entry is kept when its
    /// parsed timestamp falls on or after midnight of `now - max_age_days`.
    /// Entries that no longer parse under the current grammar are moved to
    /// `unparsable` instead of being retried forever.
    pub fn load_and_prune(
        &self,
        grammar: &RecordGrammar,
        now: NaiveDateTime,
    ) -> Result<RetryBatch, RetryError> {
        let io_err = |e: std::io::Error| RetryError {
            path: self.path.display().to_string(),
            message: e.to_string(),
        };

        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RetryBatch::default())
            }
            Err(e) => return Err(io_err(e)),
        };

        let oldest_allowed = (now - Duration::days(self.max_age_days as i64))
            .date()
            .and_hms_opt(0, 0, 0)
            .unwrap_or(now);
        info!(%oldest_allowed, "pruning bad stampings older than the cutoff");

        let mut seen = HashSet::new();
        let mut batch = RetryBatch::default();
        let mut pruned = 0usize;
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            if !seen.insert(line.to_string()) {
                continue;
            }
            match grammar.parse(line).ok().and_then(|s| s.date_time()) {
                Some(date) if date >= oldest_allowed => batch.lines.push(line.to_string()),
                Some(_) => pruned += 1,
                None => {
                    warn!(line, "bad stamping no longer parses, quarantining");
                    batch.unparsable.push(line.to_string());
                }
            }
        }

        if pruned > 0 {
            info!(pruned, "stale bad stampings discarded");
        }

        std::fs::remove_file(&self.path).map_err(io_err)?;
        Ok(batch)
    }

    /// Persist the remaining bad lines, deduplicated, or remove any leftover
    /// file when nothing remains.
    pub fn persist(&self, lines: &[String]) -> Result<(), RetryError> {
        let io_err = |e: std::io::Error| RetryError {
            path: self.path.display().to_string(),
            message: e.to_string(),
        };

        if lines.is_empty() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(e)),
            }
            return Ok(());
        }

        let mut seen = HashSet::new();
        let mut file = std::fs::File::create(&self.path).map_err(io_err)?;
        let mut written = 0usize;
        for line in lines {
            if seen.insert(line.as_str()) {
                writeln!(file, "{line}").map_err(io_err)?;
                written += 1;
            }
        }
        info!(count = written, path = %self.path.display(), "bad stampings persisted");
        Ok(())
    }
}
