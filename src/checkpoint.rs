//! Checkpoint store
//!
//! Persists the (file name, size, last processed line) marker that lets a
//! cycle resume mid-file after a restart. The on-disk format is a short
//! comment header followed by one tab-separated record, kept human-editable
//! so operators can reset or nudge the marker by hand.

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const HEADER: &str = "\
# generated by the stamping client
# contains:
# - name of the last retrieved stampings file
# - its size at the last retrieval, in bytes
# - last processed line number for that file
#
# fields are tab separated
#
# file\tsize\tlast line
";

/// Checkpoint errors
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Checkpoint file exists but could not be read
    #[error("failed to read checkpoint {path}: {message}")]
    Read {
        /// Path that was attempted
        path: String,
        /// Underlying I/O error
        message: String,
    },

    /// Checkpoint file exists but holds no parsable record
    #[error("malformed checkpoint {path}: {message}")]
    Malformed {
        /// Path that was attempted
        path: String,
        /// What was wrong
        message: String,
    },

    /// Checkpoint could not be written durably
    #[error("failed to persist checkpoint {path}: {message}")]
    Persist {
        /// Path that was attempted
        path: String,
        /// Underlying I/O error
        message: String,
    },
}

/// Resume marker for one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Name of the last retrieved file
    pub file_name: String,
    /// Size in bytes at the last retrieval
    pub size: u64,
    /// Last processed line number, 1-based; 0 means none processed
    pub last_line: u64,
}

/// Loads and saves the checkpoint with atomic replacement.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Create a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current checkpoint. A missing file means no checkpoint.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Read {
                    path: self.path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        for line in contents.lines() {
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            return self.parse_record(line).map(Some);
        }

        Err(CheckpointError::Malformed {
            path: self.path.display().to_string(),
            message: "no record found".to_string(),
        })
    }

    fn parse_record(&self, line: &str) -> Result<Checkpoint, CheckpointError> {
        let malformed = |message: String| CheckpointError::Malformed {
            path: self.path.display().to_string(),
            message,
        };

        let mut fields = line.split('\t');
        let file_name = fields
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| malformed("missing file name".to_string()))?
            .to_string();
        let size = fields
            .next()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| malformed(format!("bad size field in `{line}`")))?;
        let last_line = fields
            .next()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| malformed(format!("bad line field in `{line}`")))?;

        Ok(Checkpoint {
            file_name,
            size,
            last_line,
        })
    }

    /// Atomically replace the checkpoint on disk.
    ///
    /// Writes a temporary file in the same directory and renames it over the
    /// target, so a crash mid-write never leaves a torn checkpoint.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let persist_err = |message: String| CheckpointError::Persist {
            path: self.path.display().to_string(),
            message,
        };

        let dir = self.path.parent().ok_or_else(|| {
            persist_err("checkpoint path has no parent directory".to_string())
        })?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| persist_err(e.to_string()))?;
        write!(
            tmp,
            "{HEADER}{}\t{}\t{}",
            checkpoint.file_name, checkpoint.size, checkpoint.last_line
        )
        .map_err(|e| persist_err(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| persist_err(e.to_string()))?;

        debug!(
            file = %checkpoint.file_name,
            size = checkpoint.size,
            last_line = checkpoint.last_line,
            "checkpoint saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("last_file.txt"))
    }

    #[test]
    fn test_missing_file_means_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(&dir).load().unwrap(), None);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let checkpoint = Checkpoint {
            file_name: "20240101.txt".to_string(),
            size: 500,
            last_line: 10,
        };
        store.save(&checkpoint).unwrap();
        assert_eq!(store.load().unwrap(), Some(checkpoint));
    }

    #[test]
    fn test_save_overwrites_previous_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .save(&Checkpoint {
                file_name: "20240101.txt".to_string(),
                size: 500,
                last_line: 10,
            })
            .unwrap();
        store
            .save(&Checkpoint {
                file_name: "20240102.txt".to_string(),
                size: 120,
                last_line: 3,
            })
            .unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.file_name, "20240102.txt");
        assert_eq!(loaded.size, 120);
        assert_eq!(loaded.last_line, 3);
    }

    #[test]
    fn test_comment_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_file.txt");
        std::fs::write(&path, "# a comment\n# another\n20240101.txt\t500\t10").unwrap();
        let loaded = CheckpointStore::new(path).load().unwrap().unwrap();
        assert_eq!(loaded.file_name, "20240101.txt");
    }

    #[test]
    fn test_header_only_file_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_file.txt");
        std::fs::write(&path, "# only comments\n").unwrap();
        let err = CheckpointStore::new(path).load().unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed { .. }));
    }

    #[test]
    fn test_garbage_record_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_file.txt");
        std::fs::write(&path, "20240101.txt\tfive hundred\t10").unwrap();
        let err = CheckpointStore::new(path).load().unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed { .. }));
    }
}
