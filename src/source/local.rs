//! Local directory source
//!
//! Stamping files dropped into the source directory by an external process
//! (a vendor export job, a mounted share). No staging needed.

use super::{filter_candidates, read_local_lines, FetchedLines, RetrievalError, SourceRetriever};
use std::path::PathBuf;
use tracing::info;

/// Reads stamping files straight from a local directory.
#[derive(Debug)]
pub struct LocalSource {
    dir: PathBuf,
    prefix: String,
    suffix: String,
}

impl LocalSource {
    /// Build a source over the given directory and naming convention.
    pub fn new(dir: impl Into<PathBuf>, prefix: &str, suffix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
    }
}

impl SourceRetriever for LocalSource {
    fn list_candidate_files(&mut self) -> Result<Vec<String>, RetrievalError> {
        let entries =
            std::fs::read_dir(&self.dir).map_err(|e| RetrievalError::Listing(e.to_string()))?;
        let names = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok());
        Ok(filter_candidates(names, &self.prefix, &self.suffix))
    }

    fn file_size(&mut self, name: &str) -> Result<u64, RetrievalError> {
        std::fs::metadata(self.dir.join(name))
            .map(|meta| meta.len())
            .map_err(|e| RetrievalError::FileSize {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    fn fetch_lines(
        &mut self,
        name: &str,
        from_line: Option<u64>,
    ) -> Result<FetchedLines, RetrievalError> {
        info!(file = name, ?from_line, "reading local stamping file");
        read_local_lines(&self.dir.join(name), name, from_line)
    }
}
