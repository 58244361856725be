//! Source retrievers
//!
//! A source retriever answers three questions: which candidate files exist,
//! how big is one of them, and what are its lines from a given offset. The
//! variant is chosen once at startup; the orchestrator drives whichever one
//! is active through the same capability set.
//!
//! Candidate files are filtered by configured name prefix/suffix and ordered
//! lexicographically; that ordering is assumed to coincide with
//! chronological order and drives new-file discovery.

use crate::config::{ClientConfig, SourceKind};
use crate::grammar::RecordGrammar;
use std::path::Path;

/// Badge reader command/response exchange
pub mod device;
/// FTP variant
pub mod ftp;
/// Local directory variant
pub mod local;
/// SFTP variant
pub mod sftp;

pub use device::DeviceSource;
pub use ftp::FtpSource;
pub use local::LocalSource;
pub use sftp::SftpSource;

/// Retrieval errors. All abort the current cycle only.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Could not connect or authenticate to the source
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Source host
        host: String,
        /// Underlying error
        message: String,
    },

    /// Candidate listing failed (after the single implicit reconnect)
    #[error("failed to list candidate files: {0}")]
    Listing(String),

    /// Size query failed
    #[error("failed to query size of {name}: {message}")]
    FileSize {
        /// File name at the source
        name: String,
        /// Underlying error
        message: String,
    },

    /// File retrieval failed
    #[error("failed to fetch {name}: {message}")]
    FileFetch {
        /// File name at the source
        name: String,
        /// Underlying error
        message: String,
    },

    /// Fetched file could not be staged locally
    #[error("failed to stage {path}: {message}")]
    Staging {
        /// Local staging path
        path: String,
        /// Underlying I/O error
        message: String,
    },

    /// Device answered a command with an unexpected response code
    #[error("unexpected device response: {0}")]
    Protocol(String),
}

/// Lines fetched from one source file.
#[derive(Debug, PartialEq, Eq)]
pub struct FetchedLines {
    /// Lines from the requested offset to the end of the file
    pub lines: Vec<String>,
    /// Total number of lines in the file, independent of the offset
    pub total_lines: u64,
}

/// Capability set shared by every source variant.
pub trait SourceRetriever {
    /// Candidate file names matching the naming convention, ascending.
    fn list_candidate_files(&mut self) -> Result<Vec<String>, RetrievalError>;

    /// Current size in bytes of the named file at the source.
    fn file_size(&mut self, name: &str) -> Result<u64, RetrievalError>;

    /// Lines of the named file starting at `from_line` (1-based), plus the
    /// file's total line count. `None` means the whole file; an offset past
    /// the end yields no lines and the unchanged count.
    fn fetch_lines(
        &mut self,
        name: &str,
        from_line: Option<u64>,
    ) -> Result<FetchedLines, RetrievalError>;
}

/// Build the retriever selected by the configuration.
pub fn build_retriever(
    config: &ClientConfig,
    grammar: &RecordGrammar,
) -> Box<dyn SourceRetriever + Send> {
    match config.source.kind {
        SourceKind::Local => Box::new(LocalSource::new(
            config.source_dir(),
            &config.source.file_prefix,
            &config.source.file_suffix,
        )),
        SourceKind::Ftp => Box::new(FtpSource::new(config.source.clone(), config.source_dir())),
        SourceKind::Sftp => Box::new(SftpSource::new(config.source.clone(), config.source_dir())),
        SourceKind::Device => Box::new(DeviceSource::new(
            config.device.clone(),
            grammar.clone(),
            config.source_dir(),
            config.archives_dir(),
            config.last_request_path(),
        )),
    }
}

/// Keep names matching the prefix/suffix convention, sorted ascending.
pub(crate) fn filter_candidates(
    names: impl IntoIterator<Item = String>,
    prefix: &str,
    suffix: &str,
) -> Vec<String> {
    let mut names: Vec<String> = names
        .into_iter()
        .filter(|name| name.starts_with(prefix) && name.ends_with(suffix))
        .collect();
    names.sort();
    names
}

/// Apply the `from_line` offset to a fully-read file.
pub(crate) fn slice_from_line(lines: Vec<String>, from_line: Option<u64>) -> FetchedLines {
    let total_lines = lines.len() as u64;
    let lines = match from_line {
        Some(from) if from > total_lines => Vec::new(),
        Some(from) if from > 1 => lines.into_iter().skip(from as usize - 1).collect(),
        _ => lines,
    };
    FetchedLines { lines, total_lines }
}

/// Read a staged local file and apply the offset.
pub(crate) fn read_local_lines(
    path: &Path,
    name: &str,
    from_line: Option<u64>,
) -> Result<FetchedLines, RetrievalError> {
    let contents = std::fs::read_to_string(path).map_err(|e| RetrievalError::FileFetch {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    let lines = contents.lines().map(str::to_string).collect();
    Ok(slice_from_line(lines, from_line))
}
