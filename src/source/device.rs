//! Badge reader device source
//!
//! Some readers hold their stampings internally and only export them on
//! request: the client uploads a command file naming a filter start date,
//! waits for the reader to settle, checks the response log for a success
//! code, then downloads the filtered export. The exchange happens over the
//! reader's own FTP service.
//!
//! The reader re-exports overlapping windows on every poll, so downloaded
//! lines go through the per-day archive (which deduplicates) and the most
//! recent stamping is recorded in the last-request file to narrow the next
//! poll. New lines are staged as a dated file in the local source
//! directory; the staged files are what this variant lists and serves.

use super::{FetchedLines, RetrievalError, SourceRetriever};
use crate::archive::ArchiveStore;
use crate::config::DeviceConfig;
use crate::grammar::RecordGrammar;
use crate::quarantine::LastRequestStore;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use tracing::{debug, error, info, warn};

const STAGED_FILE_FORMAT: &str = "%Y%m%d-%H%M%S";

static RESPONSE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Rx\d{4}").expect("valid response code pattern"));

/// Polls a badge reader and serves the staged export files.
pub struct DeviceSource {
    config: DeviceConfig,
    grammar: RecordGrammar,
    staging_dir: PathBuf,
    archive: ArchiveStore,
    last_request: LastRequestStore,
}

impl DeviceSource {
    /// Build a source for the given reader; connects on each poll.
    pub fn new(
        config: DeviceConfig,
        grammar: RecordGrammar,
        staging_dir: impl Into<PathBuf>,
        archives_dir: impl Into<PathBuf>,
        last_request_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            grammar,
            staging_dir: staging_dir.into(),
            archive: ArchiveStore::new(archives_dir),
            last_request: LastRequestStore::new(last_request_path),
        }
    }

    /// Run one poll of the reader.
    ///
    /// Any failure is logged and swallowed: a poll that goes wrong means
    /// "no new stamping", never a crash. The channel is closed regardless
    /// of where the exchange stopped.
    pub fn poll(&self, now: NaiveDateTime) {
        let mut ftp = match self.connect() {
            Ok(ftp) => ftp,
            Err(e) => {
                error!(error = %e, "could not reach the badge reader");
                return;
            }
        };

        let outcome = self.exchange(&mut ftp, now);
        if let Err(e) = ftp.quit() {
            debug!(error = %e, "error closing the reader channel");
        }
        self.record_outcome(outcome);
    }

    /// Record a finished poll: the latest stamping's own timestamp becomes
    /// the next poll's filter date. The reader and the client keep separate
    /// clocks, so the poll time must never be used here.
    fn record_outcome(&self, outcome: Result<Option<(String, NaiveDateTime)>, RetrievalError>) {
        match outcome {
            Ok(Some((line, date))) => {
                if let Err(e) = self.last_request.save(&line, date) {
                    warn!(error = %e, "could not record the last request");
                }
                info!(latest = %line, %date, "reader poll complete");
            }
            Ok(None) => info!("no new stamping from the reader"),
            Err(e) => error!(error = %e, "reader poll failed"),
        }
    }

    fn connect(&self) -> Result<FtpStream, RetrievalError> {
        let connect_err = |message: String| RetrievalError::Connect {
            host: self.config.host.clone(),
            message,
        };

        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("host resolved to no address".to_string()))?;

        info!(host = %self.config.host, "connecting to the badge reader");
        let mut ftp = FtpStream::connect_timeout(
            addr,
            Duration::from_secs(self.config.connect_timeout_secs),
        )
        .map_err(|e| connect_err(e.to_string()))?;
        ftp.login(&self.config.username, &self.config.password)
            .map_err(|e| connect_err(e.to_string()))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| connect_err(e.to_string()))?;
        Ok(ftp)
    }

    /// The command/response exchange, from an authenticated channel to the
    /// staged export. Returns the most recent new stamping, if any.
    fn exchange(
        &self,
        ftp: &mut FtpStream,
        now: NaiveDateTime,
    ) -> Result<Option<(String, NaiveDateTime)>, RetrievalError> {
        let fetch_err = |name: &str, message: String| RetrievalError::FileFetch {
            name: name.to_string(),
            message,
        };

        // stale response log would shadow this command's outcome
        ftp.rm(&self.config.response_log_file)
            .map_err(|e| fetch_err(&self.config.response_log_file, e.to_string()))?;

        let (last_line, from_date) = match self.last_request.load() {
            Some((line, date)) => (Some(line), date),
            None => {
                let fallback = (now - ChronoDuration::days(self.config.days_to_download as i64))
                    .date()
                    .and_hms_opt(0, 0, 0)
                    .unwrap_or(now);
                (None, fallback)
            }
        };

        let command = format!(
            "{}{}\r\n",
            self.config.filter_command,
            from_date.format(&self.config.command_date_format)
        );
        ftp.put_file(
            &self.config.command_file,
            &mut Cursor::new(command.clone().into_bytes()),
        )
        .map_err(|e| fetch_err(&self.config.command_file, e.to_string()))?;
        info!(command = command.trim(), "filter command sent to the reader");

        std::thread::sleep(Duration::from_secs(self.config.wait_secs));

        let log_size = ftp
            .size(&self.config.response_log_file)
            .map_err(|e| fetch_err(&self.config.response_log_file, e.to_string()))?;
        if log_size == 0 {
            warn!("empty response log, no stampings downloaded");
            return Ok(None);
        }

        let log = ftp
            .retr_as_buffer(&self.config.response_log_file)
            .map_err(|e| fetch_err(&self.config.response_log_file, e.to_string()))?;
        let log = String::from_utf8_lossy(&log.into_inner()).into_owned();
        let first_line = log.lines().next().unwrap_or("").trim().to_string();
        let code = extract_response_code(&first_line).ok_or_else(|| {
            RetrievalError::Protocol(format!("no response code in `{first_line}`"))
        })?;
        if code != self.config.success_code {
            return Err(RetrievalError::Protocol(format!(
                "reader answered {code}, expected {}",
                self.config.success_code
            )));
        }
        info!(code, "reader accepted the filter command");

        let export = ftp
            .retr_as_buffer(&self.config.stampings_file)
            .map_err(|e| fetch_err(&self.config.stampings_file, e.to_string()))?;
        let export = String::from_utf8_lossy(&export.into_inner()).into_owned();
        let mut lines: Vec<String> = export
            .lines()
            .map(str::to_string)
            .filter(|line| !line.trim().is_empty())
            .collect();

        // the most recent stamping of the previous poll comes back again
        if let Some(last_line) = last_line {
            lines.retain(|line| *line != last_line);
        }
        if lines.is_empty() {
            return Ok(None);
        }

        let staged = self
            .staging_dir
            .join(now.format(STAGED_FILE_FORMAT).to_string());
        std::fs::write(&staged, format!("{}\n", lines.join("\n"))).map_err(|e| {
            RetrievalError::Staging {
                path: staged.display().to_string(),
                message: e.to_string(),
            }
        })?;
        info!(count = lines.len(), path = %staged.display(), "new stampings staged");

        self.archive
            .archive(&lines, &self.grammar)
            .map_err(|e| RetrievalError::Staging {
                path: e.path.clone(),
                message: e.message,
            })
    }
}

/// Pull the `Rx`-prefixed 4-digit response code out of a log line.
fn extract_response_code(line: &str) -> Option<&str> {
    RESPONSE_CODE.find(line).map(|m| m.as_str())
}

impl SourceRetriever for DeviceSource {
    /// Poll the reader, then list the staged export files.
    ///
    /// Poll failures degrade to listing whatever is already staged, so a
    /// flaky reader never blocks delivery of previously staged lines.
    fn list_candidate_files(&mut self) -> Result<Vec<String>, RetrievalError> {
        self.poll(Local::now().naive_local());

        let entries = std::fs::read_dir(&self.staging_dir)
            .map_err(|e| RetrievalError::Listing(e.to_string()))?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&mut self, name: &str) -> Result<u64, RetrievalError> {
        std::fs::metadata(self.staging_dir.join(name))
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
        super::read_local_lines(&self.staging_dir.join(name), name, from_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrammarConfig;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn source(dir: &TempDir) -> DeviceSource {
        DeviceSource::new(
            DeviceConfig::default(),
            RecordGrammar::new(&GrammarConfig::default()).unwrap(),
            dir.path(),
            dir.path().join("archives"),
            dir.path().join("last_request.txt"),
        )
    }

    #[test]
    fn test_last_request_records_the_stamping_timestamp() {
        // the reader's clock drives the next filter date, not the client's
        let dir = TempDir::new().unwrap();
        let source = source(&dir);
        let stamping_date = NaiveDate::from_ymd_opt(2014, 3, 5)
            .unwrap()
            .and_hms_opt(13, 50, 56)
            .unwrap();

        source.record_outcome(Ok(Some((
            "E13000232000013505605031400".to_string(),
            stamping_date,
        ))));

        let (line, date) = source.last_request.load().unwrap();
        assert_eq!(line, "E13000232000013505605031400");
        assert_eq!(date, stamping_date);
    }

    #[test]
    fn test_empty_poll_leaves_no_last_request() {
        let dir = TempDir::new().unwrap();
        let source = source(&dir);
        source.record_outcome(Ok(None));
        assert!(source.last_request.load().is_none());
    }

    #[test]
    fn test_success_code_extracted() {
        assert_eq!(extract_response_code("T01Rx0000"), Some("Rx0000"));
    }

    #[test]
    fn test_failure_code_extracted_verbatim() {
        assert_eq!(extract_response_code("T01Rx0001"), Some("Rx0001"));
    }

    #[test]
    fn test_line_without_code_yields_none() {
        assert_eq!(extract_response_code("garbled"), None);
    }
}
