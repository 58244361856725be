//! FTP source
//!
//! Stamping files exported by the reader vendor onto a plain FTP server.
//! Fetched files are staged into the local source directory before being
//! read, so a later run can re-inspect what was actually retrieved.
//!
//! Vendor FTP daemons drop idle control connections without notice, so the
//! candidate listing tolerates one implicit reconnect before giving up.

use super::{filter_candidates, read_local_lines, FetchedLines, RetrievalError, SourceRetriever};
use crate::config::SourceConfig;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use tracing::{info, warn};

/// Retrieves stamping files over FTP, staging them locally.
pub struct FtpSource {
    config: SourceConfig,
    staging_dir: PathBuf,
    session: Option<FtpStream>,
}

impl FtpSource {
    /// Build a source for the given server; connects lazily.
    pub fn new(config: SourceConfig, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            staging_dir: staging_dir.into(),
            session: None,
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

        info!(host = %self.config.host, port = self.config.port, "connecting to FTP server");
        let mut ftp = FtpStream::connect_timeout(
            addr,
            Duration::from_secs(self.config.connect_timeout_secs),
        )
        .map_err(|e| connect_err(e.to_string()))?;
        ftp.login(&self.config.username, &self.config.password)
            .map_err(|e| connect_err(e.to_string()))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| connect_err(e.to_string()))?;
        ftp.cwd(&self.config.remote_dir)
            .map_err(|e| connect_err(e.to_string()))?;
        Ok(ftp)
    }

    fn session(&mut self) -> Result<&mut FtpStream, RetrievalError> {
        if self.session.is_none() {
            let ftp = self.connect()?;
            return Ok(self.session.insert(ftp));
        }
        self.session.as_mut().ok_or_else(|| RetrievalError::Connect {
            host: self.config.host.clone(),
            message: "session unavailable".to_string(),
        })
    }

    fn stage(&mut self, name: &str) -> Result<PathBuf, RetrievalError> {
        let buffer = self
            .session()?
            .retr_as_buffer(name)
            .map_err(|e| RetrievalError::FileFetch {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        let path = self.staging_dir.join(name);
        std::fs::write(&path, buffer.into_inner()).map_err(|e| RetrievalError::Staging {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        info!(file = name, "stamping file staged from FTP server");
        Ok(path)
    }
}

impl SourceRetriever for FtpSource {
    fn list_candidate_files(&mut self) -> Result<Vec<String>, RetrievalError> {
        let names = match self.session()?.nlst(None) {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "FTP listing failed, reconnecting once");
                self.session = None;
                self.session()?
                    .nlst(None)
                    .map_err(|e| RetrievalError::Listing(e.to_string()))?
            }
        };
        Ok(filter_candidates(
            names,
            &self.config.file_prefix,
            &self.config.file_suffix,
        ))
    }

    fn file_size(&mut self, name: &str) -> Result<u64, RetrievalError> {
        self.session()?
            .size(name)
            .map(|size| size as u64)
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
        let path = self.stage(name)?;
        read_local_lines(&path, name, from_line)
    }
}

impl Drop for FtpSource {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.quit();
        }
    }
}
