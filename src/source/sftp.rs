//! SFTP source
//!
//! Same contract as the FTP variant over an encrypted channel. Fetched
//! files are staged into the local source directory before being read.

use super::{filter_candidates, read_local_lines, FetchedLines, RetrievalError, SourceRetriever};
use crate::config::SourceConfig;
use ssh2::{Session, Sftp};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Retrieves stamping files over SFTP, staging them locally.
pub struct SftpSource {
    config: SourceConfig,
    staging_dir: PathBuf,
    session: Option<Sftp>,
}

impl SftpSource {
    /// Build a source for the given server; connects lazily.
    pub fn new(config: SourceConfig, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            staging_dir: staging_dir.into(),
            session: None,
        }
    }

    fn remote_path(&self, name: &str) -> PathBuf {
        Path::new(&self.config.remote_dir).join(name)
    }

    fn connect(&self) -> Result<Sftp, RetrievalError> {
        let connect_err = |message: String| RetrievalError::Connect {
            host: self.config.host.clone(),
            message,
        };

        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("host resolved to no address".to_string()))?;

        info!(host = %self.config.host, port = self.config.port, "connecting to SFTP server");
        let tcp = TcpStream::connect_timeout(
            &addr,
            Duration::from_secs(self.config.connect_timeout_secs),
        )
        .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Session::new().map_err(|e| connect_err(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| connect_err(e.to_string()))?;
        session
            .userauth_password(&self.config.username, &self.config.password)
            .map_err(|e| connect_err(e.to_string()))?;
        session.sftp().map_err(|e| connect_err(e.to_string()))
    }

    fn session(&mut self) -> Result<&mut Sftp, RetrievalError> {
        if self.session.is_none() {
            let sftp = self.connect()?;
            return Ok(self.session.insert(sftp));
        }
        self.session.as_mut().ok_or_else(|| RetrievalError::Connect {
            host: self.config.host.clone(),
            message: "session unavailable".to_string(),
        })
    }

    fn list_names(&mut self) -> Result<Vec<String>, ssh2::Error> {
        let remote_dir = PathBuf::from(&self.config.remote_dir);
        let sftp = match self.session.as_mut() {
            Some(sftp) => sftp,
            None => return Err(ssh2::Error::from_errno(ssh2::ErrorCode::Session(-1))),
        };
        let entries = sftp.readdir(&remote_dir)?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, _stat)| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    fn stage(&mut self, name: &str) -> Result<PathBuf, RetrievalError> {
        let remote = self.remote_path(name);
        let fetch_err = |message: String| RetrievalError::FileFetch {
            name: name.to_string(),
            message,
        };

        let mut remote_file = self
            .session()?
            .open(&remote)
            .map_err(|e| fetch_err(e.to_string()))?;
        let mut contents = Vec::new();
        remote_file
            .read_to_end(&mut contents)
            .map_err(|e| fetch_err(e.to_string()))?;

        let path = self.staging_dir.join(name);
        std::fs::write(&path, contents).map_err(|e| RetrievalError::Staging {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        info!(file = name, "stamping file staged from SFTP server");
        Ok(path)
    }
}

impl SourceRetriever for SftpSource {
    fn list_candidate_files(&mut self) -> Result<Vec<String>, RetrievalError> {
        self.session()?;
        let names = match self.list_names() {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "SFTP listing failed, reconnecting once");
                self.session = None;
                self.session()?;
                self.list_names()
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
        let remote = self.remote_path(name);
        let stat = self
            .session()?
            .stat(&remote)
            .map_err(|e| RetrievalError::FileSize {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        stat.size.ok_or_else(|| RetrievalError::FileSize {
            name: name.to_string(),
            message: "server reported no size".to_string(),
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
