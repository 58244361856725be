//! Client configuration
//!
//! All tunables live in a single immutable [`ClientConfig`] loaded once at
//! startup from a TOML file and passed explicitly into the grammar, the
//! pipeline and the source retrievers. Defaults reproduce the standard
//! smartclock deployment so a minimal config only needs the server section.

use crate::Reason;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file {path}: {message}")]
    Read {
        /// Path that was attempted
        path: String,
        /// Underlying I/O error
        message: String,
    },

    /// Config file could not be parsed
    #[error("invalid config file {path}: {message}")]
    Parse {
        /// Path that was attempted
        path: String,
        /// Underlying TOML error
        message: String,
    },

    /// Record pattern did not compile
    #[error("invalid record pattern: {0}")]
    InvalidPattern(String),

    /// HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    /// Directory bootstrap failed
    #[error("failed to create directory {path}: {message}")]
    Directory {
        /// Directory that was attempted
        path: String,
        /// Underlying I/O error
        message: String,
    },
}

/// Which source variant to pull stamping files from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Files dropped into a local directory
    Local,
    /// Files on a remote FTP server
    Ftp,
    /// Files on a remote SFTP server
    Sftp,
    /// Live badge reader speaking the command/response export protocol
    Device,
}

/// Value side of the reason code table.
///
/// `none` marks codes that mean "no reason selected" (readers typically emit
/// an all-zero code in that case).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReasonCode {
    /// No reason selected
    None,
    /// Out on service duty
    ServiceDuty,
    /// Meal break
    MealBreak,
}

impl ReasonCode {
    /// Translate the table value into the structured reason.
    pub fn to_reason(self) -> Option<Reason> {
        match self {
            ReasonCode::None => None,
            ReasonCode::ServiceDuty => Some(Reason::ServiceDuty),
            ReasonCode::MealBreak => Some(Reason::MealBreak),
        }
    }
}

/// Record grammar configuration: the per-site field pattern and code tables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrammarConfig {
    /// Regex with named captures describing one raw line.
    ///
    /// Recognized capture names: `operazione`, `tipo`, `giornoSettimana`,
    /// `matricolaFirma`, `causale`, `ora`, `minuti`, `secondi`, `giorno`,
    /// `mese`, `anno`, `lettore`. Captures absent from the pattern are
    /// treated as optional fields.
    pub pattern: String,
    /// Offset added to the parsed two-digit year
    pub year_offset: i32,
    /// Raw operation code to transit direction
    pub operation_codes: HashMap<String, crate::Operation>,
    /// Raw reason code to reason
    pub reason_codes: HashMap<String, ReasonCode>,
    /// Badge ids whose stampings must be ignored (e.g. contractor badges)
    pub ignored_badges: HashSet<String>,
}

impl Default for GrammarConfig {
    fn default() -> Self {
        use crate::Operation::*;
        let operation_codes = HashMap::from([
            ("E".to_string(), Entrance),
            ("U".to_string(), Exit),
            ("T".to_string(), Transit),
            ("0".to_string(), Null),
            ("00".to_string(), Entrance),
            ("01".to_string(), Exit),
        ]);
        let reason_codes = HashMap::from([
            ("0000".to_string(), ReasonCode::None),
            ("0002".to_string(), ReasonCode::ServiceDuty),
            ("0004".to_string(), ReasonCode::ServiceDuty),
            ("0003".to_string(), ReasonCode::MealBreak),
        ]);
        Self {
            pattern: concat!(
                "^(?P<operazione>[0EUT])(?P<tipo>\\w)(?P<giornoSettimana>\\d)",
                "(?P<matricolaFirma>\\d{6})(?P<causale>\\d{4})(?P<ora>\\d{2})",
                "(?P<minuti>\\d{2})(?P<secondi>\\d{2})(?P<giorno>\\d{2})",
                "(?P<mese>\\d{2})(?P<anno>\\d{2})(?P<lettore>\\d{2})$"
            )
            .to_string(),
            year_offset: 2000,
            operation_codes,
            reason_codes,
            ignored_badges: HashSet::new(),
        }
    }
}

/// Source selection and file-transfer parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Active source variant
    pub kind: SourceKind,
    /// Remote host (FTP/SFTP)
    pub host: String,
    /// Remote port (FTP/SFTP)
    pub port: u16,
    /// Remote username
    pub username: String,
    /// Remote password
    pub password: String,
    /// Remote directory holding the stamping files
    pub remote_dir: String,
    /// Candidate file name prefix
    pub file_prefix: String,
    /// Candidate file name suffix
    pub file_suffix: String,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// When true the whole checkpointed file is re-processed on every change.
    ///
    /// Required for sources that regenerate the daily file in full instead of
    /// appending to it.
    pub resend_all: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Local,
            host: "127.0.0.1".to_string(),
            port: 21,
            username: String::new(),
            password: String::new(),
            remote_dir: ".".to_string(),
            file_prefix: "20".to_string(),
            file_suffix: ".txt".to_string(),
            connect_timeout_secs: 30,
            resend_all: false,
        }
    }
}

/// Badge reader control-channel parameters (the `device` source).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Reader host
    pub host: String,
    /// Reader FTP port
    pub port: u16,
    /// Reader username
    pub username: String,
    /// Reader password
    pub password: String,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Settle interval after uploading the command, in seconds
    pub wait_secs: u64,
    /// Filter command code written into the command file
    pub filter_command: String,
    /// Name of the stampings export file on the reader
    pub stampings_file: String,
    /// Name of the command file on the reader
    pub command_file: String,
    /// Name of the response-log file on the reader
    pub response_log_file: String,
    /// chrono format of the filter date appended to the command
    pub command_date_format: String,
    /// Response code meaning the command succeeded
    pub success_code: String,
    /// Days of history requested when no last request is recorded
    pub days_to_download: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 21,
            username: "epas.client".to_string(),
            password: "client.epas".to_string(),
            connect_timeout_secs: 30,
            wait_secs: 10,
            filter_command: "F4".to_string(),
            stampings_file: "ltcom.trn".to_string(),
            command_file: "ltcom.com".to_string(),
            response_log_file: "ltcom.log".to_string(),
            command_date_format: "%d/%m/%y/%H/%M/%S".to_string(),
            success_code: "Rx0000".to_string(),
            days_to_download: 2,
        }
    }
}

/// Downstream presence-tracking service endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `http` or `https`
    pub protocol: String,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Path of the stamping creation resource
    pub stamping_path: String,
    /// Basic auth username; empty disables authentication
    pub username: String,
    /// Basic auth password
    pub password: String,
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    /// Full URL of the stamping creation resource.
    pub fn stamping_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.stamping_path
        )
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 9000,
            stamping_path: "/stampings/create".to_string(),
            username: String::new(),
            password: String::new(),
            connect_timeout_secs: 4,
            request_timeout_secs: 10,
        }
    }
}

/// Delivery pipeline tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers
    pub workers: usize,
    /// Response status codes that mark a stamping for later resend
    pub retryable_status_codes: HashSet<u16>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            retryable_status_codes: HashSet::from([
                401, 404, 500, 501, 502, 503, 504, 505, 506, 507, 508, 509,
            ]),
        }
    }
}

/// Meal-break inference window.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MealBreakConfig {
    /// First hour (inclusive) of the meal-break window
    pub min_hour: u32,
    /// Last hour (exclusive) of the meal-break window
    pub max_hour: u32,
}

impl Default for MealBreakConfig {
    fn default() -> Self {
        Self {
            min_hour: 12,
            max_hour: 15,
        }
    }
}

/// Retry store tunables.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Stampings older than this are dropped from the retry store
    pub max_age_days: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_age_days: 10 }
    }
}

/// Metrics push-gateway parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Master switch
    pub enabled: bool,
    /// Push gateway endpoint, e.g. `https://pushgateway.example.org`
    pub push_gateway_url: String,
    /// Basic auth username; empty disables authentication
    pub username: String,
    /// Basic auth password
    pub password: String,
    /// Push interval in seconds
    pub push_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            push_gateway_url: String::new(),
            username: String::new(),
            password: String::new(),
            push_interval_secs: 5,
        }
    }
}

/// Directory layout. All state lives in flat files under `base_dir`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Container for every other directory
    pub base_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data"),
        }
    }
}

/// Complete, immutable client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory layout
    pub paths: PathsConfig,
    /// Record grammar and code tables
    pub grammar: GrammarConfig,
    /// Source selection
    pub source: SourceConfig,
    /// Device protocol parameters
    pub device: DeviceConfig,
    /// Downstream service endpoint
    pub server: ServerConfig,
    /// Pipeline tunables
    pub delivery: DeliveryConfig,
    /// Meal-break window
    pub mealbreak: MealBreakConfig,
    /// Retry store tunables
    pub retry: RetryConfig,
    /// Metrics push configuration
    pub metrics: MetricsConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Directory holding the stamping source files (local variant reads from
    /// here, remote variants stage fetched files here).
    pub fn source_dir(&self) -> PathBuf {
        self.paths.base_dir.join("source")
    }

    /// Directory for checkpoint, quarantine and last-request files.
    pub fn info_dir(&self) -> PathBuf {
        self.paths.base_dir.join("info")
    }

    /// Directory for the per-day device archive files.
    pub fn archives_dir(&self) -> PathBuf {
        self.paths.base_dir.join("archives")
    }

    /// Path of the checkpoint file.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.info_dir().join("last_file.txt")
    }

    /// Path of the bad-stampings retry file.
    pub fn bad_stampings_path(&self) -> PathBuf {
        self.info_dir().join("bad_stampings.txt")
    }

    /// Path of the parse-error quarantine file.
    pub fn parse_errors_path(&self) -> PathBuf {
        self.info_dir().join("parsing_errors.txt")
    }

    /// Path of the device last-request file.
    pub fn last_request_path(&self) -> PathBuf {
        self.info_dir().join("last_request.txt")
    }

    /// Path of the single-instance lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.paths.base_dir.join("client.pid")
    }

    /// Create every directory the client writes into.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in [
            self.paths.base_dir.clone(),
            self.source_dir(),
            self.info_dir(),
            self.archives_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| ConfigError::Directory {
                path: dir.display().to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}
