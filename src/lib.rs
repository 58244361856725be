//! # Stamping Client Library
//!
//! Ingests fixed-format attendance "stamping" records produced by badge
//! readers, normalizes them, and delivers each record to a downstream
//! presence-tracking service over its REST API.
//!
//! ## Features
//!
//! - **Configurable record grammar**: a per-site regex with named captures
//!   tolerates reader-specific field layouts
//! - **Checkpointed retrieval**: resumes mid-file across process restarts
//!   without re-sending or dropping records
//! - **Multiple sources**: local directory, FTP, SFTP, or the badge reader's
//!   own command/response export protocol
//! - **Partial-failure bookkeeping**: failed deliveries go to a bounded-age
//!   retry store, unparsable lines to a parse-error quarantine
//!
//! ## Architecture
//!
//! - [`config`] - Immutable client configuration (code tables, grammar, sources)
//! - [`grammar`] - Raw line parsing and ignore filtering
//! - [`source`] - Polymorphic source retrievers and the device protocol
//! - [`pipeline`] - Bounded-concurrency delivery pipeline
//! - [`checkpoint`] - Durable (file, size, last-line) resume markers
//! - [`client`] - Cycle orchestration tying the above together

#![warn(clippy::all)]

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Per-day archive of device-exported stampings with dedup
pub mod archive;
/// Durable resume markers for incremental retrieval
pub mod checkpoint;
/// Cycle orchestration
pub mod client;
/// Immutable client configuration
pub mod config;
/// Record grammar: raw line to structured stamping
pub mod grammar;
/// Single-instance process lock
pub mod lock;
/// Meal-break reason inference
pub mod mealbreak;
/// Run metrics pushed to a Prometheus gateway
pub mod metrics;
/// Bounded worker pool delivering stampings downstream
pub mod pipeline;
/// Quarantine files and the device last-request record
pub mod quarantine;
/// Age-bounded resend of previously failed stampings
pub mod retry;
/// Downstream REST delivery
pub mod sender;
/// Source retrievers: local, FTP, SFTP, device protocol
pub mod source;

pub use config::ClientConfig;
pub use grammar::RecordGrammar;

/// Direction of a badge transit, after operation code translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Way-in transit
    Entrance,
    /// Way-out transit
    Exit,
    /// Access transit, not a presence event
    Transit,
    /// Null transit reported by some readers
    Null,
}

impl Operation {
    /// The operation code expected by the downstream service.
    ///
    /// Only entrance/exit transits are ever delivered; the other variants
    /// are dropped by the ignore filter before a payload is built.
    pub fn server_code(&self) -> Option<&'static str> {
        match self {
            Operation::Entrance => Some("0"),
            Operation::Exit => Some("1"),
            Operation::Transit | Operation::Null => None,
        }
    }
}

/// Optional classification of a stamping, after reason code translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    /// Out on service duty
    #[serde(rename = "motiviDiServizio")]
    ServiceDuty,
    /// Meal break
    #[serde(rename = "pausaPranzo")]
    MealBreak,
}

/// One badge-reader attendance event.
///
/// Constructed once by [`grammar::RecordGrammar::parse`] and immutable
/// afterwards, except for the meal-break inference pass which may assign
/// `reason` before delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamping {
    /// Zero-padded numeric badge identifier
    pub badge_id: Option<String>,
    /// Transit direction after code translation
    pub operation: Operation,
    /// Reason after code translation; `None` means no reason selected
    pub reason: Option<Reason>,
    /// Four-digit year (reader two-digit year plus the configured offset)
    pub year: i32,
    /// Month 1-12
    pub month: u32,
    /// Day of month 1-31
    pub day: u32,
    /// Hour
    pub hour: u32,
    /// Minute
    pub minute: u32,
    /// Second; defaults to 0 when the grammar has no capture for it
    pub second: u32,
    /// Reader-specific transit type field, informational
    pub kind: Option<String>,
    /// Day of week reported by the reader, informational
    pub weekday: Option<String>,
    /// Identifier of the reader that produced the record
    pub reader: Option<String>,
}

impl Stamping {
    /// Whether this stamping is a way-in transit.
    pub fn is_entrance(&self) -> bool {
        self.operation == Operation::Entrance
    }

    /// Whether this stamping is a way-out transit.
    pub fn is_exit(&self) -> bool {
        self.operation == Operation::Exit
    }

    /// Whether a reason was explicitly selected on the reader.
    pub fn has_reason(&self) -> bool {
        self.reason.is_some()
    }

    /// Validate the date/time bounds of the stamping.
    ///
    /// The bounds are deliberately lax (hour up to 24, minute and second up
    /// to 60): some reader firmwares emit such values for corrected transits
    /// and the downstream service normalizes them.
    pub fn validate(&self) -> Result<(), String> {
        if self.year < 1980 {
            return Err(format!("year {} is before 1980", self.year));
        }
        if !(1..=12).contains(&self.month) {
            return Err(format!("month {} out of range", self.month));
        }
        if !(1..=31).contains(&self.day) {
            return Err(format!("day {} out of range", self.day));
        }
        if self.hour > 24 {
            return Err(format!("hour {} out of range", self.hour));
        }
        if self.minute > 60 {
            return Err(format!("minute {} out of range", self.minute));
        }
        if self.second > 60 {
            return Err(format!("second {} out of range", self.second));
        }
        Ok(())
    }

    /// The stamping timestamp as a calendar datetime.
    ///
    /// Returns `None` when the lax bounds accepted by [`validate`] do not
    /// form a real datetime (e.g. hour 24 or February 30th).
    ///
    /// [`validate`]: Stamping::validate
    pub fn date_time(&self) -> Option<NaiveDateTime> {
        chrono::NaiveDate::from_ymd_opt(self.year, self.month, self.day)?
            .and_hms_opt(self.hour, self.minute, self.second)
    }

    /// Time-of-day ordering key used when reconstructing a session.
    pub fn time_key(&self) -> (u32, u32) {
        (self.hour, self.minute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamping() -> Stamping {
        Stamping {
            badge_id: Some("000232".to_string()),
            operation: Operation::Entrance,
            reason: None,
            year: 2014,
            month: 3,
            day: 5,
            hour: 13,
            minute: 50,
            second: 56,
            kind: None,
            weekday: None,
            reader: None,
        }
    }

    #[test]
    fn test_valid_stamping() {
        assert!(stamping().validate().is_ok());
    }

    #[test]
    fn test_year_before_1980_rejected() {
        let mut s = stamping();
        s.year = 1979;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_lax_hour_bound_accepted() {
        let mut s = stamping();
        s.hour = 24;
        s.minute = 0;
        s.second = 0;
        assert!(s.validate().is_ok());
        // but no calendar datetime exists for it
        assert!(s.date_time().is_none());
    }

    #[test]
    fn test_month_out_of_range_rejected() {
        let mut s = stamping();
        s.month = 13;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_date_time_formatting() {
        let dt = stamping().date_time().unwrap();
        assert_eq!(
            dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2014-03-05 13:50:56"
        );
    }

    #[test]
    fn test_server_codes() {
        assert_eq!(Operation::Entrance.server_code(), Some("0"));
        assert_eq!(Operation::Exit.server_code(), Some("1"));
        assert_eq!(Operation::Transit.server_code(), None);
    }
}
