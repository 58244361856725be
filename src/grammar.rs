//! Record grammar
//!
//! Parses one raw badge-reader line into a [`Stamping`] by matching it
//! against the configured field pattern and translating the operation and
//! reason codes through their tables. The capture names are fixed across
//! deployments (they come from the reader vendor documentation); which of
//! them a given site uses is decided by its pattern.

use crate::config::{ConfigError, GrammarConfig, ReasonCode};
use crate::{Operation, Stamping};
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Capture names understood by the grammar.
mod capture {
    pub const OPERATION: &str = "operazione";
    pub const KIND: &str = "tipo";
    pub const WEEKDAY: &str = "giornoSettimana";
    pub const BADGE: &str = "matricolaFirma";
    pub const REASON: &str = "causale";
    pub const HOUR: &str = "ora";
    pub const MINUTE: &str = "minuti";
    pub const SECOND: &str = "secondi";
    pub const DAY: &str = "giorno";
    pub const MONTH: &str = "mese";
    pub const YEAR: &str = "anno";
    pub const READER: &str = "lettore";
}

/// A raw line that could not be interpreted under the configured grammar.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The pattern did not match
    #[error("line does not match the record pattern: {0}")]
    NoMatch(String),

    /// A required capture was missing from the pattern
    #[error("missing required field `{field}` in line: {line}")]
    MissingField {
        /// Capture name
        field: &'static str,
        /// Offending line
        line: String,
    },

    /// A numeric field failed integer conversion
    #[error("invalid numeric field `{field}` in line: {line}")]
    InvalidNumber {
        /// Capture name
        field: &'static str,
        /// Offending line
        line: String,
    },

    /// The parsed stamping failed the validity checks
    #[error("invalid stamping ({reason}) in line: {line}")]
    Invalid {
        /// Which validity check failed
        reason: String,
        /// Offending line
        line: String,
    },
}

/// Compiled record grammar with its code tables.
#[derive(Debug, Clone)]
pub struct RecordGrammar {
    pattern: Regex,
    year_offset: i32,
    operation_codes: HashMap<String, Operation>,
    reason_codes: HashMap<String, ReasonCode>,
    ignored_badges: HashSet<String>,
}

impl RecordGrammar {
    /// Compile the grammar from its configuration.
    pub fn new(config: &GrammarConfig) -> Result<Self, ConfigError> {
        let pattern =
            Regex::new(&config.pattern).map_err(|e| ConfigError::InvalidPattern(e.to_string()))?;
        Ok(Self {
            pattern,
            year_offset: config.year_offset,
            operation_codes: config.operation_codes.clone(),
            reason_codes: config.reason_codes.clone(),
            ignored_badges: config.ignored_badges.clone(),
        })
    }

    /// Parse one raw line into a structured stamping.
    pub fn parse(&self, raw: &str) -> Result<Stamping, ParseError> {
        let line = raw.trim();
        debug!(line, "parsing stamping line");

        let caps = self
            .pattern
            .captures(line)
            .ok_or_else(|| ParseError::NoMatch(line.to_string()))?;

        let op_code = capture_str(&caps, capture::OPERATION).ok_or(ParseError::MissingField {
            field: capture::OPERATION,
            line: line.to_string(),
        })?;
        // a code outside the table is not a parse failure: the stamping is
        // dropped by the ignore filter instead of being quarantined
        let operation = match self.operation_codes.get(op_code) {
            Some(operation) => *operation,
            None => {
                debug!(code = op_code, line, "unmapped operation code");
                Operation::Null
            }
        };

        let reason = match capture_str(&caps, capture::REASON) {
            Some(code) => match self.reason_codes.get(code) {
                Some(reason_code) => reason_code.to_reason(),
                None => {
                    warn!(code, line, "unknown reason code, clearing reason");
                    None
                }
            },
            None => None,
        };

        let stamping = Stamping {
            badge_id: capture_str(&caps, capture::BADGE).map(str::to_string),
            operation,
            reason,
            year: capture_i32(&caps, capture::YEAR, line)? + self.year_offset,
            month: capture_u32(&caps, capture::MONTH, line)?,
            day: capture_u32(&caps, capture::DAY, line)?,
            hour: capture_u32(&caps, capture::HOUR, line)?,
            minute: capture_u32(&caps, capture::MINUTE, line)?,
            second: match capture_str(&caps, capture::SECOND) {
                Some(_) => capture_u32(&caps, capture::SECOND, line)?,
                None => 0,
            },
            kind: capture_str(&caps, capture::KIND).map(str::to_string),
            weekday: capture_str(&caps, capture::WEEKDAY).map(str::to_string),
            reader: capture_str(&caps, capture::READER).map(str::to_string),
        };

        stamping.validate().map_err(|reason| ParseError::Invalid {
            reason,
            line: line.to_string(),
        })?;

        Ok(stamping)
    }

    /// Whether a parsed stamping must be dropped instead of delivered.
    ///
    /// Stampings without a badge id, from an excluded badge, or whose
    /// operation is neither an entrance nor an exit are ignored.
    pub fn is_ignored(&self, stamping: &Stamping) -> bool {
        match &stamping.badge_id {
            None => true,
            Some(badge) if self.ignored_badges.contains(badge) => true,
            Some(_) => !matches!(stamping.operation, Operation::Entrance | Operation::Exit),
        }
    }
}

fn capture_str<'a>(caps: &'a Captures<'_>, name: &str) -> Option<&'a str> {
    caps.name(name).map(|m| m.as_str())
}

fn capture_i32(caps: &Captures<'_>, field: &'static str, line: &str) -> Result<i32, ParseError> {
    let text = capture_str(caps, field).ok_or(ParseError::MissingField {
        field,
        line: line.to_string(),
    })?;
    text.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        line: line.to_string(),
    })
}

fn capture_u32(caps: &Captures<'_>, field: &'static str, line: &str) -> Result<u32, ParseError> {
    let text = capture_str(caps, field).ok_or(ParseError::MissingField {
        field,
        line: line.to_string(),
    })?;
    text.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        line: line.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrammarConfig;
    use crate::Reason;

    fn grammar() -> RecordGrammar {
        RecordGrammar::new(&GrammarConfig::default()).unwrap()
    }

    // Smartclock layout, 27 chars:
    // op(1) tipo(1) weekday(1) badge(6) reason(4) hh mm ss dd MM yy reader(2)
    const ENTRANCE_LINE: &str = "E13000232000013505605031400";

    #[test]
    fn test_parse_smartclock_entrance() {
        let stamping = grammar().parse(ENTRANCE_LINE).unwrap();
        assert_eq!(stamping.operation, Operation::Entrance);
        assert_eq!(stamping.badge_id.as_deref(), Some("000232"));
        assert_eq!(stamping.reason, None);
        assert_eq!(stamping.hour, 13);
        assert_eq!(stamping.minute, 50);
        assert_eq!(stamping.second, 56);
        assert_eq!(stamping.day, 5);
        assert_eq!(stamping.month, 3);
        assert_eq!(stamping.year, 2014);
        assert_eq!(stamping.kind.as_deref(), Some("1"));
        assert_eq!(stamping.weekday.as_deref(), Some("3"));
        assert_eq!(stamping.reader.as_deref(), Some("00"));
    }

    #[test]
    fn test_trailing_crlf_tolerated() {
        let with_crlf = format!("{ENTRANCE_LINE}\r\n");
        assert_eq!(
            grammar().parse(&with_crlf).unwrap(),
            grammar().parse(ENTRANCE_LINE).unwrap()
        );
    }

    #[test]
    fn test_parse_exit_with_meal_break_reason() {
        let stamping = grammar().parse("U11002554000312153317011100").unwrap();
        assert_eq!(stamping.operation, Operation::Exit);
        assert_eq!(stamping.reason, Some(Reason::MealBreak));
        assert_eq!(stamping.hour, 12);
        assert_eq!(stamping.minute, 15);
        assert_eq!(stamping.year, 2011);
    }

    #[test]
    fn test_parse_service_duty_reason() {
        let stamping = grammar().parse("U11002554000212153317011100").unwrap();
        assert_eq!(stamping.reason, Some(Reason::ServiceDuty));
    }

    #[test]
    fn test_unknown_reason_code_cleared() {
        // reason code 9999 is not in the table
        let stamping = grammar().parse("E11002554999912153317011100").unwrap();
        assert_eq!(stamping.reason, None);
    }

    #[test]
    fn test_unmatched_line_rejected() {
        let err = grammar().parse("not a stamping").unwrap_err();
        assert!(matches!(err, ParseError::NoMatch(_)));
    }

    #[test]
    fn test_invalid_month_rejected() {
        // month field 13
        let err = grammar().parse("E11002554000012153317131100").unwrap_err();
        assert!(matches!(err, ParseError::Invalid { .. }));
    }

    #[test]
    fn test_unmapped_operation_code_parses_and_is_ignored() {
        let mut config = GrammarConfig::default();
        config.pattern = config.pattern.replace("[0EUT]", "[0EUTX]");
        let g = RecordGrammar::new(&config).unwrap();
        // X is not in the operation table
        let stamping = g.parse("X13000232000013505605031400").unwrap();
        assert_eq!(stamping.operation, Operation::Null);
        assert!(g.is_ignored(&stamping));
    }

    #[test]
    fn test_null_transit_parses_but_is_ignored() {
        let g = grammar();
        let stamping = g.parse("013000232000013505605031400").unwrap();
        assert_eq!(stamping.operation, Operation::Null);
        assert!(g.is_ignored(&stamping));
    }

    #[test]
    fn test_excluded_badge_ignored() {
        let mut config = GrammarConfig::default();
        config.ignored_badges.insert("000232".to_string());
        let g = RecordGrammar::new(&config).unwrap();
        let stamping = g.parse(ENTRANCE_LINE).unwrap();
        assert!(g.is_ignored(&stamping));
    }

    #[test]
    fn test_missing_badge_ignored() {
        let g = grammar();
        let mut stamping = g.parse(ENTRANCE_LINE).unwrap();
        stamping.badge_id = None;
        assert!(g.is_ignored(&stamping));
    }

    #[test]
    fn test_deliverable_stamping_not_ignored() {
        let g = grammar();
        let stamping = g.parse(ENTRANCE_LINE).unwrap();
        assert!(!g.is_ignored(&stamping));
    }

    #[test]
    fn test_pattern_without_seconds_defaults_to_zero() {
        let mut config = GrammarConfig::default();
        // layout without seconds or reader id, e.g. older readers
        config.pattern = concat!(
            "^(?P<matricolaFirma>\\d{6})(?P<giorno>\\d{2})(?P<mese>\\d{2})",
            "(?P<anno>\\d{2})(?P<operazione>[EU])(?P<ora>\\d{2})(?P<minuti>\\d{2})$"
        )
        .to_string();
        let g = RecordGrammar::new(&config).unwrap();
        let stamping = g.parse("000232050314E1350").unwrap();
        assert_eq!(stamping.second, 0);
        assert_eq!(stamping.reader, None);
        assert_eq!(stamping.reason, None);
        assert_eq!(stamping.year, 2014);
    }

    #[test]
    fn test_bad_pattern_rejected_at_build() {
        let mut config = GrammarConfig::default();
        config.pattern = "(".to_string();
        assert!(RecordGrammar::new(&config).is_err());
    }
}
