//! Downstream delivery
//!
//! PUTs one stamping at a time to the presence-tracking service. The wire
//! format keeps the server's historical field names, so the service needs
//! no changes to accept records from this client.

use crate::config::{ConfigError, DeliveryConfig, ServerConfig};
use crate::{Reason, Stamping};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Classification of one delivery attempt.
///
/// Anything that is not a transport failure or a retryable status code
/// counts as delivered; the server reports validation problems in the
/// response body but those are not recoverable by resending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server accepted the stamping (or rejected it permanently)
    Delivered,
    /// Transport failure or retryable status; keep the line for resend
    Bad,
}

/// Wire representation of a stamping, field names fixed by the server API.
#[derive(Debug, Serialize)]
struct StampingPayload<'a> {
    #[serde(rename = "matricolaFirma")]
    badge_id: &'a str,
    #[serde(rename = "operazione")]
    operation: &'static str,
    #[serde(rename = "causale")]
    reason: Option<Reason>,
    #[serde(rename = "anno")]
    year: i32,
    #[serde(rename = "mese")]
    month: u32,
    #[serde(rename = "giorno")]
    day: u32,
    #[serde(rename = "ora")]
    hour: u32,
    #[serde(rename = "minuti")]
    minute: u32,
    #[serde(rename = "secondi")]
    second: u32,
    #[serde(rename = "tipo")]
    kind: Option<&'a str>,
    #[serde(rename = "giornoSettimana")]
    weekday: Option<&'a str>,
    #[serde(rename = "lettore")]
    reader: Option<&'a str>,
}

impl<'a> StampingPayload<'a> {
    /// Build the wire form. `None` when the stamping carries no badge id or
    /// no server operation code; such stampings never pass the ignore
    /// filter, so this is a guard, not an expected path.
    fn build(stamping: &'a Stamping) -> Option<Self> {
        Some(Self {
            badge_id: stamping.badge_id.as_deref()?,
            operation: stamping.operation.server_code()?,
            reason: stamping.reason,
            year: stamping.year,
            month: stamping.month,
            day: stamping.day,
            hour: stamping.hour,
            minute: stamping.minute,
            second: stamping.second,
            kind: stamping.kind.as_deref(),
            weekday: stamping.weekday.as_deref(),
            reader: stamping.reader.as_deref(),
        })
    }
}

/// HTTP client for the stamping creation resource.
#[derive(Debug, Clone)]
pub struct StampingSender {
    client: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
    retryable: HashSet<u16>,
}

impl StampingSender {
    /// Build the sender from the server and delivery configuration.
    pub fn new(server: &ServerConfig, delivery: &DeliveryConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(server.connect_timeout_secs))
            .timeout(std::time::Duration::from_secs(server.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let auth = if server.username.is_empty() {
            None
        } else {
            Some((server.username.clone(), server.password.clone()))
        };

        Ok(Self {
            client,
            url: server.stamping_url(),
            auth,
            retryable: delivery.retryable_status_codes.clone(),
        })
    }

    /// Deliver one stamping, classifying the outcome. Never fails.
    pub async fn send(&self, stamping: &Stamping) -> SendOutcome {
        let payload = match StampingPayload::build(stamping) {
            Some(payload) => payload,
            None => {
                warn!(?stamping, "stamping not expressible on the wire, kept for resend");
                return SendOutcome::Bad;
            }
        };

        debug!(badge = payload.badge_id, url = %self.url, "sending stamping");

        let mut request = self.client.put(&self.url).json(&payload);
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if self.retryable.contains(&status) {
                    warn!(status, badge = payload.badge_id, "retryable delivery failure");
                    SendOutcome::Bad
                } else {
                    info!(status, badge = payload.badge_id, "stamping sent");
                    SendOutcome::Delivered
                }
            }
            Err(e) => {
                warn!(error = %e, badge = payload.badge_id, "delivery transport failure");
                SendOutcome::Bad
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operation;

    fn stamping() -> Stamping {
        Stamping {
            badge_id: Some("000232".to_string()),
            operation: Operation::Exit,
            reason: Some(Reason::MealBreak),
            year: 2014,
            month: 3,
            day: 5,
            hour: 12,
            minute: 30,
            second: 0,
            kind: Some("1".to_string()),
            weekday: Some("3".to_string()),
            reader: Some("00".to_string()),
        }
    }

    #[test]
    fn test_payload_uses_server_field_names() {
        let s = stamping();
        let payload = StampingPayload::build(&s).unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["matricolaFirma"], "000232");
        assert_eq!(json["operazione"], "1");
        assert_eq!(json["causale"], "pausaPranzo");
        assert_eq!(json["anno"], 2014);
        assert_eq!(json["mese"], 3);
        assert_eq!(json["giorno"], 5);
        assert_eq!(json["ora"], 12);
        assert_eq!(json["minuti"], 30);
        assert_eq!(json["secondi"], 0);
        assert_eq!(json["lettore"], "00");
    }

    #[test]
    fn test_payload_reason_serializes_null_when_absent() {
        let mut s = stamping();
        s.reason = None;
        let json = serde_json::to_value(StampingPayload::build(&s).unwrap()).unwrap();
        assert!(json["causale"].is_null());
    }

    #[test]
    fn test_payload_requires_badge_and_server_code() {
        let mut s = stamping();
        s.badge_id = None;
        assert!(StampingPayload::build(&s).is_none());

        let mut s = stamping();
        s.operation = Operation::Transit;
        assert!(StampingPayload::build(&s).is_none());
    }
}
