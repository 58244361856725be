//! Delivery pipeline
//!
//! Fans a batch of raw lines out to a bounded pool of delivery workers.
//! Workers share a FIFO queue and two accumulators; the per-badge session
//! log of successful deliveries feeds the meal-break inference applied to
//! each stamping just before it is sent. The caller seeds the session with
//! the stampings delivered by earlier runs of the same file, so inference
//! keeps working across incremental resumes. `deliver` returns only after
//! every line has been handled by some worker.

use crate::config::MealBreakConfig;
use crate::grammar::RecordGrammar;
use crate::mealbreak::infer_meal_break;
use crate::sender::{SendOutcome, StampingSender};
use crate::{metrics, Stamping};
use futures_util::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of delivering one batch.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Lines successfully delivered
    pub delivered: usize,
    /// Raw lines that parsed but failed delivery
    pub bad: Vec<String>,
    /// Raw lines rejected by the grammar
    pub parse_errors: Vec<String>,
}

struct Shared {
    queue: Mutex<VecDeque<String>>,
    bad: Mutex<Vec<String>>,
    parse_errors: Mutex<Vec<String>>,
    delivered: Mutex<usize>,
    // successful deliveries per badge, for meal-break inference
    session: Mutex<HashMap<String, Vec<Stamping>>>,
}

/// Bounded-concurrency delivery of raw stamping lines.
#[derive(Clone)]
pub struct DeliveryPipeline {
    sender: StampingSender,
    grammar: RecordGrammar,
    window: MealBreakConfig,
    workers: usize,
}

impl DeliveryPipeline {
    /// Build a pipeline with the given collaborators.
    pub fn new(
        sender: StampingSender,
        grammar: RecordGrammar,
        window: MealBreakConfig,
        workers: usize,
    ) -> Self {
        Self {
            sender,
            grammar,
            window,
            workers: workers.max(1),
        }
    }

    /// Deliver a batch, blocking until every line has been processed.
    ///
    /// `already_sent` holds the stampings delivered for this file by earlier
    /// runs; they take part in the meal-break inference but are not resent.
    /// Order of delivery across workers is unspecified; the server accepts
    /// stampings in any order.
    pub async fn deliver(&self, lines: Vec<String>, already_sent: Vec<Stamping>) -> DeliveryReport {
        let total = lines.len();
        info!(
            lines = total,
            session = already_sent.len(),
            workers = self.workers,
            "delivering batch"
        );

        let mut session: HashMap<String, Vec<Stamping>> = HashMap::new();
        for stamping in already_sent {
            if let Some(badge) = stamping.badge_id.clone() {
                session.entry(badge).or_default().push(stamping);
            }
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(lines.into_iter().collect()),
            bad: Mutex::new(Vec::new()),
            parse_errors: Mutex::new(Vec::new()),
            delivered: Mutex::new(0),
            session: Mutex::new(session),
        });

        let workers: Vec<_> = (0..self.workers)
            .map(|id| {
                let pipeline = self.clone();
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { pipeline.run_worker(id, shared).await })
            })
            .collect();
        join_all(workers).await;

        let shared = match Arc::try_unwrap(shared) {
            Ok(shared) => shared,
            // workers have all been joined, so this cannot happen
            Err(shared) => {
                return DeliveryReport {
                    delivered: *shared.delivered.lock().await,
                    bad: shared.bad.lock().await.clone(),
                    parse_errors: shared.parse_errors.lock().await.clone(),
                }
            }
        };
        let report = DeliveryReport {
            delivered: shared.delivered.into_inner(),
            bad: shared.bad.into_inner(),
            parse_errors: shared.parse_errors.into_inner(),
        };

        metrics::record_batch(total, report.bad.len(), report.parse_errors.len());
        info!(
            delivered = report.delivered,
            bad = report.bad.len(),
            parse_errors = report.parse_errors.len(),
            "batch done"
        );
        report
    }

    async fn run_worker(&self, id: usize, shared: Arc<Shared>) {
        loop {
            let line = { shared.queue.lock().await.pop_front() };
            let line = match line {
                Some(line) => line,
                None => break,
            };
            debug!(worker = id, line = %line, "worker picked up line");
            self.process_line(line, &shared).await;
        }
    }

    async fn process_line(&self, line: String, shared: &Shared) {
        let mut stamping = match self.grammar.parse(&line) {
            Ok(stamping) => stamping,
            Err(e) => {
                warn!(error = %e, "line rejected by the grammar");
                shared.parse_errors.lock().await.push(line);
                return;
            }
        };

        if self.grammar.is_ignored(&stamping) {
            debug!(badge = stamping.badge_id.as_deref(), "stamping ignored");
            return;
        }

        if let Some(badge) = stamping.badge_id.clone() {
            let session = shared.session.lock().await;
            let already_sent = session.get(&badge).map(Vec::as_slice).unwrap_or(&[]);
            infer_meal_break(&mut stamping, already_sent, &self.window);
        }

        match self.sender.send(&stamping).await {
            SendOutcome::Delivered => {
                *shared.delivered.lock().await += 1;
                if let Some(badge) = stamping.badge_id.clone() {
                    shared
                        .session
                        .lock()
                        .await
                        .entry(badge)
                        .or_default()
                        .push(stamping);
                }
            }
            SendOutcome::Bad => shared.bad.lock().await.push(line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryConfig, GrammarConfig, ServerConfig};

    fn pipeline(workers: usize) -> DeliveryPipeline {
        // port 9 (discard) is never listening, so every send is a transport
        // failure and classifies as bad
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9,
            connect_timeout_secs: 1,
            request_timeout_secs: 1,
            ..ServerConfig::default()
        };
        let sender = StampingSender::new(&server, &DeliveryConfig::default()).unwrap();
        let grammar = RecordGrammar::new(&GrammarConfig::default()).unwrap();
        DeliveryPipeline::new(sender, grammar, MealBreakConfig::default(), workers)
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let report = pipeline(2).deliver(Vec::new(), Vec::new()).await;
        assert_eq!(report.delivered, 0);
        assert!(report.bad.is_empty());
        assert!(report.parse_errors.is_empty());
    }

    #[tokio::test]
    async fn test_parse_errors_are_accumulated_not_sent() {
        let report = pipeline(1)
            .deliver(
                vec!["garbage".to_string(), "more garbage".to_string()],
                Vec::new(),
            )
            .await;
        assert_eq!(report.parse_errors.len(), 2);
        assert!(report.bad.is_empty());
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn test_ignored_lines_produce_no_outcome() {
        // null transit parses but is filtered before delivery
        let report = pipeline(1)
            .deliver(
                vec!["013000232000013505605031400".to_string()],
                Vec::new(),
            )
            .await;
        assert_eq!(report.delivered, 0);
        assert!(report.bad.is_empty());
        assert!(report.parse_errors.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_marks_lines_bad() {
        let line = "E13000232000013505605031400".to_string();
        let report = pipeline(2).deliver(vec![line.clone()], Vec::new()).await;
        assert_eq!(report.bad, vec![line]);
        assert_eq!(report.delivered, 0);
    }
}
