//! Ingestion orchestrator
//!
//! Ties the source retriever, the checkpoint store and the delivery
//! pipeline together into the two cycles the binary exposes: the run cycle
//! (fetch new lines and deliver them) and the resend cycle (replay
//! previously failed deliveries).
//!
//! Checkpointed sources resume inside the last retrieved file by comparing
//! its current size with the recorded one, then process every file sorting
//! after it. The already-delivered prefix of the checkpointed file is
//! reparsed to rebuild the per-badge session, so the meal-break inference
//! sees the whole day and not just the lines of the current run. The device
//! source has no checkpoint: each staged export file is processed whole and
//! removed.
//!
//! Source transfers are synchronous (FTP/SFTP sessions, the device settle
//! wait), so every retriever call runs on the blocking thread pool.

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::config::{ClientConfig, ConfigError, SourceKind};
use crate::grammar::RecordGrammar;
use crate::metrics::CycleTimer;
use crate::pipeline::{DeliveryPipeline, DeliveryReport};
use crate::quarantine::{QuarantineError, QuarantineStore};
use crate::retry::{RetryError, RetryStore};
use crate::sender::StampingSender;
use crate::source::{build_retriever, FetchedLines, RetrievalError, SourceRetriever};
use crate::Stamping;
use chrono::Local;
use std::collections::HashSet;
use tracing::{error, info, warn};

/// Errors that abort a cycle.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Configuration was unusable
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Source retrieval failed
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    /// Checkpoint could not be read or written
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Retry store could not be read or written
    #[error(transparent)]
    Retry(#[from] RetryError),

    /// Quarantine file could not be updated
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),

    /// The blocking retrieval task did not complete
    #[error("retrieval task failed: {0}")]
    RetrievalTask(String),
}

/// Drives a source retriever from async code.
///
/// The retriever moves onto the blocking thread pool for each call and back,
/// keeping FTP/SFTP sessions and the device settle wait off the runtime
/// worker threads.
struct SourceHandle {
    inner: Option<Box<dyn SourceRetriever + Send>>,
}

impl SourceHandle {
    fn new(inner: Box<dyn SourceRetriever + Send>) -> Self {
        Self { inner: Some(inner) }
    }

    async fn call<T, F>(&mut self, f: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SourceRetriever) -> Result<T, RetrievalError> + Send + 'static,
    {
        let mut retriever = self
            .inner
            .take()
            .ok_or_else(|| ClientError::RetrievalTask("retriever already lost".to_string()))?;
        let (retriever, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = f(retriever.as_mut());
            (retriever, outcome)
        })
        .await
        .map_err(|e| ClientError::RetrievalTask(e.to_string()))?;
        self.inner = Some(retriever);
        Ok(outcome?)
    }

    async fn list_candidate_files(&mut self) -> Result<Vec<String>, ClientError> {
        self.call(|retriever| retriever.list_candidate_files()).await
    }

    async fn file_size(&mut self, name: &str) -> Result<u64, ClientError> {
        let name = name.to_string();
        self.call(move |retriever| retriever.file_size(&name)).await
    }

    async fn fetch_lines(
        &mut self,
        name: &str,
        from_line: Option<u64>,
    ) -> Result<FetchedLines, ClientError> {
        let name = name.to_string();
        self.call(move |retriever| retriever.fetch_lines(&name, from_line))
            .await
    }
}

/// The stamping ingestion client.
pub struct StampingClient {
    config: ClientConfig,
    grammar: RecordGrammar,
    pipeline: DeliveryPipeline,
    checkpoints: CheckpointStore,
    retry: RetryStore,
    bad_stampings: QuarantineStore,
    parse_errors: QuarantineStore,
}

impl StampingClient {
    /// Build a client from the loaded configuration.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let grammar = RecordGrammar::new(&config.grammar)?;
        let sender = StampingSender::new(&config.server, &config.delivery)?;
        let pipeline = DeliveryPipeline::new(
            sender,
            grammar.clone(),
            config.mealbreak,
            config.delivery.workers,
        );
        Ok(Self {
            grammar,
            pipeline,
            checkpoints: CheckpointStore::new(config.checkpoint_path()),
            retry: RetryStore::new(config.bad_stampings_path(), config.retry.max_age_days),
            bad_stampings: QuarantineStore::new(config.bad_stampings_path()),
            parse_errors: QuarantineStore::new(config.parse_errors_path()),
            config,
        })
    }

    /// Run one ingestion cycle against the configured source.
    pub async fn run_cycle(&self) -> Result<(), ClientError> {
        let timer = CycleTimer::start("run");
        let mut source = SourceHandle::new(build_retriever(&self.config, &self.grammar));
        let outcome = match self.config.source.kind {
            SourceKind::Device => self.run_device_cycle(&mut source).await,
            _ => self.run_checkpointed_cycle(&mut source).await,
        };
        timer.finish();
        outcome
    }

    /// Resume inside the checkpointed file, then process every newer file.
    ///
    /// The checkpoint is saved after each file's batch, so a crash between
    /// files never reprocesses more than one batch.
    async fn run_checkpointed_cycle(&self, source: &mut SourceHandle) -> Result<(), ClientError> {
        let candidates = source.list_candidate_files().await?;
        let Some(last_candidate) = candidates.last().cloned() else {
            error!("no candidate stamping files at the source, cycle aborted");
            return Ok(());
        };

        // with no checkpoint history starts at the most recent file
        let checkpoint = match self.checkpoints.load()? {
            Some(checkpoint) => checkpoint,
            None => {
                info!(file = %last_candidate, "no checkpoint, starting from the latest file");
                Checkpoint {
                    file_name: last_candidate,
                    size: 0,
                    last_line: 0,
                }
            }
        };

        if candidates.contains(&checkpoint.file_name) {
            self.resume_file(source, &checkpoint).await?;
        } else {
            warn!(
                file = %checkpoint.file_name,
                "checkpointed file no longer at the source"
            );
        }

        for name in candidates
            .into_iter()
            .filter(|name| *name > checkpoint.file_name)
        {
            self.process_whole_file(source, &name).await?;
        }
        Ok(())
    }

    /// Process the checkpointed file from where the last run stopped.
    async fn resume_file(
        &self,
        source: &mut SourceHandle,
        checkpoint: &Checkpoint,
    ) -> Result<(), ClientError> {
        let size = source.file_size(&checkpoint.file_name).await?;
        if size == checkpoint.size {
            info!(file = %checkpoint.file_name, size, "checkpointed file unchanged");
            return Ok(());
        }
        if size < checkpoint.size {
            warn!(
                file = %checkpoint.file_name,
                recorded = checkpoint.size,
                current = size,
                "checkpointed file shrank, reprocessing from the top"
            );
        }

        // a regenerated file is replayed whole; an appended one is split at
        // the checkpoint line, the prefix rebuilding the delivery session
        let replay_whole = self.config.source.resend_all || size < checkpoint.size;
        let fetched = source.fetch_lines(&checkpoint.file_name, None).await?;
        let total_lines = fetched.total_lines;
        let (already_sent, to_deliver) = if replay_whole {
            (Vec::new(), fetched.lines)
        } else {
            let cut = (checkpoint.last_line as usize).min(fetched.lines.len());
            let mut sent_lines = fetched.lines;
            let mut to_deliver = sent_lines.split_off(cut);
            // exact re-appeared duplicates were already delivered
            to_deliver.retain(|line| !sent_lines.contains(line));
            (self.rebuild_session(&sent_lines), to_deliver)
        };
        info!(
            file = %checkpoint.file_name,
            new_lines = to_deliver.len(),
            session = already_sent.len(),
            "resuming checkpointed file"
        );

        let report = self.pipeline.deliver(to_deliver, already_sent).await;
        self.record_outcomes(&report)?;
        self.checkpoints.save(&Checkpoint {
            file_name: checkpoint.file_name.clone(),
            size,
            last_line: total_lines,
        })?;
        Ok(())
    }

    /// Reconstruct the stampings delivered by earlier runs from the raw
    /// lines preceding the checkpoint.
    fn rebuild_session(&self, sent_lines: &[String]) -> Vec<Stamping> {
        sent_lines
            .iter()
            .filter_map(|line| self.grammar.parse(line).ok())
            .filter(|stamping| !self.grammar.is_ignored(stamping))
            .collect()
    }

    /// Process a file never seen before, start to end.
    async fn process_whole_file(
        &self,
        source: &mut SourceHandle,
        name: &str,
    ) -> Result<(), ClientError> {
        let size = source.file_size(name).await?;
        let fetched = source.fetch_lines(name, None).await?;
        info!(file = name, lines = fetched.lines.len(), "processing new file");

        let report = self.pipeline.deliver(fetched.lines, Vec::new()).await;
        self.record_outcomes(&report)?;
        self.checkpoints.save(&Checkpoint {
            file_name: name.to_string(),
            size,
            last_line: fetched.total_lines,
        })?;
        Ok(())
    }

    /// Drain the staged device exports, whole files, no checkpoint.
    ///
    /// The reader re-exports overlapping windows, so lines are deduplicated
    /// within each staged file before delivery; cross-poll duplicates are
    /// already filtered by the archive and the last-request record.
    async fn run_device_cycle(&self, source: &mut SourceHandle) -> Result<(), ClientError> {
        let staged = source.list_candidate_files().await?;
        if staged.is_empty() {
            info!("no staged device exports to deliver");
            return Ok(());
        }

        for name in staged {
            let fetched = source.fetch_lines(&name, None).await?;
            let mut seen = HashSet::new();
            let lines: Vec<String> = fetched
                .lines
                .into_iter()
                .filter(|line| seen.insert(line.clone()))
                .collect();
            info!(file = %name, lines = lines.len(), "delivering staged export");

            let report = self.pipeline.deliver(lines, Vec::new()).await;
            self.record_outcomes(&report)?;

            let path = self.config.source_dir().join(&name);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "staged export not removed");
            }
        }
        Ok(())
    }

    /// Replay previously failed deliveries.
    ///
    /// A no-op when nothing is stored. Entries older than the configured
    /// age are dropped, entries that stopped parsing are quarantined, and
    /// whatever fails again is persisted for the next attempt.
    pub async fn resend_bad_cycle(&self) -> Result<(), ClientError> {
        let timer = CycleTimer::start("resend-bad");
        if !self.retry.exists() {
            info!("no bad stampings to resend");
            timer.finish();
            return Ok(());
        }

        let batch = self
            .retry
            .load_and_prune(&self.grammar, Local::now().naive_local())?;
        self.parse_errors.append(&batch.unparsable)?;

        let report = self.pipeline.deliver(batch.lines, Vec::new()).await;
        self.parse_errors.append(&report.parse_errors)?;
        self.retry.persist(&report.bad)?;

        timer.finish();
        Ok(())
    }

    fn record_outcomes(&self, report: &DeliveryReport) -> Result<(), QuarantineError> {
        self.bad_stampings.append(&report.bad)?;
        self.parse_errors.append(&report.parse_errors)?;
        Ok(())
    }
}
