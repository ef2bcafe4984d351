//! Chunked pipeline orchestrator
//!
//! Pulls bounded batches from a [`RecordSource`], runs every row through
//! normalize -> validate -> merge, emits the chunk's resolved records to a
//! [`RecordSink`] and commits. A chunk either commits as a whole (table,
//! report, offset and checkpoint) or is rolled back and the run aborts.
//!
//! Cancellation is cooperative: the token is checked at the top of every chunk
//! iteration, so the in-flight chunk always completes and the last committed
//! offset stays valid for resume.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, info_span, warn, Instrument};

use crate::checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_VERSION};
use crate::config::{EmitPolicy, PipelineConfig, PipelineOptions};
use crate::error::{ConfigError, SourceError, WriteError};
use crate::framework::{PipelineSnapshot, RecordSink, RecordSource, RunState, SourceBatch, SourceRow};
use crate::merge::{FoldItem, ResolvedRecord, ShardedTable};
use crate::normalize::IdentityKey;
use crate::observer::ReportObserver;
use crate::registry::HandlerRegistry;
use crate::report::{ProcessingReport, ReportMark, ReportSummary};

/// Final state of a run with its report and resume point
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub summary: ReportSummary,
    /// State as of the last committed chunk
    pub checkpoint: Checkpoint,
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }
}

enum ReadFailure {
    Cancelled,
    Source(SourceError),
}

/// Single-writer orchestrator owning the resolved table and the report
pub struct Pipeline {
    options: PipelineOptions,
    registry: HandlerRegistry,
    table: ShardedTable,
    report: ProcessingReport,
    /// Report including the diagnostics of a rolled-back chunk
    failed_report: Option<ProcessingReport>,
    /// Next source offset; everything before it is committed
    offset: u64,
    chunk_index: u64,
    state: RunState,
    cancel: CancellationToken,
    observers: Vec<Arc<dyn ReportObserver>>,
    store: Option<CheckpointStore>,
    /// Chunk index of the last checkpoint written to the store
    saved_chunk_index: Option<u64>,
    snapshots: watch::Sender<PipelineSnapshot>,
}

impl Pipeline {
    /// Validate the configuration and compile every record-type handler
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = HandlerRegistry::from_config(config)?;
        Self::with_registry(config.pipeline.clone(), registry)
    }

    /// Build around an already populated registry
    pub fn with_registry(options: PipelineOptions, registry: HandlerRegistry) -> Result<Self, ConfigError> {
        options.validate()?;
        if registry.is_empty() {
            return Err(ConfigError::option("record_types", "no record type handlers registered"));
        }

        let (snapshots, _) = watch::channel(PipelineSnapshot {
            offset: options.offset,
            ..PipelineSnapshot::default()
        });

        Ok(Self {
            table: ShardedTable::new(options.worker_concurrency),
            offset: options.offset,
            options,
            registry,
            report: ProcessingReport::new(),
            failed_report: None,
            chunk_index: 0,
            state: RunState::Idle,
            cancel: CancellationToken::new(),
            observers: Vec::new(),
            store: None,
            saved_chunk_index: None,
            snapshots,
        })
    }

    /// Resume from the state captured by a previous run
    pub fn from_checkpoint(config: &PipelineConfig, checkpoint: Checkpoint) -> Result<Self, ConfigError> {
        Self::new(config)?.resume(checkpoint)
    }

    /// Replace table, report and offset with a checkpoint's.
    ///
    /// The shard count must match the one the checkpoint was built with.
    pub fn resume(mut self, checkpoint: Checkpoint) -> Result<Self, ConfigError> {
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(ConfigError::Checkpoint(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }
        if checkpoint.worker_concurrency != self.options.worker_concurrency {
            return Err(ConfigError::Checkpoint(format!(
                "checkpoint was built with worker_concurrency {} but the configuration sets {}",
                checkpoint.worker_concurrency, self.options.worker_concurrency
            )));
        }

        info!(
            offset = checkpoint.offset,
            chunk_index = checkpoint.chunk_index,
            groups = checkpoint.table.len(),
            "Resuming from checkpoint"
        );

        self.table = ShardedTable::restore(checkpoint.table, self.options.worker_concurrency);
        self.report = checkpoint.report;
        self.offset = checkpoint.offset;
        self.chunk_index = checkpoint.chunk_index;
        self.publish();
        Ok(self)
    }

    pub fn with_observer(mut self, observer: Arc<dyn ReportObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Persist a checkpoint every `checkpoint_interval` commits and when the
    /// run ends
    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Token that stops the run at the next chunk boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receiver of a fresh snapshot after every state change
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            state: self.state.clone(),
            offset: self.offset,
            chunk_index: self.chunk_index,
            counts: self.report.counts,
            resolved_groups: self.table.len(),
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            offset: self.offset,
            chunk_index: self.chunk_index,
            worker_concurrency: self.table.shard_count(),
            table: self.table.snapshot(),
            report: self.report.clone(),
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn report(&self) -> &ProcessingReport {
        &self.report
    }

    pub fn resolved(&self, key: &IdentityKey) -> Option<&ResolvedRecord> {
        self.table.get(key)
    }

    /// Drive the run until the source is exhausted, the token is cancelled or
    /// a fatal condition aborts it.
    ///
    /// A `Stopped` run resumes through [`Pipeline::from_checkpoint`] with the
    /// outcome's checkpoint.
    pub async fn run(&mut self, source: &dyn RecordSource, sink: &dyn RecordSink) -> RunOutcome {
        let span = info_span!("pipeline_run", run_id = %self.report.run_id);
        self.execute(source, sink).instrument(span).await
    }

    async fn execute(&mut self, source: &dyn RecordSource, sink: &dyn RecordSink) -> RunOutcome {
        if matches!(self.state, RunState::Done | RunState::Aborted { .. }) {
            warn!(state = %self.state, "Run already finished");
            return self.outcome();
        }

        info!(
            source = %source.describe(),
            sink = %sink.describe(),
            offset = self.offset,
            chunk_size = self.options.chunk_size,
            workers = self.options.worker_concurrency,
            "Starting pipeline run"
        );

        let state = self.drive(source, sink).await;
        match &state {
            RunState::Done => info!(offset = self.offset, chunks = self.chunk_index, "Source exhausted"),
            RunState::Stopped => info!(offset = self.offset, "Run stopped at chunk boundary"),
            RunState::Aborted { reason } => warn!(offset = self.offset, %reason, "Run aborted"),
            _ => {}
        }
        if self.saved_chunk_index != Some(self.chunk_index) {
            if let Err(reason) = self.save_checkpoint() {
                warn!(%reason, "Failed to save final checkpoint");
            }
        }
        self.set_state(state);

        let outcome = self.outcome();
        for observer in &self.observers {
            observer.on_finish(&outcome.summary);
        }
        outcome
    }

    async fn drive(&mut self, source: &dyn RecordSource, sink: &dyn RecordSink) -> RunState {
        loop {
            if self.cancel.is_cancelled() {
                return RunState::Stopped;
            }

            self.set_state(RunState::Reading);
            let batch = match self.read(source).await {
                Ok(batch) => batch,
                Err(ReadFailure::Cancelled) => return RunState::Stopped,
                Err(ReadFailure::Source(e)) => {
                    return RunState::Aborted {
                        reason: format!("source {} unavailable: {}", source.describe(), e),
                    }
                }
            };

            let SourceBatch {
                rows,
                next_offset,
                exhausted,
            } = batch;

            if rows.is_empty() {
                if exhausted {
                    self.set_state(RunState::Finalizing);
                    return RunState::Done;
                }
                return RunState::Aborted {
                    reason: format!("source returned no rows at offset {} but is not exhausted", self.offset),
                };
            }
            if next_offset <= self.offset {
                return RunState::Aborted {
                    reason: format!("source did not advance past offset {}", self.offset),
                };
            }

            let span = debug_span!("chunk", chunk_index = self.chunk_index, offset = self.offset);
            if let Err(reason) = self.process_chunk(rows, next_offset, sink).instrument(span).await {
                return RunState::Aborted { reason };
            }

            if exhausted {
                self.set_state(RunState::Finalizing);
                return RunState::Done;
            }
        }
    }

    /// Read the next batch, retrying with linear backoff
    async fn read(&self, source: &dyn RecordSource) -> Result<SourceBatch, ReadFailure> {
        let mut attempt: u32 = 0;
        loop {
            match source.next(self.options.chunk_size, self.offset).await {
                Ok(batch) => return Ok(batch),
                Err(e) if attempt < self.options.source_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(self.options.retry_backoff_ms.saturating_mul(u64::from(attempt)));
                    warn!(
                        attempt,
                        offset = self.offset,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Source read failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ReadFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(ReadFailure::Source(e)),
            }
        }
    }

    async fn process_chunk(
        &mut self,
        rows: Vec<SourceRow>,
        next_offset: u64,
        sink: &dyn RecordSink,
    ) -> Result<(), String> {
        let chunk_index = self.chunk_index;
        self.set_state(RunState::Processing { chunk_index });
        self.table.begin_chunk();
        let mark = self.report.mark();

        let row_count = rows.len();
        let mut source_failures = 0usize;
        let mut items = Vec::new();

        for row in rows {
            let raw = match row.record {
                Ok(raw) => raw,
                Err(reason) => {
                    debug!(offset = row.offset, %reason, "Source row failed");
                    source_failures += 1;
                    self.report.record_source_error(chunk_index, row.offset, reason);
                    continue;
                }
            };
            self.report.counts.read += 1;

            let Some(handler) = self.registry.get(&row.record_type) else {
                self.report.record_normalization_error(
                    chunk_index,
                    row.offset,
                    format!("no handler registered for record type '{}'", row.record_type),
                );
                continue;
            };

            let normalized = match handler.normalize(&raw, row.offset) {
                Ok(normalized) => normalized,
                Err(e) => {
                    debug!(offset = row.offset, error = %e, "Normalization failed");
                    self.report.record_normalization_error(chunk_index, row.offset, e.to_string());
                    continue;
                }
            };
            self.report.counts.normalized += 1;
            for field in &normalized.coercion_warnings {
                self.report.record_coercion_warning(field);
            }

            let record = normalized.record;
            let validation = handler.validate(&record);
            self.report.record_validation(
                chunk_index,
                row.offset,
                &record.identity_key.to_string(),
                &validation,
            );
            if validation.has_errors() {
                debug!(
                    offset = row.offset,
                    identity_key = %record.identity_key,
                    violations = validation.errors().count(),
                    "Record rejected by validation"
                );
                continue;
            }

            items.push(FoldItem {
                record,
                strategy: handler.merge_strategy(),
            });
        }

        if source_failures == row_count {
            self.abandon_chunk(mark);
            return Err(format!(
                "every row of chunk {} at offset {} failed to decode",
                chunk_index, self.offset
            ));
        }

        for result in self.table.fold_batch(items, self.options.max_provenance_history) {
            match result.outcome {
                Ok(_) => self.report.counts.merged += 1,
                Err(conflict) => {
                    warn!(offset = result.offset, identity_key = %result.key, error = %conflict, "Merge conflict");
                    self.report
                        .record_merge_conflict(chunk_index, result.offset, &result.key.to_string(), conflict.to_string());
                }
            }
        }

        self.emit(chunk_index, mark, sink).await?;

        self.table.commit_chunk();
        self.offset = next_offset;
        self.chunk_index += 1;
        self.report.counts.chunks += 1;

        if self.chunk_index % self.options.checkpoint_interval == 0 {
            self.save_checkpoint()?;
        }

        let snapshot = self.snapshot();
        debug!(
            read = snapshot.counts.read,
            merged = snapshot.counts.merged,
            groups = snapshot.resolved_groups,
            "Chunk committed"
        );
        for observer in &self.observers {
            observer.on_chunk(&snapshot);
        }
        self.publish();
        Ok(())
    }

    /// Hand the chunk's resolved records to the sink.
    ///
    /// When no record is accepted the chunk is rolled back before returning
    /// the abort reason.
    async fn emit(
        &mut self,
        chunk_index: u64,
        mark: ReportMark,
        sink: &dyn RecordSink,
    ) -> Result<(), String> {
        let pending: Vec<ResolvedRecord> = self
            .table
            .touched()
            .into_iter()
            .filter(|record| match self.options.emit {
                EmitPolicy::Touched => true,
                EmitPolicy::Changed => record.changed_since_emit(),
            })
            .cloned()
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        let failed: BTreeMap<IdentityKey, String> = match sink.write(&pending).await {
            Ok(()) => BTreeMap::new(),
            Err(WriteError::Rejected { failures }) => {
                failures.into_iter().map(|f| (f.key, f.reason)).collect()
            }
            Err(WriteError::Unavailable(reason)) => pending
                .iter()
                .map(|record| (record.key.clone(), reason.clone()))
                .collect(),
        };

        if pending.iter().all(|record| failed.contains_key(&record.key)) {
            let report = self.abandon_chunk(mark.clone());
            report.rewind(mark);
            for (key, reason) in &failed {
                report.record_write_error(chunk_index, &key.to_string(), reason.clone());
            }
            return Err(format!(
                "sink {} rejected all {} records of chunk {}",
                sink.describe(),
                pending.len(),
                chunk_index
            ));
        }

        for record in &pending {
            if let Some(reason) = failed.get(&record.key) {
                warn!(identity_key = %record.key, %reason, "Sink rejected record");
                self.report.record_write_error(chunk_index, &record.key.to_string(), reason.clone());
                continue;
            }
            match record.fingerprint() {
                Ok(fingerprint) => self.table.mark_emitted(&record.key, fingerprint),
                Err(e) => warn!(identity_key = %record.key, error = %e, "Failed to fingerprint emitted record"),
            }
            self.report.counts.emitted += 1;
        }
        Ok(())
    }

    /// Roll the open chunk back to the last commit.
    ///
    /// Returns the report the failure is attached to; it only feeds the final
    /// summary, never a checkpoint.
    fn abandon_chunk(&mut self, mark: ReportMark) -> &mut ProcessingReport {
        self.table.rollback_chunk();
        let mut committed = self.report.clone();
        committed.rewind(mark);
        let failed = std::mem::replace(&mut self.report, committed);
        self.failed_report.insert(failed)
    }

    fn save_checkpoint(&mut self) -> Result<(), String> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store
            .save(&self.checkpoint())
            .map_err(|e| format!("failed to save checkpoint to {}: {}", store.path().display(), e))?;
        self.saved_chunk_index = Some(self.chunk_index);
        Ok(())
    }

    fn set_state(&mut self, state: RunState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn outcome(&self) -> RunOutcome {
        let report = self.failed_report.as_ref().unwrap_or(&self.report);
        RunOutcome {
            state: self.state.clone(),
            summary: report.finalize(&self.state, self.table.len(), self.options.top_violations),
            checkpoint: self.checkpoint(),
        }
    }
}
