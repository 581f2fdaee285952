use crate::archive::bus::{self, BusReader, RawBusRecord, ReadRequest};
use crate::archive::config::ArchiveWriterConfig;
use crate::archive::contracts::{ArchiveEventRecord, OriginOffset, unwrap_bus_payload};
use crate::archive::governance::GovernanceEmitter;
use crate::archive::ledger::{ArchiveWriterLedger, ObserveOutcome};
use crate::archive::observability::{
    ArchiveWriterRunMetrics, ArtifactScope, Counter, health_document, health_path,
    metrics_document, metrics_path,
};
use crate::archive::reconciliation::{
    ArchiveWriterReconciliation, ReconciliationRow, reconciliation_path,
};
use crate::archive::store::{self, ObjectStore};
use crate::archive::util::now_utc;
use crate::error::ObjectStoreError;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub topics: Vec<String>,
    pub max_records_per_poll: usize,
    pub idle_sleep: Duration,
    pub required_platform_run_id: Option<String>,
}

impl WorkerSettings {
    pub fn from_config(cfg: &ArchiveWriterConfig) -> Self {
        Self {
            topics: cfg
                .bus
                .topics
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            max_records_per_poll: usize::try_from(cfg.poll.max_records_per_poll).unwrap_or(usize::MAX),
            idle_sleep: Duration::from_millis(cfg.poll.idle_sleep_ms),
            required_platform_run_id: cfg.required_platform_run_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Records handed to `process_record` this cycle.
    pub processed: usize,
    pub committed: usize,
    /// Partitions whose batch stopped at an uncommitted record.
    pub blocked_partitions: usize,
    pub exported_run: Option<String>,
}

pub struct ArchiveWriterWorker {
    settings: WorkerSettings,
    ledger: ArchiveWriterLedger,
    reader: Box<dyn BusReader>,
    store: Box<dyn ObjectStore>,
    governance: GovernanceEmitter,
    metrics: ArchiveWriterRunMetrics,
    reconciliation: ArchiveWriterReconciliation,
    last_platform_run_id: Option<String>,
    exported_once: bool,
}

impl ArchiveWriterWorker {
    pub fn new(
        settings: WorkerSettings,
        ledger: ArchiveWriterLedger,
        reader: Box<dyn BusReader>,
        store: Box<dyn ObjectStore>,
        governance: GovernanceEmitter,
    ) -> Self {
        Self {
            settings,
            ledger,
            reader,
            store,
            governance,
            metrics: ArchiveWriterRunMetrics::default(),
            reconciliation: ArchiveWriterReconciliation::default(),
            last_platform_run_id: None,
            exported_once: false,
        }
    }

    pub fn from_config(cfg: &ArchiveWriterConfig) -> Result<Self> {
        let stream_id = cfg.effective_stream_id();
        let ledger = ArchiveWriterLedger::open(&cfg.ledger.locator, stream_id.as_str())
            .with_context(|| format!("failed to open ledger for stream {stream_id}"))?;
        let reader = bus::open_reader(&cfg.bus).context("failed to open bus reader")?;
        let store = store::open_store(&cfg.object_store).context("failed to open object store")?;
        let governance = GovernanceEmitter::new(cfg.governance.log_path.as_ref().map(PathBuf::from));
        Ok(Self::new(
            WorkerSettings::from_config(cfg),
            ledger,
            reader,
            store,
            governance,
        ))
    }

    pub fn metrics(&self) -> &ArchiveWriterRunMetrics {
        &self.metrics
    }

    pub fn reconciliation(&self) -> &ArchiveWriterReconciliation {
        &self.reconciliation
    }

    pub fn ledger(&self) -> &ArchiveWriterLedger {
        &self.ledger
    }

    /// `required_platform_run_id`, else the run of the latest canonical record.
    pub fn active_platform_run_id(&self) -> Option<&str> {
        self.settings
            .required_platform_run_id
            .as_deref()
            .or(self.last_platform_run_id.as_deref())
    }

    /// One poll cycle. Ledger and reader failures end the cycle with an error;
    /// per-record problems are absorbed into counters.
    pub fn run_once(&mut self) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();
        let mut budget = self.settings.max_records_per_poll;
        let topics = self.settings.topics.clone();

        'topics: for topic in &topics {
            let partitions = self
                .reader
                .list_partitions(topic)
                .with_context(|| format!("failed to list partitions for {topic}"))?;
            for partition in partitions {
                if budget == 0 {
                    break 'topics;
                }
                let checkpoint = self.ledger.next_offset(topic, partition)?;
                let request = ReadRequest {
                    topic,
                    partition,
                    from: checkpoint.as_ref(),
                    max_records: budget,
                };
                let records = self
                    .reader
                    .read(&request)
                    .with_context(|| format!("failed to read {topic} partition {partition}"))?;

                for raw in records.iter().take(budget) {
                    budget -= 1;
                    outcome.processed += 1;
                    self.metrics.bump(Counter::SeenTotal);
                    if !self.process_record(raw)? {
                        outcome.blocked_partitions += 1;
                        break;
                    }
                    outcome.committed += 1;
                    self.advance(raw)?;
                }
            }
        }

        if outcome.processed > 0 || !self.exported_once {
            outcome.exported_run = self.export();
        }
        Ok(outcome)
    }

    /// Classifies and archives one record. Returns whether the record is
    /// committed, i.e. whether the checkpoint may move past it.
    pub fn process_record(&mut self, raw: &RawBusRecord) -> Result<bool> {
        let record = match canonicalize(raw) {
            Ok(record) => record,
            Err(violation) => {
                tracing::warn!(
                    topic = %raw.topic,
                    partition = raw.partition,
                    offset = %raw.offset,
                    reason = %violation,
                    "skipping non-canonical bus record"
                );
                return Ok(true);
            }
        };

        if let Some(required) = &self.settings.required_platform_run_id {
            if record.platform_run_id != *required {
                tracing::debug!(
                    topic = %raw.topic,
                    offset = %raw.offset,
                    platform_run_id = %record.platform_run_id,
                    "record outside the configured run scope"
                );
                return Ok(true);
            }
        }
        self.last_platform_run_id = Some(record.platform_run_id.clone());

        let relative_path = record.archive_relative_path();
        let tentative_ref = self.store.ref_for(&relative_path);
        let observation = self.ledger.observe(
            &record.origin_offset,
            &record.payload_hash,
            &tentative_ref,
            &record.archived_at_utc,
        )?;

        let (outcome, archive_ref) = match observation.outcome {
            ObserveOutcome::New => {
                let written = record
                    .to_document()
                    .map_err(ObjectStoreError::from)
                    .and_then(|document| self.store.write_json_if_absent(&relative_path, &document));
                match written {
                    Ok(reference) => {
                        self.metrics.bump(Counter::ArchivedTotal);
                        (ObserveOutcome::New, reference)
                    }
                    Err(err) if err.is_already_exists() => {
                        // Object written by an earlier attempt that never reached the ledger.
                        tracing::info!(
                            archive_ref = %tentative_ref,
                            "archive object already present; counting as duplicate"
                        );
                        self.metrics.bump(Counter::DuplicateTotal);
                        (ObserveOutcome::Duplicate, tentative_ref)
                    }
                    Err(err) => {
                        self.metrics.bump(Counter::WriteErrorTotal);
                        let cleared = self
                            .ledger
                            .clear_observation(&record.origin_offset, &record.payload_hash)?;
                        tracing::error!(
                            topic = %record.origin_offset.topic,
                            partition = record.origin_offset.partition,
                            offset_kind = %record.origin_offset.offset_kind,
                            offset = %record.origin_offset.offset,
                            event_id = %record.event_id,
                            archive_ref = %tentative_ref,
                            ledger_row_cleared = cleared,
                            error = %err,
                            "archive write failed; record will be retried"
                        );
                        return Ok(false);
                    }
                }
            }
            ObserveOutcome::Duplicate => {
                self.metrics.bump(Counter::DuplicateTotal);
                (ObserveOutcome::Duplicate, observation.archive_ref.clone())
            }
            ObserveOutcome::PayloadMismatch => {
                self.metrics.bump(Counter::PayloadMismatchTotal);
                self.governance
                    .payload_mismatch(self.ledger.stream_id(), &record, &observation);
                (ObserveOutcome::PayloadMismatch, observation.archive_ref.clone())
            }
        };

        self.reconciliation.add(ReconciliationRow {
            topic: record.origin_offset.topic.clone(),
            partition: record.origin_offset.partition,
            offset: record.origin_offset.offset.clone(),
            offset_kind: record.origin_offset.offset_kind.clone(),
            outcome,
            payload_hash: record.payload_hash.clone(),
            archive_ref,
            scenario_run_id: record.scenario_run_id.clone(),
        });
        Ok(true)
    }

    /// Loops `run_once` until `stop` says so, sleeping after idle cycles.
    pub fn run_until(&mut self, mut stop: impl FnMut(&CycleOutcome) -> bool) -> Result<u64> {
        let mut cycles = 0u64;
        loop {
            let outcome = self.run_once()?;
            cycles += 1;
            if stop(&outcome) {
                return Ok(cycles);
            }
            if outcome.processed == 0 {
                thread::sleep(self.settings.idle_sleep);
            }
        }
    }

    pub fn run_forever(&mut self) -> Result<()> {
        self.run_until(|_| false).map(|_| ())
    }

    fn advance(&mut self, raw: &RawBusRecord) -> Result<()> {
        match OriginOffset::new(raw.topic.as_str(), raw.partition, raw.offset.as_str(), raw.offset_kind.clone()) {
            Ok(origin) => Ok(self.ledger.advance(&origin)?),
            Err(violation) => {
                tracing::warn!(
                    topic = %raw.topic,
                    partition = raw.partition,
                    reason = %violation,
                    "record has no resumable offset; checkpoint unchanged"
                );
                Ok(())
            }
        }
    }

    /// Writes metrics, health and reconciliation for the active run. Export
    /// failures are logged; they never fail the cycle.
    fn export(&mut self) -> Option<String> {
        let run = self.active_platform_run_id()?.to_string();
        let generated_at_utc = now_utc();
        let scope = ArtifactScope {
            stream_id: self.ledger.stream_id(),
            platform_run_id: &run,
            generated_at_utc: &generated_at_utc,
        };
        let artifacts = [
            (metrics_path(&run), metrics_document(scope, &self.metrics)),
            (health_path(&run), health_document(scope, &self.metrics)),
            (reconciliation_path(&run), self.reconciliation.document(scope)),
        ];
        let mut all_written = true;
        for (path, document) in &artifacts {
            if let Err(err) = self.store.write_json(path, document) {
                all_written = false;
                tracing::error!(artifact = %path, error = %err, "failed to export run artifact");
            }
        }
        self.exported_once = all_written;
        Some(run)
    }
}

fn canonicalize(raw: &RawBusRecord) -> Result<ArchiveEventRecord, crate::error::ContractViolation> {
    ArchiveEventRecord::from_bus_record(
        unwrap_bus_payload(raw.payload.clone()),
        &raw.topic,
        raw.partition,
        &raw.offset,
        raw.offset_kind.clone(),
    )
}
