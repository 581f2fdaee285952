use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::config::{ArchiveWriterConfig, load_config};
use crate::archive::ledger::ArchiveWriterLedger;
use crate::archive::observability::{ArchiveWriterRunMetrics, HealthState, metrics_path};
use crate::archive::store::{LocalObjectStore, ObjectStore};
use crate::commands::CommandReport;

/// Mismatch evidence rows listed by `status`, newest first.
const MISMATCH_ROWS_SHOWN: u32 = 20;

#[derive(Debug, Clone, Default)]
pub struct StatusOptions {
    pub profile: Option<PathBuf>,
    /// Run whose exported metrics to read; defaults to the configured run scope.
    pub platform_run_id: Option<String>,
}

pub fn run(opts: &StatusOptions) -> Result<CommandReport> {
    let cfg = load_config(opts.profile.as_deref())?;
    report_for(&cfg, opts.platform_run_id.as_deref())
}

pub fn report_for(cfg: &ArchiveWriterConfig, platform_run_id: Option<&str>) -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    report.detail(format!("build={}", env!("BUILD_UUID")));

    let stream_id = cfg.effective_stream_id();
    let ledger = ArchiveWriterLedger::open(&cfg.ledger.locator, stream_id.as_str())
        .with_context(|| format!("failed to open ledger for stream {stream_id}"))?;
    let kind = ledger.backend_kind();
    report.detail(format!("stream_id={stream_id}"));
    report.detail(format!("ledger.backend={}", kind.label()));
    report.detail(format!("ledger.locator={}", kind.redacted()));

    let stats = ledger.stats()?;
    report.detail(format!("ledger.offsets={}", stats.offsets));
    report.detail(format!(
        "ledger.mismatch_observations={}",
        stats.mismatch_observations
    ));
    report.detail(format!("ledger.mismatch_rows={}", stats.mismatch_rows));
    report.detail(format!("ledger.checkpoints={}", stats.checkpoints));
    for checkpoint in ledger.checkpoints()? {
        report.detail(format!(
            "checkpoint topic={} partition={} next_offset={} offset_kind={}",
            checkpoint.topic, checkpoint.partition, checkpoint.next_offset, checkpoint.offset_kind
        ));
    }
    for mismatch in ledger.recent_mismatches(MISMATCH_ROWS_SHOWN)? {
        report.detail(format!(
            "mismatch topic={} partition={} offset_kind={} offset={} seq={} observed_at={} stored_hash={} observed_hash={} archive_ref={}",
            mismatch.topic,
            mismatch.partition,
            mismatch.offset_kind,
            mismatch.offset,
            mismatch.observation_seq,
            mismatch.observed_at_utc,
            mismatch.stored_payload_hash,
            mismatch.observed_payload_hash,
            mismatch.stored_archive_ref,
        ));
    }

    let run = platform_run_id.or(cfg.required_platform_run_id.as_deref());
    let Some(run) = run else {
        report.detail("metrics: no platform run selected");
        return Ok(report);
    };
    if cfg.object_store.root.trim().starts_with("s3://") {
        report.detail("metrics: remote object store; not read by status");
        return Ok(report);
    }

    let store = LocalObjectStore::new(cfg.object_store.root.trim())?;
    let path = PathBuf::from(store.ref_for(&metrics_path(run)));
    match read_counters(&path)? {
        None => report.detail(format!("metrics: none exported at {}", path.display())),
        Some(metrics) => {
            for (name, value) in metrics.snapshot() {
                report.detail(format!("counters.{name}={value}"));
            }
            let verdict = metrics.health();
            match verdict.state {
                HealthState::Green => report.detail("health=GREEN"),
                HealthState::Red => {
                    let reasons: Vec<&str> = verdict.reasons.iter().map(|r| r.as_str()).collect();
                    report.issue(format!("health=RED reasons={}", reasons.join(",")));
                }
            }
        }
    }

    Ok(report)
}

fn read_counters(path: &Path) -> Result<Option<ArchiveWriterRunMetrics>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let doc: Value =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
    let counters = doc
        .get("counters")
        .and_then(Value::as_object)
        .with_context(|| format!("{} has no counters object", path.display()))?;
    let metrics = ArchiveWriterRunMetrics::from_counters(counters)
        .with_context(|| format!("unexpected counter in {}", path.display()))?;
    Ok(Some(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::contracts::{OffsetKind, OriginOffset};
    use tempfile::tempdir;

    #[test]
    fn counters_are_read_back_from_exported_metrics() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("last_metrics.json");
        assert!(read_counters(&path).expect("missing is fine").is_none());

        fs::write(
            &path,
            r#"{"counters":{"seen_total":4,"archived_total":3,"payload_mismatch_total":1}}"#,
        )
        .expect("write");
        let metrics = read_counters(&path).expect("read").expect("present");
        assert_eq!(metrics.health().state, HealthState::Red);

        fs::write(&path, r#"{"counters":{"lost_total":1}}"#).expect("write");
        assert!(read_counters(&path).is_err());
    }

    #[test]
    fn lists_mismatch_evidence_from_the_ledger() {
        let tmp = tempdir().expect("tempdir");
        let mut cfg = ArchiveWriterConfig::default();
        cfg.stream_id = "aw_status".to_string();
        cfg.ledger.locator = tmp.path().join("ledger.sqlite").display().to_string();
        cfg.object_store.root = tmp.path().join("archive").display().to_string();

        let ledger = ArchiveWriterLedger::open(&cfg.ledger.locator, "aw_status").expect("ledger");
        let at = OriginOffset::new("t", 1, "12", OffsetKind::KafkaOffset).expect("origin");
        ledger.observe(&at, "h1", "ref-a", "2026-01-01T00:00:00.000000Z").expect("new");
        ledger.observe(&at, "h2", "ref-b", "2026-01-01T00:00:01.000000Z").expect("drift");

        let report = report_for(&cfg, None).expect("report");
        assert!(report.ok);
        assert!(report.details.iter().any(|d| d == "ledger.mismatch_rows=1"));
        assert!(report.details.iter().any(|d| d
            == "mismatch topic=t partition=1 offset_kind=kafka_offset offset=12 seq=2 \
observed_at=2026-01-01T00:00:01.000000Z stored_hash=h1 observed_hash=h2 archive_ref=ref-a"));
    }
}
