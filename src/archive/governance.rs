//! Anomaly announcements for payload drift.
//!
//! Emission is a side channel: it never fails the commit path. Each offset
//! tuple is announced at most once, including across restarts when a log
//! file is configured.

use crate::archive::contracts::{ArchiveEventRecord, OriginOffset};
use crate::archive::ledger::Observation;
use crate::archive::util::now_utc;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const GOVERNANCE_SCHEMA: &str = "archive_writer_governance_event.v1";

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyEvidence {
    pub stored_payload_hash: String,
    pub observed_payload_hash: String,
    pub archive_ref: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernanceEvent {
    pub schema_version: &'static str,
    pub event_family: &'static str,
    pub anomaly_category: &'static str,
    pub dedupe_key: String,
    pub emitted_at_utc: String,
    pub stream_id: String,
    pub platform_run_id: String,
    pub scenario_run_id: String,
    pub origin_offset: OriginOffset,
    pub evidence: AnomalyEvidence,
}

pub struct GovernanceEmitter {
    log_path: Option<PathBuf>,
    emitted: BTreeSet<String>,
}

fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

fn load_emitted_keys(path: &Path) -> Result<BTreeSet<String>> {
    let mut keys = BTreeSet::new();
    if !path.exists() {
        return Ok(keys);
    }
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        if let Some(key) = value.get("dedupe_key").and_then(|k| k.as_str()) {
            keys.insert(key.to_string());
        }
    }
    Ok(keys)
}

impl GovernanceEmitter {
    pub fn new(log_path: Option<PathBuf>) -> Self {
        let emitted = match log_path.as_deref() {
            Some(path) => load_emitted_keys(path).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "governance log unreadable; dedupe starts empty");
                BTreeSet::new()
            }),
            None => BTreeSet::new(),
        };
        Self { log_path, emitted }
    }

    /// Announces a payload mismatch once per offset tuple. Returns whether an
    /// event was emitted.
    pub fn payload_mismatch(
        &mut self,
        stream_id: &str,
        record: &ArchiveEventRecord,
        observation: &Observation,
    ) -> bool {
        let dedupe_key = record.origin_offset.dedupe_key();
        if self.emitted.contains(&dedupe_key) {
            return false;
        }
        let event = GovernanceEvent {
            schema_version: GOVERNANCE_SCHEMA,
            event_family: "ANOMALY",
            anomaly_category: "REPLAY_BASIS_MISMATCH",
            dedupe_key: dedupe_key.clone(),
            emitted_at_utc: now_utc(),
            stream_id: stream_id.to_string(),
            platform_run_id: record.platform_run_id.clone(),
            scenario_run_id: record.scenario_run_id.clone(),
            origin_offset: record.origin_offset.clone(),
            evidence: AnomalyEvidence {
                stored_payload_hash: observation.stored_payload_hash.clone(),
                observed_payload_hash: record.payload_hash.clone(),
                archive_ref: observation.archive_ref.clone(),
            },
        };

        tracing::warn!(
            code = "REPLAY_BASIS_MISMATCH",
            dedupe_key = %sanitize_value(&dedupe_key),
            stored_payload_hash = %event.evidence.stored_payload_hash,
            observed_payload_hash = %event.evidence.observed_payload_hash,
            archive_ref = %sanitize_value(&event.evidence.archive_ref),
            "payload mismatch for archived offset"
        );
        if let Some(path) = &self.log_path {
            if let Err(err) = append_event(path, &event) {
                tracing::error!(path = %path.display(), error = %format!("{err:#}"), "failed to append governance event");
            }
        }
        self.emitted.insert(dedupe_key);
        true
    }
}

fn append_event(path: &Path, event: &GovernanceEvent) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let line = format!("{}\n", serde_json::to_string(event)?);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::contracts::OffsetKind;
    use crate::archive::contracts::tests::sample_envelope;
    use crate::archive::ledger::ObserveOutcome;
    use tempfile::tempdir;

    fn mismatch() -> (ArchiveEventRecord, Observation) {
        let record = ArchiveEventRecord::from_bus_record(sample_envelope("e1"), "t", 0, "4", OffsetKind::FileLine)
            .expect("record");
        let observation = Observation {
            outcome: ObserveOutcome::PayloadMismatch,
            archive_ref: "/archive/run/offset=4.json".to_string(),
            stored_payload_hash: "stored".to_string(),
        };
        (record, observation)
    }

    #[test]
    fn emits_once_per_offset_and_survives_restart() {
        let tmp = tempdir().expect("tempdir");
        let log = tmp.path().join("gov/events.jsonl");
        let (record, observation) = mismatch();

        let mut emitter = GovernanceEmitter::new(Some(log.clone()));
        assert!(emitter.payload_mismatch("s", &record, &observation));
        assert!(!emitter.payload_mismatch("s", &record, &observation));

        let lines = fs::read_to_string(&log).expect("log");
        assert_eq!(lines.lines().count(), 1);
        let event: serde_json::Value = serde_json::from_str(lines.trim()).expect("json");
        assert_eq!(event["dedupe_key"], "t:0:file_line:4");
        assert_eq!(event["evidence"]["stored_payload_hash"], "stored");
        assert_eq!(event["evidence"]["observed_payload_hash"], record.payload_hash.as_str());

        let mut restarted = GovernanceEmitter::new(Some(log));
        assert!(!restarted.payload_mismatch("s", &record, &observation));
    }

    #[test]
    fn works_without_a_log_file() {
        let (record, observation) = mismatch();
        let mut emitter = GovernanceEmitter::new(None);
        assert!(emitter.payload_mismatch("s", &record, &observation));
        assert!(!emitter.payload_mismatch("s", &record, &observation));
    }

    #[test]
    fn sanitize_value_rewrites_whitespace() {
        assert_eq!(sanitize_value("a b\tc"), "a_b_c");
        assert_eq!(sanitize_value("   "), "na");
    }
}
