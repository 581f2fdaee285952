//! Run counters, the derived health verdict and their exported documents.

use crate::archive::contracts::sanitize_token;
use crate::error::UnknownCounter;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::str::FromStr;

pub const METRICS_SCHEMA: &str = "archive_writer_metrics.v1";
pub const HEALTH_SCHEMA: &str = "archive_writer_health.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Counter {
    SeenTotal,
    ArchivedTotal,
    DuplicateTotal,
    PayloadMismatchTotal,
    WriteErrorTotal,
}

impl Counter {
    pub const ALL: [Counter; 5] = [
        Counter::SeenTotal,
        Counter::ArchivedTotal,
        Counter::DuplicateTotal,
        Counter::PayloadMismatchTotal,
        Counter::WriteErrorTotal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SeenTotal => "seen_total",
            Self::ArchivedTotal => "archived_total",
            Self::DuplicateTotal => "duplicate_total",
            Self::PayloadMismatchTotal => "payload_mismatch_total",
            Self::WriteErrorTotal => "write_error_total",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl FromStr for Counter {
    type Err = UnknownCounter;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|counter| counter.as_str() == raw)
            .ok_or_else(|| UnknownCounter(raw.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveWriterRunMetrics {
    counts: [u64; Counter::ALL.len()],
}

impl ArchiveWriterRunMetrics {
    pub fn bump(&mut self, counter: Counter) {
        self.counts[counter.index()] += 1;
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter.index()]
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Counter::ALL
            .into_iter()
            .map(|counter| (counter.as_str(), self.get(counter)))
            .collect()
    }

    /// Reads the `counters` object of an exported metrics document.
    pub fn from_counters(counters: &Map<String, Value>) -> Result<Self, UnknownCounter> {
        let mut metrics = Self::default();
        for (name, value) in counters {
            let counter = name.parse::<Counter>()?;
            metrics.counts[counter.index()] = value.as_u64().unwrap_or(0);
        }
        Ok(metrics)
    }

    pub fn health(&self) -> HealthVerdict {
        let mut reasons = Vec::new();
        if self.get(Counter::PayloadMismatchTotal) > 0 {
            reasons.push(HealthReason::ReplayBasisMismatchNonzero);
        }
        if self.get(Counter::WriteErrorTotal) > 0 {
            reasons.push(HealthReason::ArchiveWriteErrorNonzero);
        }
        let state = if reasons.is_empty() {
            HealthState::Green
        } else {
            HealthState::Red
        };
        HealthVerdict { state, reasons }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthReason {
    ReplayBasisMismatchNonzero,
    ArchiveWriteErrorNonzero,
}

impl HealthReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReplayBasisMismatchNonzero => "REPLAY_BASIS_MISMATCH_NONZERO",
            Self::ArchiveWriteErrorNonzero => "ARCHIVE_WRITE_ERROR_NONZERO",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthVerdict {
    pub state: HealthState,
    pub reasons: Vec<HealthReason>,
}

/// Identity shared by every exported run artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactScope<'a> {
    pub stream_id: &'a str,
    pub platform_run_id: &'a str,
    pub generated_at_utc: &'a str,
}

pub fn metrics_path(platform_run_id: &str) -> String {
    format!(
        "{}/archive_writer/metrics/last_metrics.json",
        sanitize_token(platform_run_id)
    )
}

pub fn health_path(platform_run_id: &str) -> String {
    format!(
        "{}/archive_writer/health/last_health.json",
        sanitize_token(platform_run_id)
    )
}

pub fn metrics_document(scope: ArtifactScope<'_>, metrics: &ArchiveWriterRunMetrics) -> Value {
    json!({
        "schema_version": METRICS_SCHEMA,
        "stream_id": scope.stream_id,
        "platform_run_id": scope.platform_run_id,
        "generated_at_utc": scope.generated_at_utc,
        "counters": metrics.snapshot(),
    })
}

pub fn health_document(scope: ArtifactScope<'_>, metrics: &ArchiveWriterRunMetrics) -> Value {
    let verdict = metrics.health();
    json!({
        "schema_version": HEALTH_SCHEMA,
        "stream_id": scope.stream_id,
        "platform_run_id": scope.platform_run_id,
        "generated_at_utc": scope.generated_at_utc,
        "health_state": verdict.state,
        "health_reasons": verdict.reasons,
        "counters": metrics.snapshot(),
    })
}
