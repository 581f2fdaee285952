use crate::archive::contracts::{OffsetKind, sanitize_token};
use crate::archive::ledger::ObserveOutcome;
use crate::archive::observability::ArtifactScope;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::VecDeque;

pub const RECONCILIATION_SCHEMA: &str = "archive_writer_reconciliation.v1";

/// Evidence refs and recent rows kept for export.
pub const EVIDENCE_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationRow {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
    pub offset_kind: OffsetKind,
    pub outcome: ObserveOutcome,
    pub payload_hash: String,
    pub archive_ref: String,
    pub scenario_run_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationSummary {
    pub seen_total: u64,
    pub archived_total: u64,
    pub duplicate_total: u64,
    pub payload_mismatch_total: u64,
    pub evidence_refs: Vec<String>,
}

/// Outcome totals for the worker's lifetime plus a bounded window of the
/// most recent rows.
#[derive(Debug, Clone, Default)]
pub struct ArchiveWriterReconciliation {
    seen_total: u64,
    archived_total: u64,
    duplicate_total: u64,
    payload_mismatch_total: u64,
    recent: VecDeque<ReconciliationRow>,
}

impl ArchiveWriterReconciliation {
    pub fn add(&mut self, row: ReconciliationRow) {
        self.seen_total += 1;
        match row.outcome {
            ObserveOutcome::New => self.archived_total += 1,
            ObserveOutcome::Duplicate => self.duplicate_total += 1,
            ObserveOutcome::PayloadMismatch => self.payload_mismatch_total += 1,
        }
        if self.recent.len() == EVIDENCE_LIMIT {
            self.recent.pop_front();
        }
        self.recent.push_back(row);
    }

    pub fn summary(&self) -> ReconciliationSummary {
        ReconciliationSummary {
            seen_total: self.seen_total,
            archived_total: self.archived_total,
            duplicate_total: self.duplicate_total,
            payload_mismatch_total: self.payload_mismatch_total,
            evidence_refs: self.recent.iter().map(|row| row.archive_ref.clone()).collect(),
        }
    }

    pub fn document(&self, scope: ArtifactScope<'_>) -> Value {
        json!({
            "schema_version": RECONCILIATION_SCHEMA,
            "stream_id": scope.stream_id,
            "platform_run_id": scope.platform_run_id,
            "generated_at_utc": scope.generated_at_utc,
            "summary": self.summary(),
            "recent_rows": self.recent,
        })
    }
}

pub fn reconciliation_path(platform_run_id: &str) -> String {
    format!(
        "{}/archive/reconciliation/archive_writer_reconciliation.json",
        sanitize_token(platform_run_id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(offset: u32, outcome: ObserveOutcome) -> ReconciliationRow {
        ReconciliationRow {
            topic: "t".to_string(),
            partition: 0,
            offset: offset.to_string(),
            offset_kind: OffsetKind::FileLine,
            outcome,
            payload_hash: "h".to_string(),
            archive_ref: format!("ref-{offset}"),
            scenario_run_id: "sr".to_string(),
        }
    }

    #[test]
    fn summary_counts_by_outcome() {
        let mut rec = ArchiveWriterReconciliation::default();
        rec.add(row(0, ObserveOutcome::New));
        rec.add(row(1, ObserveOutcome::New));
        rec.add(row(1, ObserveOutcome::Duplicate));
        rec.add(row(1, ObserveOutcome::PayloadMismatch));

        let summary = rec.summary();
        assert_eq!(summary.seen_total, 4);
        assert_eq!(summary.archived_total, 2);
        assert_eq!(summary.duplicate_total, 1);
        assert_eq!(summary.payload_mismatch_total, 1);
        assert_eq!(summary.evidence_refs, vec!["ref-0", "ref-1", "ref-1", "ref-1"]);
    }

    #[test]
    fn evidence_keeps_only_the_most_recent_refs() {
        let mut rec = ArchiveWriterReconciliation::default();
        for offset in 0..(EVIDENCE_LIMIT as u32 + 50) {
            rec.add(row(offset, ObserveOutcome::New));
        }
        let summary = rec.summary();
        assert_eq!(summary.archived_total, EVIDENCE_LIMIT as u64 + 50);
        assert_eq!(summary.evidence_refs.len(), EVIDENCE_LIMIT);
        assert_eq!(summary.evidence_refs[0], "ref-50");
    }

    #[test]
    fn document_is_versioned_and_scoped() {
        let mut rec = ArchiveWriterReconciliation::default();
        rec.add(row(3, ObserveOutcome::New));
        let doc = rec.document(ArtifactScope {
            stream_id: "s",
            platform_run_id: "run",
            generated_at_utc: "t",
        });
        assert_eq!(doc["schema_version"], RECONCILIATION_SCHEMA);
        assert_eq!(doc["summary"]["archived_total"], 1);
        assert_eq!(doc["recent_rows"][0]["outcome"], "NEW");
        assert_eq!(doc["recent_rows"][0]["offset_kind"], "file_line");
        assert_eq!(
            reconciliation_path("run"),
            "run/archive/reconciliation/archive_writer_reconciliation.json"
        );
    }
}
