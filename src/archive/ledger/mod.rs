//! Durable ledger of offset observations, payload mismatches and checkpoints.

pub mod backend;
pub mod postgres;
pub mod schema;
pub mod sqlite;

use crate::archive::contracts::{OffsetKind, OriginOffset};
use crate::archive::util::now_utc;
use crate::error::LedgerError;
use backend::{BackendKind, LedgerBackend, LedgerTransaction, NamedParams, SqlRow};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObserveOutcome {
    New,
    Duplicate,
    PayloadMismatch,
}

/// Classification of one observation. `archive_ref` is the caller's ref for
/// `New` and the stored (first-written) ref otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub outcome: ObserveOutcome,
    pub archive_ref: String,
    pub stored_payload_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub next_offset: String,
    pub offset_kind: OffsetKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffsetRow {
    pub payload_hash: String,
    pub archive_ref: String,
    pub first_seen_utc: String,
    pub last_seen_utc: String,
    pub seen_count: i64,
    pub mismatch_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchRow {
    pub topic: String,
    pub partition: u32,
    pub offset_kind: OffsetKind,
    pub offset: String,
    pub observation_seq: i64,
    pub observed_at_utc: String,
    pub stored_payload_hash: String,
    pub stored_archive_ref: String,
    pub observed_payload_hash: String,
    pub observed_archive_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointRow {
    pub topic: String,
    pub partition: u32,
    pub next_offset: String,
    pub offset_kind: OffsetKind,
    pub updated_at_utc: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub offsets: i64,
    pub mismatch_observations: i64,
    pub mismatch_rows: i64,
    pub checkpoints: i64,
}

pub struct ArchiveWriterLedger {
    backend: Box<dyn LedgerBackend>,
    stream_id: String,
}

impl ArchiveWriterLedger {
    /// Wraps an already-built backend and applies the schema.
    pub fn new(
        backend: Box<dyn LedgerBackend>,
        stream_id: impl Into<String>,
    ) -> Result<Self, LedgerError> {
        let stream_id = stream_id.into();
        if stream_id.trim().is_empty() {
            return Err(LedgerError::Statement("stream_id cannot be empty".to_string()));
        }
        backend.ensure_schema(&schema::ALL_TABLES)?;
        Ok(Self { backend, stream_id })
    }

    pub fn open(locator: &str, stream_id: impl Into<String>) -> Result<Self, LedgerError> {
        Self::new(backend::open_backend(locator)?, stream_id)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Classifies one observation of an offset tuple in a single transaction.
    /// The stored hash and ref are never overwritten.
    pub fn observe(
        &self,
        origin: &OriginOffset,
        payload_hash: &str,
        archive_ref: &str,
        observed_at_utc: &str,
    ) -> Result<Observation, LedgerError> {
        self.in_transaction(|tx| {
            let mut insert = self.key_params(origin);
            insert.push(("payload_hash", payload_hash.into()));
            insert.push(("archive_ref", archive_ref.into()));
            insert.push(("observed_at_utc", observed_at_utc.into()));
            if tx.execute(schema::INSERT_OFFSET_IF_ABSENT, &insert)? == 1 {
                return Ok(Observation {
                    outcome: ObserveOutcome::New,
                    archive_ref: archive_ref.to_string(),
                    stored_payload_hash: payload_hash.to_string(),
                });
            }

            let mut duplicate = self.key_params(origin);
            duplicate.push(("payload_hash", payload_hash.into()));
            duplicate.push(("observed_at_utc", observed_at_utc.into()));
            let bumped = tx.execute(&schema::bump_duplicate(), &duplicate)?;
            let stored = self.select_offset(tx, origin)?.ok_or_else(|| {
                LedgerError::Statement(format!(
                    "offset row for {} disappeared during observe",
                    origin.dedupe_key()
                ))
            })?;
            if bumped == 1 {
                return Ok(Observation {
                    outcome: ObserveOutcome::Duplicate,
                    archive_ref: stored.archive_ref,
                    stored_payload_hash: stored.payload_hash,
                });
            }

            let mut mismatch = self.key_params(origin);
            mismatch.push(("observed_at_utc", observed_at_utc.into()));
            tx.execute(&schema::bump_mismatch(), &mismatch)?;
            mismatch.push(("observation_seq", stored.seen_count.saturating_add(1).into()));
            mismatch.push(("stored_payload_hash", stored.payload_hash.as_str().into()));
            mismatch.push(("stored_archive_ref", stored.archive_ref.as_str().into()));
            mismatch.push(("observed_payload_hash", payload_hash.into()));
            mismatch.push(("observed_archive_ref", archive_ref.into()));
            tx.execute(schema::INSERT_MISMATCH, &mismatch)?;
            Ok(Observation {
                outcome: ObserveOutcome::PayloadMismatch,
                archive_ref: stored.archive_ref,
                stored_payload_hash: stored.payload_hash,
            })
        })
    }

    pub fn next_offset(&self, topic: &str, partition: u32) -> Result<Option<Checkpoint>, LedgerError> {
        let params = self.checkpoint_key(topic, partition);
        let row = self.in_transaction(|tx| tx.query_opt(schema::SELECT_CHECKPOINT, &params))?;
        row.map(|row| {
            Ok(Checkpoint {
                next_offset: row.text(0)?,
                offset_kind: OffsetKind::parse(&row.text(1)?),
            })
        })
        .transpose()
    }

    /// Moves the checkpoint past `origin`. Linear cursors store `offset + 1`
    /// and never move backwards; opaque tokens are stored as given.
    pub fn advance(&self, origin: &OriginOffset) -> Result<(), LedgerError> {
        let (next_offset, sql) = if origin.offset_kind.is_linear_cursor() {
            // BIGINT bounds the cursor on both backends.
            let next = origin
                .offset
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|current| *current >= 0)
                .and_then(|current| current.checked_add(1))
                .ok_or_else(|| LedgerError::InvalidCursor {
                    offset: origin.offset.clone(),
                    offset_kind: origin.offset_kind.to_string(),
                })?;
            (next.to_string(), schema::UPSERT_LINEAR_CHECKPOINT)
        } else {
            (origin.offset.clone(), schema::UPSERT_CHECKPOINT)
        };
        let mut params = self.checkpoint_key(&origin.topic, origin.partition);
        params.push(("next_offset", next_offset.into()));
        params.push(("offset_kind", origin.offset_kind.as_str().into()));
        params.push(("updated_at_utc", now_utc().into()));
        self.in_transaction(|tx| tx.execute(sql, &params).map(|_| ()))
    }

    /// Undoes a `New` observation whose artifact write failed. Returns whether
    /// a row was removed; any later observation makes this a no-op.
    pub fn clear_observation(&self, origin: &OriginOffset, payload_hash: &str) -> Result<bool, LedgerError> {
        let mut params = self.key_params(origin);
        params.push(("payload_hash", payload_hash.into()));
        let deleted = self.in_transaction(|tx| tx.execute(&schema::delete_unobserved(), &params))?;
        Ok(deleted == 1)
    }

    #[cfg(test)]
    pub fn offset_row(&self, origin: &OriginOffset) -> Result<Option<OffsetRow>, LedgerError> {
        self.in_transaction(|tx| self.select_offset(tx, origin))
    }

    /// The stream's latest mismatch evidence rows, newest first.
    pub fn recent_mismatches(&self, limit: u32) -> Result<Vec<MismatchRow>, LedgerError> {
        let mut params = self.stream_param();
        params.push(("limit", limit.into()));
        let rows = self.in_transaction(|tx| tx.query(schema::SELECT_RECENT_MISMATCHES, &params))?;
        rows.iter()
            .map(|row| {
                Ok(MismatchRow {
                    topic: row.text(0)?,
                    partition: partition_from(row, 1)?,
                    offset_kind: OffsetKind::parse(&row.text(2)?),
                    offset: row.text(3)?,
                    observation_seq: row.int(4)?,
                    observed_at_utc: row.text(5)?,
                    stored_payload_hash: row.text(6)?,
                    stored_archive_ref: row.text(7)?,
                    observed_payload_hash: row.text(8)?,
                    observed_archive_ref: row.text(9)?,
                })
            })
            .collect()
    }

    pub fn checkpoints(&self) -> Result<Vec<CheckpointRow>, LedgerError> {
        let params = self.stream_param();
        let rows = self.in_transaction(|tx| tx.query(schema::SELECT_CHECKPOINTS, &params))?;
        rows.iter()
            .map(|row| {
                Ok(CheckpointRow {
                    topic: row.text(0)?,
                    partition: partition_from(row, 1)?,
                    next_offset: row.text(2)?,
                    offset_kind: OffsetKind::parse(&row.text(3)?),
                    updated_at_utc: row.text(4)?,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let params = self.stream_param();
        self.in_transaction(|tx| {
            let mut stats = LedgerStats::default();
            if let Some(row) = tx.query_opt(schema::COUNT_OFFSETS, &params)? {
                stats.offsets = row.int(0)?;
                stats.mismatch_observations = row.int(1)?;
            }
            if let Some(row) = tx.query_opt(schema::COUNT_MISMATCHES, &params)? {
                stats.mismatch_rows = row.int(0)?;
            }
            if let Some(row) = tx.query_opt(schema::COUNT_CHECKPOINTS, &params)? {
                stats.checkpoints = row.int(0)?;
            }
            Ok(stats)
        })
    }

    fn in_transaction<T>(
        &self,
        mut op: impl FnMut(&mut dyn LedgerTransaction) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut out = None;
        self.backend.transaction(&mut |tx: &mut dyn LedgerTransaction| {
            out = Some(op(tx)?);
            Ok(())
        })?;
        out.ok_or_else(|| LedgerError::Statement("transaction produced no result".to_string()))
    }

    fn select_offset(
        &self,
        tx: &mut dyn LedgerTransaction,
        origin: &OriginOffset,
    ) -> Result<Option<OffsetRow>, LedgerError> {
        let row = tx.query_opt(&schema::select_offset(), &self.key_params(origin))?;
        row.map(|row| {
            Ok(OffsetRow {
                payload_hash: row.text(0)?,
                archive_ref: row.text(1)?,
                first_seen_utc: row.text(2)?,
                last_seen_utc: row.text(3)?,
                seen_count: row.int(4)?,
                mismatch_count: row.int(5)?,
            })
        })
        .transpose()
    }

    fn stream_param(&self) -> NamedParams {
        vec![("stream_id", self.stream_id.as_str().into())]
    }

    fn checkpoint_key(&self, topic: &str, partition: u32) -> NamedParams {
        vec![
            ("stream_id", self.stream_id.as_str().into()),
            ("topic", topic.into()),
            ("partition_id", partition.into()),
        ]
    }

    fn key_params(&self, origin: &OriginOffset) -> NamedParams {
        vec![
            ("stream_id", self.stream_id.as_str().into()),
            ("topic", origin.topic.as_str().into()),
            ("partition_id", origin.partition.into()),
            ("offset_kind", origin.offset_kind.as_str().into()),
            ("offset_value", origin.offset.as_str().into()),
        ]
    }
}

fn partition_from(row: &SqlRow, idx: usize) -> Result<u32, LedgerError> {
    let raw = row.int(idx)?;
    u32::try_from(raw).map_err(|_| LedgerError::Decode(format!("partition out of range: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn ledger(stream: &str) -> (TempDir, ArchiveWriterLedger) {
        let tmp = tempdir().expect("tempdir");
        let locator = format!("sqlite://{}", tmp.path().join("ledger.sqlite").display());
        let ledger = ArchiveWriterLedger::open(&locator, stream).expect("open ledger");
        (tmp, ledger)
    }

    fn origin(offset: &str, kind: OffsetKind) -> OriginOffset {
        OriginOffset::new("fp.bus.traffic.v1", 0, offset, kind).expect("origin")
    }

    #[test]
    fn repeated_observation_is_new_then_duplicate_with_stored_ref() {
        let (_tmp, ledger) = ledger("s1");
        let at = origin("5", OffsetKind::FileLine);

        let first = ledger.observe(&at, "h1", "ref-a", "2026-01-01T00:00:00.000000Z").expect("first");
        assert_eq!(first.outcome, ObserveOutcome::New);
        assert_eq!(first.archive_ref, "ref-a");

        let second = ledger.observe(&at, "h1", "ref-b", "2026-01-01T00:00:01.000000Z").expect("second");
        assert_eq!(second.outcome, ObserveOutcome::Duplicate);
        assert_eq!(second.archive_ref, "ref-a");

        let row = ledger.offset_row(&at).expect("row").expect("present");
        assert_eq!(row.seen_count, 2);
        assert_eq!(row.mismatch_count, 0);
        assert_eq!(row.first_seen_utc, "2026-01-01T00:00:00.000000Z");
        assert_eq!(row.last_seen_utc, "2026-01-01T00:00:01.000000Z");
    }

    #[test]
    fn divergent_hash_is_recorded_without_overwriting() {
        let (_tmp, ledger) = ledger("s1");
        let at = origin("9", OffsetKind::KafkaOffset);
        ledger.observe(&at, "h1", "ref-a", "2026-01-01T00:00:00.000000Z").expect("new");

        let drift = ledger.observe(&at, "h2", "ref-b", "2026-01-01T00:00:02.000000Z").expect("drift");
        assert_eq!(drift.outcome, ObserveOutcome::PayloadMismatch);
        assert_eq!(drift.archive_ref, "ref-a");
        assert_eq!(drift.stored_payload_hash, "h1");

        let row = ledger.offset_row(&at).expect("row").expect("present");
        assert_eq!(row.payload_hash, "h1");
        assert_eq!(row.archive_ref, "ref-a");
        assert_eq!(row.seen_count, 2);
        assert_eq!(row.mismatch_count, 1);

        let mismatches = ledger.recent_mismatches(10).expect("mismatches");
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].offset, "9");
        assert_eq!(mismatches[0].offset_kind, OffsetKind::KafkaOffset);
        assert_eq!(mismatches[0].observation_seq, 2);
        assert_eq!(mismatches[0].stored_payload_hash, "h1");
        assert_eq!(mismatches[0].observed_payload_hash, "h2");
        assert_eq!(mismatches[0].observed_archive_ref, "ref-b");
    }

    #[test]
    fn mismatches_sharing_a_timestamp_are_all_kept() {
        let (_tmp, ledger) = ledger("s1");
        let at = origin("4", OffsetKind::FileLine);
        let same_instant = "2026-01-01T00:00:05.000000Z";
        ledger.observe(&at, "h1", "ref-a", "2026-01-01T00:00:00.000000Z").expect("new");
        ledger.observe(&at, "h2", "ref-b", same_instant).expect("first drift");
        ledger.observe(&at, "h3", "ref-c", same_instant).expect("second drift");

        let row = ledger.offset_row(&at).expect("row").expect("present");
        assert_eq!(row.mismatch_count, 2);
        let stats = ledger.stats().expect("stats");
        assert_eq!(stats.mismatch_observations, 2);
        assert_eq!(stats.mismatch_rows, 2);

        let rows = ledger.recent_mismatches(10).expect("mismatches");
        let observed: Vec<(i64, &str)> = rows
            .iter()
            .map(|r| (r.observation_seq, r.observed_payload_hash.as_str()))
            .collect();
        assert_eq!(observed, vec![(3, "h3"), (2, "h2")]);
        assert_eq!(ledger.recent_mismatches(1).expect("limited").len(), 1);
    }

    #[test]
    fn clear_observation_only_undoes_untouched_rows() {
        let (_tmp, ledger) = ledger("s1");
        let fresh = origin("1", OffsetKind::FileLine);
        ledger.observe(&fresh, "h1", "ref", "2026-01-01T00:00:00.000000Z").expect("new");
        assert!(!ledger.clear_observation(&fresh, "other-hash").expect("wrong hash"));
        assert!(ledger.clear_observation(&fresh, "h1").expect("clear"));
        assert!(ledger.offset_row(&fresh).expect("row").is_none());

        let seen_twice = origin("2", OffsetKind::FileLine);
        ledger.observe(&seen_twice, "h1", "ref", "2026-01-01T00:00:00.000000Z").expect("new");
        ledger.observe(&seen_twice, "h1", "ref", "2026-01-01T00:00:01.000000Z").expect("dup");
        assert!(!ledger.clear_observation(&seen_twice, "h1").expect("noop"));
        assert!(ledger.offset_row(&seen_twice).expect("row").is_some());

        let drifted = origin("3", OffsetKind::FileLine);
        ledger.observe(&drifted, "h1", "ref", "2026-01-01T00:00:00.000000Z").expect("new");
        ledger.observe(&drifted, "h2", "ref2", "2026-01-01T00:00:01.000000Z").expect("mismatch");
        assert!(!ledger.clear_observation(&drifted, "h1").expect("noop"));
    }

    #[test]
    fn linear_cursors_resume_after_the_offset() {
        let (_tmp, ledger) = ledger("s1");
        assert!(ledger.next_offset("fp.bus.traffic.v1", 0).expect("read").is_none());

        ledger.advance(&origin("41", OffsetKind::FileLine)).expect("advance");
        let checkpoint = ledger.next_offset("fp.bus.traffic.v1", 0).expect("read").expect("present");
        assert_eq!(checkpoint.next_offset, "42");
        assert_eq!(checkpoint.offset_kind, OffsetKind::FileLine);
    }

    #[test]
    fn opaque_tokens_are_stored_verbatim() {
        let (_tmp, ledger) = ledger("s1");
        let token = "49590338271490256608559692538361571095921575989136588898";
        ledger.advance(&origin(token, OffsetKind::KinesisSequence)).expect("advance");
        let checkpoint = ledger.next_offset("fp.bus.traffic.v1", 0).expect("read").expect("present");
        assert_eq!(checkpoint.next_offset, token);
        assert_eq!(checkpoint.offset_kind, OffsetKind::KinesisSequence);
    }

    #[test]
    fn linear_checkpoint_never_moves_backwards() {
        let (_tmp, ledger) = ledger("s1");
        ledger.advance(&origin("10", OffsetKind::KafkaOffset)).expect("advance");
        ledger.advance(&origin("3", OffsetKind::KafkaOffset)).expect("stale advance");
        let checkpoint = ledger.next_offset("fp.bus.traffic.v1", 0).expect("read").expect("present");
        assert_eq!(checkpoint.next_offset, "11");

        let err = ledger.advance(&origin("abc", OffsetKind::FileLine)).expect_err("not numeric");
        assert!(matches!(err, LedgerError::InvalidCursor { .. }));
    }

    #[test]
    fn streams_are_isolated_in_one_database() {
        let tmp = tempdir().expect("tempdir");
        let locator = tmp.path().join("shared.sqlite").display().to_string();
        let a = ArchiveWriterLedger::open(&locator, "stream-a").expect("a");
        let b = ArchiveWriterLedger::open(&locator, "stream-b").expect("b");
        let at = origin("0", OffsetKind::FileLine);

        assert_eq!(a.observe(&at, "h", "ref-a", "t0").expect("a").outcome, ObserveOutcome::New);
        assert_eq!(b.observe(&at, "h", "ref-b", "t0").expect("b").outcome, ObserveOutcome::New);
        a.advance(&at).expect("advance a");
        assert!(b.next_offset("fp.bus.traffic.v1", 0).expect("read").is_none());

        let stats = a.stats().expect("stats");
        assert_eq!(stats.offsets, 1);
        assert_eq!(stats.checkpoints, 1);
        assert_eq!(b.stats().expect("stats").checkpoints, 0);
    }

    #[test]
    fn checkpoints_list_every_partition_in_order() {
        let (_tmp, ledger) = ledger("s1");
        ledger
            .advance(&OriginOffset::new("t", 2, "7", OffsetKind::FileLine).expect("origin"))
            .expect("p2");
        ledger
            .advance(&OriginOffset::new("t", 0, "1", OffsetKind::FileLine).expect("origin"))
            .expect("p0");
        let rows = ledger.checkpoints().expect("rows");
        let summary: Vec<(u32, &str)> = rows.iter().map(|r| (r.partition, r.next_offset.as_str())).collect();
        assert_eq!(summary, vec![(0, "2"), (2, "8")]);
    }

    #[test]
    fn blank_stream_id_is_rejected() {
        let tmp = tempdir().expect("tempdir");
        let locator = tmp.path().join("l.sqlite").display().to_string();
        assert!(ArchiveWriterLedger::open(&locator, "  ").is_err());
    }
}
