//! Backend-neutral DDL and statements for the ledger tables.
//!
//! Every statement runs unchanged on SQLite and Postgres. Placeholders are
//! named (`:stream_id`); column names avoid the `offset`/`partition` keywords.

pub const CREATE_OFFSETS: &str = "
CREATE TABLE IF NOT EXISTS archive_writer_offsets (
    stream_id TEXT NOT NULL,
    topic TEXT NOT NULL,
    partition_id BIGINT NOT NULL,
    offset_kind TEXT NOT NULL,
    offset_value TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    archive_ref TEXT NOT NULL,
    first_seen_utc TEXT NOT NULL,
    last_seen_utc TEXT NOT NULL,
    seen_count BIGINT NOT NULL,
    mismatch_count BIGINT NOT NULL,
    PRIMARY KEY (stream_id, topic, partition_id, offset_kind, offset_value)
)";

pub const CREATE_MISMATCHES: &str = "
CREATE TABLE IF NOT EXISTS archive_writer_mismatches (
    stream_id TEXT NOT NULL,
    topic TEXT NOT NULL,
    partition_id BIGINT NOT NULL,
    offset_kind TEXT NOT NULL,
    offset_value TEXT NOT NULL,
    observation_seq BIGINT NOT NULL,
    observed_at_utc TEXT NOT NULL,
    stored_payload_hash TEXT NOT NULL,
    stored_archive_ref TEXT NOT NULL,
    observed_payload_hash TEXT NOT NULL,
    observed_archive_ref TEXT NOT NULL,
    PRIMARY KEY (stream_id, topic, partition_id, offset_kind, offset_value, observation_seq)
)";

pub const CREATE_CHECKPOINTS: &str = "
CREATE TABLE IF NOT EXISTS archive_writer_checkpoints (
    stream_id TEXT NOT NULL,
    topic TEXT NOT NULL,
    partition_id BIGINT NOT NULL,
    next_offset TEXT NOT NULL,
    offset_kind TEXT NOT NULL,
    updated_at_utc TEXT NOT NULL,
    PRIMARY KEY (stream_id, topic, partition_id)
)";

pub const ALL_TABLES: [&str; 3] = [CREATE_OFFSETS, CREATE_MISMATCHES, CREATE_CHECKPOINTS];

const OFFSET_KEY: &str = "stream_id = :stream_id AND topic = :topic AND partition_id = :partition_id \
AND offset_kind = :offset_kind AND offset_value = :offset_value";

pub const INSERT_OFFSET_IF_ABSENT: &str = "
INSERT INTO archive_writer_offsets (
    stream_id, topic, partition_id, offset_kind, offset_value,
    payload_hash, archive_ref, first_seen_utc, last_seen_utc, seen_count, mismatch_count
) VALUES (
    :stream_id, :topic, :partition_id, :offset_kind, :offset_value,
    :payload_hash, :archive_ref, :observed_at_utc, :observed_at_utc, 1, 0
)
ON CONFLICT (stream_id, topic, partition_id, offset_kind, offset_value) DO NOTHING";

pub fn bump_duplicate() -> String {
    format!(
        "UPDATE archive_writer_offsets \
SET seen_count = seen_count + 1, last_seen_utc = :observed_at_utc \
WHERE {OFFSET_KEY} AND payload_hash = :payload_hash"
    )
}

pub fn bump_mismatch() -> String {
    format!(
        "UPDATE archive_writer_offsets \
SET seen_count = seen_count + 1, mismatch_count = mismatch_count + 1, last_seen_utc = :observed_at_utc \
WHERE {OFFSET_KEY}"
    )
}

pub fn select_offset() -> String {
    format!(
        "SELECT payload_hash, archive_ref, first_seen_utc, last_seen_utc, seen_count, mismatch_count \
FROM archive_writer_offsets WHERE {OFFSET_KEY}"
    )
}

pub fn delete_unobserved() -> String {
    format!(
        "DELETE FROM archive_writer_offsets \
WHERE {OFFSET_KEY} AND payload_hash = :payload_hash AND seen_count = 1 AND mismatch_count = 0"
    )
}

/// Newest first; `observation_seq` orders rows that share a timestamp.
pub const SELECT_RECENT_MISMATCHES: &str = "
SELECT topic, partition_id, offset_kind, offset_value, observation_seq, observed_at_utc,
       stored_payload_hash, stored_archive_ref, observed_payload_hash, observed_archive_ref
FROM archive_writer_mismatches
WHERE stream_id = :stream_id
ORDER BY observed_at_utc DESC, topic, partition_id, offset_value, observation_seq DESC
LIMIT :limit";

/// `observation_seq` is the offset row's `seen_count` after the bump, so two
/// mismatches observed within the same timestamp still get distinct rows.
pub const INSERT_MISMATCH: &str = "
INSERT INTO archive_writer_mismatches (
    stream_id, topic, partition_id, offset_kind, offset_value, observation_seq, observed_at_utc,
    stored_payload_hash, stored_archive_ref, observed_payload_hash, observed_archive_ref
) VALUES (
    :stream_id, :topic, :partition_id, :offset_kind, :offset_value, :observation_seq, :observed_at_utc,
    :stored_payload_hash, :stored_archive_ref, :observed_payload_hash, :observed_archive_ref
)";

pub const SELECT_CHECKPOINT: &str = "
SELECT next_offset, offset_kind FROM archive_writer_checkpoints
WHERE stream_id = :stream_id AND topic = :topic AND partition_id = :partition_id";

pub const SELECT_CHECKPOINTS: &str = "
SELECT topic, partition_id, next_offset, offset_kind, updated_at_utc FROM archive_writer_checkpoints
WHERE stream_id = :stream_id ORDER BY topic, partition_id";

/// Opaque resume tokens are stored verbatim.
pub const UPSERT_CHECKPOINT: &str = "
INSERT INTO archive_writer_checkpoints (stream_id, topic, partition_id, next_offset, offset_kind, updated_at_utc)
VALUES (:stream_id, :topic, :partition_id, :next_offset, :offset_kind, :updated_at_utc)
ON CONFLICT (stream_id, topic, partition_id) DO UPDATE SET
    next_offset = excluded.next_offset,
    offset_kind = excluded.offset_kind,
    updated_at_utc = excluded.updated_at_utc";

/// Linear cursors only ever move forward.
pub const UPSERT_LINEAR_CHECKPOINT: &str = "
INSERT INTO archive_writer_checkpoints (stream_id, topic, partition_id, next_offset, offset_kind, updated_at_utc)
VALUES (:stream_id, :topic, :partition_id, :next_offset, :offset_kind, :updated_at_utc)
ON CONFLICT (stream_id, topic, partition_id) DO UPDATE SET
    next_offset = excluded.next_offset,
    offset_kind = excluded.offset_kind,
    updated_at_utc = excluded.updated_at_utc
WHERE archive_writer_checkpoints.offset_kind <> excluded.offset_kind
   OR CAST(archive_writer_checkpoints.next_offset AS BIGINT) < CAST(excluded.next_offset AS BIGINT)";

pub const COUNT_OFFSETS: &str =
    "SELECT COUNT(*), CAST(COALESCE(SUM(mismatch_count), 0) AS BIGINT) FROM archive_writer_offsets WHERE stream_id = :stream_id";

pub const COUNT_MISMATCHES: &str =
    "SELECT COUNT(*) FROM archive_writer_mismatches WHERE stream_id = :stream_id";

pub const COUNT_CHECKPOINTS: &str =
    "SELECT COUNT(*) FROM archive_writer_checkpoints WHERE stream_id = :stream_id";
