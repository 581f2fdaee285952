//! Canonical archive records and the origin coordinates they come from.

use crate::archive::canonical_json::canonical_map_hash;
use crate::archive::util::now_utc;
use crate::error::ContractViolation;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OffsetKind {
    FileLine,
    KafkaOffset,
    KinesisSequence,
    Other(String),
}

impl OffsetKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "file_line" => Self::FileLine,
            "kafka_offset" => Self::KafkaOffset,
            "kinesis_sequence" => Self::KinesisSequence,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::FileLine => "file_line",
            Self::KafkaOffset => "kafka_offset",
            Self::KinesisSequence => "kinesis_sequence",
            Self::Other(raw) => raw.as_str(),
        }
    }

    /// Exclusive linear cursors resume at `offset + 1`; every other kind is an
    /// opaque token handed back to the reader verbatim.
    pub fn is_linear_cursor(&self) -> bool {
        matches!(self, Self::FileLine | Self::KafkaOffset)
    }
}

impl fmt::Display for OffsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OffsetKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OffsetKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginOffset {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
    pub offset_kind: OffsetKind,
}

impl OriginOffset {
    pub fn new(
        topic: impl Into<String>,
        partition: u32,
        offset: impl Into<String>,
        offset_kind: OffsetKind,
    ) -> Result<Self, ContractViolation> {
        let topic = topic.into();
        let offset = offset.into();
        if topic.trim().is_empty() {
            return Err(ContractViolation::BlankOrigin("topic"));
        }
        if offset.trim().is_empty() {
            return Err(ContractViolation::BlankOrigin("offset"));
        }
        if offset_kind.as_str().trim().is_empty() {
            return Err(ContractViolation::BlankOrigin("offset_kind"));
        }
        Ok(Self {
            topic,
            partition,
            offset,
            offset_kind,
        })
    }

    /// `topic:partition:offset_kind:offset`, used to deduplicate anomalies.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.topic, self.partition, self.offset_kind, self.offset
        )
    }
}

/// A bus payload as an ordered, schema-agnostic key/value document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub fn from_value(value: Value) -> Result<Self, ContractViolation> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ContractViolation::NotAMapping),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    fn required_str(&self, field: &'static str) -> Result<String, ContractViolation> {
        let value = self
            .0
            .get(field)
            .ok_or(ContractViolation::MissingField(field))?;
        let text = value.as_str().ok_or(ContractViolation::NotAString(field))?;
        if text.trim().is_empty() {
            return Err(ContractViolation::BlankField(field));
        }
        Ok(text.to_string())
    }

    fn optional_seed(&self) -> Result<Option<u64>, ContractViolation> {
        match self.0.get("seed") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or(ContractViolation::InvalidSeed),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ContractViolation::InvalidSeed),
            Some(_) => Err(ContractViolation::InvalidSeed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEventRecord {
    pub platform_run_id: String,
    pub scenario_run_id: String,
    pub manifest_fingerprint: String,
    pub parameter_hash: String,
    pub scenario_id: String,
    pub event_id: String,
    pub event_type: String,
    pub ts_utc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub archived_at_utc: String,
    pub payload_hash: String,
    pub origin_offset: OriginOffset,
    pub envelope: Envelope,
}

impl ArchiveEventRecord {
    pub fn from_bus_record(
        envelope: Value,
        topic: &str,
        partition: u32,
        offset: &str,
        offset_kind: OffsetKind,
    ) -> Result<Self, ContractViolation> {
        let envelope = Envelope::from_value(envelope)?;
        let origin_offset = OriginOffset::new(topic, partition, offset, offset_kind)?;
        Self::from_envelope(envelope, origin_offset)
    }

    fn from_envelope(
        envelope: Envelope,
        origin_offset: OriginOffset,
    ) -> Result<Self, ContractViolation> {
        Ok(Self {
            platform_run_id: envelope.required_str("platform_run_id")?,
            scenario_run_id: envelope.required_str("scenario_run_id")?,
            manifest_fingerprint: envelope.required_str("manifest_fingerprint")?,
            parameter_hash: envelope.required_str("parameter_hash")?,
            scenario_id: envelope.required_str("scenario_id")?,
            event_id: envelope.required_str("event_id")?,
            event_type: envelope.required_str("event_type")?,
            ts_utc: envelope.required_str("ts_utc")?,
            seed: envelope.optional_seed()?,
            archived_at_utc: now_utc(),
            payload_hash: canonical_payload_hash(&envelope),
            origin_offset,
            envelope,
        })
    }

    pub fn archive_relative_path(&self) -> String {
        archive_relative_path(&self.platform_run_id, &self.origin_offset)
    }

    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Bus records sometimes wrap the logical envelope under `payload`; unwrap
/// one level when the outer document carries no event identity of its own.
pub fn unwrap_bus_payload(value: Value) -> Value {
    match value {
        Value::Object(mut outer)
            if !outer.contains_key("event_id") && matches!(outer.get("payload"), Some(Value::Object(_))) =>
        {
            outer.remove("payload").unwrap_or(Value::Object(Map::new()))
        }
        other => other,
    }
}

pub fn canonical_payload_hash(envelope: &Envelope) -> String {
    canonical_map_hash(envelope.as_map())
}

/// Maps every character outside `[A-Za-z0-9_.:-]` to `_`; an empty or
/// dots-only token becomes `_` so it can never name `.` or `..`.
pub fn sanitize_token(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | ':' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() || out.chars().all(|ch| ch == '.') {
        "_".to_string()
    } else {
        out
    }
}

pub fn archive_relative_path(run_prefix: &str, origin: &OriginOffset) -> String {
    format!(
        "{}/archive/events/topic={}/partition={}/offset_kind={}/offset={}.json",
        sanitize_token(run_prefix),
        sanitize_token(&origin.topic),
        origin.partition,
        sanitize_token(origin.offset_kind.as_str()),
        sanitize_token(&origin.offset),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_envelope(event_id: &str) -> Value {
        json!({
            "platform_run_id": "platform_20260101T000000Z",
            "scenario_run_id": "scenario_run_a",
            "manifest_fingerprint": "a".repeat(64),
            "parameter_hash": "b".repeat(64),
            "scenario_id": "baseline_v1",
            "event_id": event_id,
            "event_type": "transaction_authorised",
            "ts_utc": "2026-01-01T00:00:00.000000Z",
            "seed": 42,
            "payload": {"amount_minor": 1250, "currency": "EUR"}
        })
    }

    #[test]
    fn builds_record_with_identity_and_hash() {
        let record = ArchiveEventRecord::from_bus_record(
            sample_envelope("evt-1"),
            "fp.bus.traffic.v1",
            0,
            "7",
            OffsetKind::FileLine,
        )
        .expect("canonical record");

        assert_eq!(record.event_id, "evt-1");
        assert_eq!(record.seed, Some(42));
        assert_eq!(record.payload_hash.len(), 64);
        assert_eq!(
            record.archive_relative_path(),
            "platform_20260101T000000Z/archive/events/topic=fp.bus.traffic.v1/partition=0/offset_kind=file_line/offset=7.json"
        );
    }

    #[test]
    fn rejects_non_mapping_envelopes() {
        let err = ArchiveEventRecord::from_bus_record(json!([1, 2]), "t", 0, "1", OffsetKind::FileLine)
            .expect_err("arrays are not envelopes");
        assert_eq!(err, ContractViolation::NotAMapping);
    }

    #[test]
    fn rejects_missing_blank_or_non_string_identity() {
        let mut missing = sample_envelope("evt-1");
        missing.as_object_mut().expect("object").remove("scenario_id");
        assert_eq!(
            ArchiveEventRecord::from_bus_record(missing, "t", 0, "1", OffsetKind::FileLine),
            Err(ContractViolation::MissingField("scenario_id"))
        );

        let mut blank = sample_envelope("evt-1");
        blank["event_type"] = json!("   ");
        assert_eq!(
            ArchiveEventRecord::from_bus_record(blank, "t", 0, "1", OffsetKind::FileLine),
            Err(ContractViolation::BlankField("event_type"))
        );

        let mut numeric = sample_envelope("evt-1");
        numeric["ts_utc"] = json!(1_700_000_000);
        assert_eq!(
            ArchiveEventRecord::from_bus_record(numeric, "t", 0, "1", OffsetKind::FileLine),
            Err(ContractViolation::NotAString("ts_utc"))
        );
    }

    #[test]
    fn every_identity_field_is_required() {
        for field in [
            "platform_run_id",
            "scenario_run_id",
            "manifest_fingerprint",
            "parameter_hash",
            "scenario_id",
            "event_id",
            "event_type",
            "ts_utc",
        ] {
            let mut envelope = sample_envelope("evt-1");
            envelope.as_object_mut().expect("object").remove(field);
            let err = ArchiveEventRecord::from_bus_record(envelope, "t", 0, "1", OffsetKind::FileLine)
                .expect_err("field is required");
            assert_eq!(err, ContractViolation::MissingField(field), "field {field}");
        }
    }

    #[test]
    fn rejects_blank_origin_and_bad_seed() {
        assert_eq!(
            ArchiveEventRecord::from_bus_record(sample_envelope("e"), " ", 0, "1", OffsetKind::FileLine),
            Err(ContractViolation::BlankOrigin("topic"))
        );

        let mut seed = sample_envelope("e");
        seed["seed"] = json!(-3);
        assert_eq!(
            ArchiveEventRecord::from_bus_record(seed, "t", 0, "1", OffsetKind::FileLine),
            Err(ContractViolation::InvalidSeed)
        );
    }

    #[test]
    fn hash_covers_whole_envelope() {
        let a = ArchiveEventRecord::from_bus_record(sample_envelope("e"), "t", 0, "1", OffsetKind::FileLine)
            .expect("record");
        let mut changed = sample_envelope("e");
        changed["payload"]["amount_minor"] = json!(1251);
        let b = ArchiveEventRecord::from_bus_record(changed, "t", 0, "1", OffsetKind::FileLine)
            .expect("record");
        assert_ne!(a.payload_hash, b.payload_hash);
    }

    #[test]
    fn unwraps_single_payload_level_only_for_wrappers() {
        let wrapped = json!({"topic": "t", "payload": sample_envelope("evt-w")});
        assert_eq!(unwrap_bus_payload(wrapped), sample_envelope("evt-w"));

        let direct = sample_envelope("evt-d");
        assert_eq!(unwrap_bus_payload(direct.clone()), direct);

        let scalar_payload = json!({"topic": "t", "payload": 7});
        assert_eq!(unwrap_bus_payload(scalar_payload.clone()), scalar_payload);
        assert_eq!(unwrap_bus_payload(json!("text")), json!("text"));
    }

    #[test]
    fn sanitizes_path_tokens() {
        assert_eq!(sanitize_token("a/b c?d"), "a_b_c_d");
        assert_eq!(sanitize_token(""), "_");
        assert_eq!(sanitize_token(".."), "_");
        assert_eq!(sanitize_token("ok-1.2:3_x"), "ok-1.2:3_x");

        let origin = OriginOffset::new("../t", 3, "49/5", OffsetKind::parse("kinesis_sequence"))
            .expect("origin");
        let first = archive_relative_path("run 1", &origin);
        assert_eq!(first, archive_relative_path("run 1", &origin));
        assert_eq!(
            first,
            "run_1/archive/events/topic=.._t/partition=3/offset_kind=kinesis_sequence/offset=49_5.json"
        );
    }

    #[test]
    fn offset_kind_round_trips_custom_tags() {
        assert_eq!(OffsetKind::parse("kafka_offset"), OffsetKind::KafkaOffset);
        assert!(OffsetKind::KafkaOffset.is_linear_cursor());
        let custom = OffsetKind::parse("pubsub_ack");
        assert_eq!(custom.as_str(), "pubsub_ack");
        assert!(!custom.is_linear_cursor());
    }
}
