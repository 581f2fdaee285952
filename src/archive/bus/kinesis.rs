//! Shard-based stream reader speaking the Kinesis JSON API.
//!
//! Each shard is exposed as a partition numbered by the integer suffix of its
//! shard id. Offsets are sequence numbers (`kinesis_sequence`), which the
//! ledger stores verbatim; resumption uses `AFTER_SEQUENCE_NUMBER`, or
//! `AT_SEQUENCE_NUMBER` of the first record seen when nothing has been
//! checkpointed yet.

use crate::archive::aws_sigv4::{AwsCredentials, SigningScope, default_region, sign_request};
use crate::archive::bus::{BusReader, RawBusRecord, ReadRequest};
use crate::archive::config::{BusConfig, StartPosition};
use crate::archive::contracts::OffsetKind;
use crate::archive::util::truncate_with_ellipsis;
use crate::error::BusError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const TARGET_PREFIX: &str = "Kinesis_20131202";
/// GetRecords accepts at most this many records per call.
const MAX_GET_RECORDS: usize = 10_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListShardsResponse {
    #[serde(default)]
    shards: Vec<Shard>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Shard {
    shard_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShardIteratorResponse {
    shard_iterator: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetRecordsResponse {
    #[serde(default)]
    records: Vec<StreamRecord>,
    next_shard_iterator: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StreamRecord {
    sequence_number: String,
    data: String,
}

/// Iterator left by the previous read, valid while the checkpoint still
/// points at the last sequence that read returned.
struct CachedIterator {
    after_sequence: Option<String>,
    iterator: String,
}

/// Where a fresh shard iterator starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IteratorStart<'a> {
    After(&'a str),
    At(&'a str),
    Configured,
}

/// A checkpoint wins. Without one, a partition that already returned records
/// restarts at the first of them: a new `LATEST` iterator would skip
/// records that were read but never committed.
fn resume_point<'a>(after: Option<&'a str>, first_unread: Option<&'a str>) -> IteratorStart<'a> {
    match (after, first_unread) {
        (Some(sequence), _) => IteratorStart::After(sequence),
        (None, Some(sequence)) => IteratorStart::At(sequence),
        (None, None) => IteratorStart::Configured,
    }
}

fn iterator_request(stream: &str, shard_id: &str, start: IteratorStart<'_>, position: StartPosition) -> Value {
    let mut body = json!({
        "StreamName": stream,
        "ShardId": shard_id,
    });
    match start {
        IteratorStart::After(sequence) => {
            body["ShardIteratorType"] = json!("AFTER_SEQUENCE_NUMBER");
            body["StartingSequenceNumber"] = json!(sequence);
        }
        IteratorStart::At(sequence) => {
            body["ShardIteratorType"] = json!("AT_SEQUENCE_NUMBER");
            body["StartingSequenceNumber"] = json!(sequence);
        }
        IteratorStart::Configured => {
            body["ShardIteratorType"] = json!(match position {
                StartPosition::TrimHorizon => "TRIM_HORIZON",
                StartPosition::Latest => "LATEST",
            });
        }
    }
    body
}

pub struct KinesisBusReader {
    stream_template: String,
    region: String,
    endpoint: Url,
    start_position: StartPosition,
    credentials: AwsCredentials,
    client: Client,
    shards: BTreeMap<String, BTreeMap<u32, String>>,
    iterators: BTreeMap<(String, u32), CachedIterator>,
    /// First sequence returned for a partition that has no checkpoint yet.
    first_unread: BTreeMap<(String, u32), String>,
}

impl KinesisBusReader {
    pub fn from_config(cfg: &BusConfig) -> Result<Self, BusError> {
        let stream_template = cfg
            .stream
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BusError::Config("kinesis bus needs a stream name".to_string()))?;
        let region = cfg.region.clone().unwrap_or_else(default_region);
        let raw_endpoint = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://kinesis.{region}.amazonaws.com/"));
        let endpoint = Url::parse(&raw_endpoint)
            .map_err(|err| BusError::Config(format!("invalid endpoint `{raw_endpoint}`: {err}")))?;
        Ok(Self {
            stream_template,
            region,
            endpoint,
            start_position: cfg.start_position,
            credentials: AwsCredentials::from_env()?,
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            shards: BTreeMap::new(),
            iterators: BTreeMap::new(),
            first_unread: BTreeMap::new(),
        })
    }

    /// `{topic}` in the configured stream name is replaced by the topic.
    fn stream_name(&self, topic: &str) -> String {
        self.stream_template.replace("{topic}", topic)
    }

    fn call<T: DeserializeOwned>(&self, action: &'static str, body: &Value) -> Result<T, BusError> {
        let payload = serde_json::to_vec(body).map_err(|err| BusError::Decode(err.to_string()))?;
        let target = format!("{TARGET_PREFIX}.{action}");
        let headers = [("content-type", CONTENT_TYPE), ("x-amz-target", target.as_str())];
        let signed = sign_request(
            "POST",
            &self.endpoint,
            &headers,
            &payload,
            &self.credentials,
            SigningScope {
                region: &self.region,
                service: "kinesis",
            },
            Utc::now(),
        )?;
        let mut request = self.client.post(self.endpoint.clone());
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = signed.apply(request).body(payload).send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(BusError::Http {
                action,
                status: status.as_u16(),
                body: truncate_with_ellipsis(&text, 512),
            });
        }
        serde_json::from_str(&text)
            .map_err(|err| BusError::Decode(format!("{action} response: {err}")))
    }

    fn refresh_shards(&mut self, topic: &str) -> Result<(), BusError> {
        let stream = self.stream_name(topic);
        let mut by_partition = BTreeMap::new();
        let mut next_token: Option<String> = None;
        loop {
            // NextToken and StreamName are mutually exclusive in ListShards.
            let body = match &next_token {
                Some(token) => json!({ "NextToken": token }),
                None => json!({ "StreamName": stream }),
            };
            let page: ListShardsResponse = self.call("ListShards", &body)?;
            for shard in page.shards {
                by_partition
                    .entry(shard_partition(&shard.shard_id))
                    .or_insert(shard.shard_id);
            }
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }
        self.shards.insert(topic.to_string(), by_partition);
        Ok(())
    }

    fn shard_id(&mut self, topic: &str, partition: u32) -> Result<String, BusError> {
        if !self.shards.contains_key(topic) {
            self.refresh_shards(topic)?;
        }
        self.shards
            .get(topic)
            .and_then(|shards| shards.get(&partition))
            .cloned()
            .ok_or_else(|| BusError::Config(format!("no shard for {topic} partition {partition}")))
    }

    fn fresh_iterator(&self, topic: &str, shard_id: &str, start: IteratorStart<'_>) -> Result<String, BusError> {
        let body = iterator_request(&self.stream_name(topic), shard_id, start, self.start_position);
        let response: ShardIteratorResponse = self.call("GetShardIterator", &body)?;
        Ok(response.shard_iterator)
    }
}

impl BusReader for KinesisBusReader {
    fn list_partitions(&mut self, topic: &str) -> Result<Vec<u32>, BusError> {
        self.refresh_shards(topic)?;
        Ok(self
            .shards
            .get(topic)
            .map(|shards| shards.keys().copied().collect())
            .unwrap_or_default())
    }

    fn read(&mut self, request: &ReadRequest<'_>) -> Result<Vec<RawBusRecord>, BusError> {
        if request.max_records == 0 {
            return Ok(Vec::new());
        }
        let shard_id = self.shard_id(request.topic, request.partition)?;
        let after = request.from.map(|c| c.next_offset.as_str());
        let key = (request.topic.to_string(), request.partition);

        let first_unread = if after.is_some() {
            self.first_unread.remove(&key);
            None
        } else {
            self.first_unread.get(&key).cloned()
        };
        let iterator = match self.iterators.remove(&key) {
            Some(cached) if cached.after_sequence.as_deref() == after => cached.iterator,
            _ => {
                let start = resume_point(after, first_unread.as_deref());
                self.fresh_iterator(request.topic, &shard_id, start)?
            }
        };
        let body = json!({
            "ShardIterator": iterator,
            "Limit": request.max_records.min(MAX_GET_RECORDS),
        });
        let response: GetRecordsResponse = self.call("GetRecords", &body)?;

        let records: Vec<RawBusRecord> = response
            .records
            .into_iter()
            .map(|record| RawBusRecord {
                topic: request.topic.to_string(),
                partition: request.partition,
                offset: record.sequence_number,
                offset_kind: OffsetKind::KinesisSequence,
                payload: decode_data(&record.data),
            })
            .collect();

        if after.is_none() && first_unread.is_none() {
            if let Some(first) = records.first() {
                self.first_unread.insert(key.clone(), first.offset.clone());
            }
        }
        if let Some(next) = response.next_shard_iterator {
            let after_sequence = records
                .last()
                .map(|r| r.offset.clone())
                .or_else(|| after.map(str::to_string));
            self.iterators.insert(
                key,
                CachedIterator {
                    after_sequence,
                    iterator: next,
                },
            );
        }
        Ok(records)
    }
}

/// `shardId-000000000007` → 7; anything without a numeric suffix → 0.
pub fn shard_partition(shard_id: &str) -> u32 {
    shard_id
        .rsplit(['-', '_'])
        .next()
        .and_then(|suffix| suffix.parse::<u32>().ok())
        .unwrap_or(0)
}

/// Base64 JSON; undecodable data becomes a non-object payload.
fn decode_data(data: &str) -> Value {
    match STANDARD.decode(data.trim()) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        Err(_) => Value::String(data.to_string()),
    }
}
