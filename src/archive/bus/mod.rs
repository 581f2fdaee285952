//! Event-bus readers.

pub mod file;
pub mod kinesis;

use crate::archive::config::{BusConfig, BusKind};
use crate::archive::contracts::OffsetKind;
use crate::archive::ledger::Checkpoint;
use crate::error::BusError;
use serde_json::Value;

pub use file::FileBusReader;
pub use kinesis::KinesisBusReader;

/// One record as the bus hands it over, before canonicalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBusRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: String,
    pub offset_kind: OffsetKind,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct ReadRequest<'a> {
    pub topic: &'a str,
    pub partition: u32,
    /// Ledger checkpoint; `None` starts from the reader's configured position.
    pub from: Option<&'a Checkpoint>,
    pub max_records: usize,
}

pub trait BusReader: Send {
    fn list_partitions(&mut self, topic: &str) -> Result<Vec<u32>, BusError>;

    /// Records of one partition in bus order, starting at `request.from`.
    fn read(&mut self, request: &ReadRequest<'_>) -> Result<Vec<RawBusRecord>, BusError>;
}

pub fn open_reader(cfg: &BusConfig) -> Result<Box<dyn BusReader>, BusError> {
    match cfg.kind {
        BusKind::File => Ok(Box::new(FileBusReader::new(&cfg.root, cfg.start_position))),
        BusKind::Kinesis => Ok(Box::new(KinesisBusReader::from_config(cfg)?)),
    }
}
