use crate::archive::bus::{BusReader, RawBusRecord, ReadRequest};
use crate::archive::config::StartPosition;
use crate::archive::contracts::OffsetKind;
use crate::error::BusError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Local bus: `{root}/{topic}/partition=<n>.jsonl`, one envelope per line,
/// offset = 0-based line number.
pub struct FileBusReader {
    root: PathBuf,
    start_position: StartPosition,
    /// Where `latest` began for a partition with no checkpoint yet.
    latest_marks: BTreeMap<(String, u32), u64>,
}

impl FileBusReader {
    pub fn new(root: impl Into<PathBuf>, start_position: StartPosition) -> Self {
        Self {
            root: root.into(),
            start_position,
            latest_marks: BTreeMap::new(),
        }
    }

    fn partition_path(&self, topic: &str, partition: u32) -> PathBuf {
        self.root.join(topic).join(format!("partition={partition}.jsonl"))
    }

    fn start_line(&mut self, request: &ReadRequest<'_>, path: &Path) -> Result<u64, BusError> {
        if let Some(checkpoint) = request.from {
            return checkpoint.next_offset.trim().parse::<u64>().map_err(|_| {
                BusError::Decode(format!(
                    "checkpoint `{}` for {}/{} is not a line number",
                    checkpoint.next_offset, request.topic, request.partition
                ))
            });
        }
        if self.start_position == StartPosition::TrimHorizon {
            return Ok(0);
        }
        let key = (request.topic.to_string(), request.partition);
        if let Some(mark) = self.latest_marks.get(&key) {
            return Ok(*mark);
        }
        let mark = count_lines(path)?;
        self.latest_marks.insert(key, mark);
        Ok(mark)
    }
}

fn io_error(path: &Path, source: io::Error) -> BusError {
    BusError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn count_lines(path: &Path) -> Result<u64, BusError> {
    if !path.exists() {
        return Ok(0);
    }
    let file = fs::File::open(path).map_err(|err| io_error(path, err))?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut count = 0u64;
    while next_complete_line(&mut reader, &mut line).map_err(|err| io_error(path, err))? {
        count += 1;
    }
    Ok(count)
}

/// Loads the next `\n`-terminated line into `line`, without its terminator.
///
/// A trailing fragment with no newline is a line still being appended; it is
/// reported as end of input so its offset is neither emitted nor counted.
fn next_complete_line<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<bool> {
    line.clear();
    if reader.read_until(b'\n', line)? == 0 || line.last() != Some(&b'\n') {
        return Ok(false);
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(true)
}

/// Lines that are not UTF-8 JSON become non-object payloads, rejected as
/// contract violations downstream instead of wedging the partition.
fn decode_line(line: &[u8]) -> Option<Value> {
    let Ok(text) = std::str::from_utf8(line) else {
        let lossy = String::from_utf8_lossy(line);
        return Some(Value::String(lossy.trim().to_string()));
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<Value>(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
}

impl BusReader for FileBusReader {
    fn list_partitions(&mut self, topic: &str) -> Result<Vec<u32>, BusError> {
        let dir = self.root.join(topic);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut partitions = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|err| io_error(&dir, err))? {
            let entry = entry.map_err(|err| io_error(&dir, err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let parsed = name
                .strip_prefix("partition=")
                .and_then(|rest| rest.strip_suffix(".jsonl"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(partition) = parsed {
                partitions.push(partition);
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }

    fn read(&mut self, request: &ReadRequest<'_>) -> Result<Vec<RawBusRecord>, BusError> {
        let path = self.partition_path(request.topic, request.partition);
        let start = self.start_line(request, &path)?;
        if !path.exists() || request.max_records == 0 {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path).map_err(|err| io_error(&path, err))?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut records = Vec::new();
        let mut line_no = 0u64;
        while next_complete_line(&mut reader, &mut line).map_err(|err| io_error(&path, err))? {
            let current = line_no;
            line_no += 1;
            if current < start {
                continue;
            }
            let Some(payload) = decode_line(&line) else {
                continue;
            };
            records.push(RawBusRecord {
                topic: request.topic.to_string(),
                partition: request.partition,
                offset: current.to_string(),
                offset_kind: OffsetKind::FileLine,
                payload,
            });
            if records.len() >= request.max_records {
                break;
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ledger::Checkpoint;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_partition(root: &Path, topic: &str, partition: u32, lines: &[&str]) {
        let dir = root.join(topic);
        fs::create_dir_all(&dir).expect("mkdir");
        let mut file = fs::File::create(dir.join(format!("partition={partition}.jsonl"))).expect("create");
        for line in lines {
            writeln!(file, "{line}").expect("write");
        }
    }

    fn request<'a>(from: Option<&'a Checkpoint>, max_records: usize) -> ReadRequest<'a> {
        ReadRequest {
            topic: "t",
            partition: 0,
            from,
            max_records,
        }
    }

    #[test]
    fn lists_numbered_partitions_only() {
        let tmp = tempdir().expect("tempdir");
        write_partition(tmp.path(), "t", 2, &["{}"]);
        write_partition(tmp.path(), "t", 0, &["{}"]);
        fs::write(tmp.path().join("t").join("notes.txt"), "x").expect("write");
        let mut reader = FileBusReader::new(tmp.path(), StartPosition::TrimHorizon);
        assert_eq!(reader.list_partitions("t").expect("list"), vec![0, 2]);
        assert!(reader.list_partitions("missing").expect("list").is_empty());
    }

    #[test]
    fn resumes_from_checkpoint_and_keeps_line_offsets() {
        let tmp = tempdir().expect("tempdir");
        write_partition(tmp.path(), "t", 0, &[r#"{"n":0}"#, "", r#"{"n":2}"#, "not json", r#"{"n":4}"#]);
        let mut reader = FileBusReader::new(tmp.path(), StartPosition::TrimHorizon);

        let all = reader.read(&request(None, 10)).expect("read");
        let offsets: Vec<&str> = all.iter().map(|r| r.offset.as_str()).collect();
        assert_eq!(offsets, vec!["0", "2", "3", "4"]);
        assert_eq!(all[2].payload, Value::String("not json".to_string()));

        let checkpoint = Checkpoint {
            next_offset: "3".to_string(),
            offset_kind: OffsetKind::FileLine,
        };
        let tail = reader.read(&request(Some(&checkpoint), 1)).expect("read");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].offset, "3");
    }

    #[test]
    fn latest_skips_existing_lines_until_checkpointed() {
        let tmp = tempdir().expect("tempdir");
        write_partition(tmp.path(), "t", 0, &[r#"{"n":0}"#, r#"{"n":1}"#]);
        let mut reader = FileBusReader::new(tmp.path(), StartPosition::Latest);
        assert!(reader.read(&request(None, 10)).expect("read").is_empty());

        let path = tmp.path().join("t").join("partition=0.jsonl");
        let mut file = fs::OpenOptions::new().append(true).open(path).expect("open");
        writeln!(file, r#"{{"n":2}}"#).expect("append");

        let fresh = reader.read(&request(None, 10)).expect("read");
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].offset, "2");
    }

    #[test]
    fn unterminated_tail_is_left_for_the_next_read() {
        let tmp = tempdir().expect("tempdir");
        write_partition(tmp.path(), "t", 0, &[r#"{"n":0}"#]);
        let path = tmp.path().join("t").join("partition=0.jsonl");
        let mut file = fs::OpenOptions::new().append(true).open(&path).expect("open");
        write!(file, r#"{{"n":"#).expect("append half");
        file.flush().expect("flush");

        let mut reader = FileBusReader::new(tmp.path(), StartPosition::TrimHorizon);
        let first = reader.read(&request(None, 10)).expect("read");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].offset, "0");
        assert_eq!(count_lines(&path).expect("count"), 1);

        writeln!(file, "1}}").expect("complete line");
        let checkpoint = Checkpoint {
            next_offset: "1".to_string(),
            offset_kind: OffsetKind::FileLine,
        };
        let rest = reader.read(&request(Some(&checkpoint), 10)).expect("read");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].offset, "1");
        assert_eq!(rest[0].payload, serde_json::json!({"n": 1}));
    }

    #[test]
    fn invalid_utf8_line_becomes_a_string_payload() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("t");
        fs::create_dir_all(&dir).expect("mkdir");
        let mut body = b"\xff\xfe garbage\n".to_vec();
        body.extend_from_slice(b"{\"n\":1}\r\n");
        fs::write(dir.join("partition=0.jsonl"), body).expect("write");

        let mut reader = FileBusReader::new(tmp.path(), StartPosition::TrimHorizon);
        let records = reader.read(&request(None, 10)).expect("read");
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0].payload, Value::String(text) if text.ends_with("garbage")));
        assert_eq!(records[1].offset, "1");
        assert_eq!(records[1].payload, serde_json::json!({"n": 1}));
    }
}
