use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const PROFILE_ENV: &str = "ARCHIVE_WRITER_PROFILE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    File,
    Kinesis,
}

impl BusKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "kinesis" => Some(Self::Kinesis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    TrimHorizon,
    Latest,
}

impl StartPosition {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trim_horizon" | "earliest" => Some(Self::TrimHorizon),
            "latest" => Some(Self::Latest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
    pub root: String,
    pub stream: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub start_position: StartPosition,
    pub topics: Vec<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::File,
            root: "runs/bus".to_string(),
            stream: None,
            region: None,
            endpoint: None,
            start_position: StartPosition::TrimHorizon,
            topics: vec!["fp.bus.traffic.v1".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub max_records_per_poll: u64,
    pub idle_sleep_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_records_per_poll: 200,
            idle_sleep_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub locator: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            locator: "runs/archive_writer/ledger.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Local directory, or `s3://bucket/prefix`.
    pub root: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub path_style: bool,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            root: "runs/archive".to_string(),
            endpoint: None,
            region: None,
            path_style: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub log_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveWriterConfig {
    pub stream_id: String,
    pub required_platform_run_id: Option<String>,
    pub bus: BusConfig,
    pub poll: PollConfig,
    pub ledger: LedgerConfig,
    pub object_store: ObjectStoreConfig,
    pub governance: GovernanceConfig,
}

impl Default for ArchiveWriterConfig {
    fn default() -> Self {
        Self {
            stream_id: "archive_writer".to_string(),
            required_platform_run_id: None,
            bus: BusConfig::default(),
            poll: PollConfig::default(),
            ledger: LedgerConfig::default(),
            object_store: ObjectStoreConfig::default(),
            governance: GovernanceConfig::default(),
        }
    }
}

impl ArchiveWriterConfig {
    /// Ledger namespace: scoped by run when the worker is pinned to one.
    pub fn effective_stream_id(&self) -> String {
        match &self.required_platform_run_id {
            Some(run) => format!("{}::{run}", self.stream_id),
            None => self.stream_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartialArchiveWriterConfig {
    stream_id: Option<String>,
    required_platform_run_id: Option<String>,
    bus: Option<BusConfig>,
    poll: Option<PollConfig>,
    ledger: Option<LedgerConfig>,
    object_store: Option<ObjectStoreConfig>,
    governance: Option<GovernanceConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_optional(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

pub fn validate(cfg: &ArchiveWriterConfig) -> Result<()> {
    if cfg.stream_id.trim().is_empty() {
        return Err(anyhow!("invalid stream_id: cannot be empty"));
    }
    if cfg
        .required_platform_run_id
        .as_deref()
        .is_some_and(|run| run.trim().is_empty())
    {
        return Err(anyhow!("invalid required_platform_run_id: cannot be blank"));
    }
    if cfg.bus.topics.iter().all(|t| t.trim().is_empty()) {
        return Err(anyhow!("invalid bus topics: at least one topic is required"));
    }
    match cfg.bus.kind {
        BusKind::File if cfg.bus.root.trim().is_empty() => {
            return Err(anyhow!("invalid bus root: file bus needs a root directory"));
        }
        BusKind::Kinesis if cfg.bus.stream.as_deref().is_none_or(|s| s.trim().is_empty()) => {
            return Err(anyhow!("invalid bus stream: kinesis bus needs a stream name"));
        }
        _ => {}
    }
    if cfg.poll.max_records_per_poll == 0 {
        return Err(anyhow!("invalid max_records_per_poll: must be >= 1"));
    }
    if cfg.poll.idle_sleep_ms == 0 {
        return Err(anyhow!("invalid idle_sleep_ms: must be >= 1"));
    }
    if cfg.ledger.locator.trim().is_empty() {
        return Err(anyhow!("invalid ledger locator: cannot be empty"));
    }
    if cfg.object_store.root.trim().is_empty() {
        return Err(anyhow!("invalid object store root: cannot be empty"));
    }
    Ok(())
}

/// `--profile`, then `ARCHIVE_WRITER_PROFILE`, then `~/.archive_writer/profile.yaml`.
/// The boolean is true when the path was named explicitly and must exist.
pub fn resolve_profile_path(explicit: Option<&Path>) -> Option<(PathBuf, bool)> {
    if let Some(path) = explicit {
        return Some((path.to_path_buf(), true));
    }
    if let Ok(custom) = env::var(PROFILE_ENV) {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some((PathBuf::from(trimmed), true));
        }
    }
    let home = dirs::home_dir()?;
    Some((home.join(".archive_writer").join("profile.yaml"), false))
}

fn parse_profile(path: &Path, raw: &str) -> Result<PartialArchiveWriterConfig> {
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(raw)
            .map_err(|err| anyhow!("failed to parse profile {}: {err}", path.display()))
    } else if raw.trim().is_empty() {
        Ok(PartialArchiveWriterConfig::default())
    } else {
        serde_yaml::from_str(raw)
            .map_err(|err| anyhow!("failed to parse profile {}: {err}", path.display()))
    }
}

fn merge_profile(base: &mut ArchiveWriterConfig, parsed: PartialArchiveWriterConfig) {
    if let Some(stream_id) = parsed.stream_id {
        base.stream_id = stream_id;
    }
    if parsed.required_platform_run_id.is_some() {
        base.required_platform_run_id = parsed.required_platform_run_id;
    }
    if let Some(bus) = parsed.bus {
        base.bus = bus;
    }
    if let Some(poll) = parsed.poll {
        base.poll = poll;
    }
    if let Some(ledger) = parsed.ledger {
        base.ledger = ledger;
    }
    if let Some(object_store) = parsed.object_store {
        base.object_store = object_store;
    }
    if let Some(governance) = parsed.governance {
        base.governance = governance;
    }
}

fn apply_env_overrides(cfg: &mut ArchiveWriterConfig) -> Result<()> {
    cfg.stream_id = env_or_string("ARCHIVE_WRITER_STREAM_ID", &cfg.stream_id);
    cfg.required_platform_run_id = env_or_optional(
        "ARCHIVE_WRITER_REQUIRED_PLATFORM_RUN_ID",
        cfg.required_platform_run_id.take(),
    );

    if let Ok(raw) = env::var("ARCHIVE_WRITER_BUS_KIND") {
        cfg.bus.kind = BusKind::parse(&raw)
            .ok_or_else(|| anyhow!("invalid ARCHIVE_WRITER_BUS_KIND `{raw}`: use `file` or `kinesis`"))?;
    }
    cfg.bus.root = env_or_string("ARCHIVE_WRITER_BUS_ROOT", &cfg.bus.root);
    cfg.bus.stream = env_or_optional("ARCHIVE_WRITER_BUS_STREAM", cfg.bus.stream.take());
    cfg.bus.region = env_or_optional("ARCHIVE_WRITER_BUS_REGION", cfg.bus.region.take());
    cfg.bus.endpoint = env_or_optional("ARCHIVE_WRITER_BUS_ENDPOINT", cfg.bus.endpoint.take());
    if let Ok(raw) = env::var("ARCHIVE_WRITER_START_POSITION") {
        cfg.bus.start_position = StartPosition::parse(&raw).ok_or_else(|| {
            anyhow!("invalid ARCHIVE_WRITER_START_POSITION `{raw}`: use `trim_horizon` or `latest`")
        })?;
    }
    cfg.bus.topics = env_or_csv("ARCHIVE_WRITER_TOPICS", &cfg.bus.topics);

    cfg.poll.max_records_per_poll =
        env_or_u64("ARCHIVE_WRITER_MAX_RECORDS_PER_POLL", cfg.poll.max_records_per_poll);
    cfg.poll.idle_sleep_ms = env_or_u64("ARCHIVE_WRITER_IDLE_SLEEP_MS", cfg.poll.idle_sleep_ms);

    cfg.ledger.locator = env_or_string("ARCHIVE_WRITER_LEDGER_LOCATOR", &cfg.ledger.locator);

    cfg.object_store.root = env_or_string("ARCHIVE_WRITER_OBJECT_STORE_ROOT", &cfg.object_store.root);
    cfg.object_store.endpoint = env_or_optional(
        "ARCHIVE_WRITER_OBJECT_STORE_ENDPOINT",
        cfg.object_store.endpoint.take(),
    );
    cfg.object_store.region = env_or_optional(
        "ARCHIVE_WRITER_OBJECT_STORE_REGION",
        cfg.object_store.region.take(),
    );
    cfg.object_store.path_style = env_or_bool(
        "ARCHIVE_WRITER_OBJECT_STORE_PATH_STYLE",
        cfg.object_store.path_style,
    );

    cfg.governance.log_path =
        env_or_optional("ARCHIVE_WRITER_GOVERNANCE_LOG", cfg.governance.log_path.take());
    Ok(())
}

/// Defaults, then the profile file, then `ARCHIVE_WRITER_*` overrides.
pub fn load_config(profile: Option<&Path>) -> Result<ArchiveWriterConfig> {
    let mut cfg = ArchiveWriterConfig::default();
    if let Some((path, required)) = resolve_profile_path(profile) {
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read profile {}", path.display()))?;
            merge_profile(&mut cfg, parse_profile(&path, &raw)?);
        } else if required {
            return Err(anyhow!("profile not found: {}", path.display()));
        }
    }
    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_profile_overrides_only_named_sections() {
        let raw = r#"
stream_id: aw_local
required_platform_run_id: platform_20260101T000000Z
bus:
  kind: file
  root: /tmp/bus
  topics: [fp.bus.traffic.v1, fp.bus.context.v1]
poll:
  max_records_per_poll: 50
"#;
        let mut cfg = ArchiveWriterConfig::default();
        merge_profile(&mut cfg, parse_profile(Path::new("p.yaml"), raw).expect("parse"));

        assert_eq!(cfg.stream_id, "aw_local");
        assert_eq!(cfg.bus.topics.len(), 2);
        assert_eq!(cfg.bus.start_position, StartPosition::TrimHorizon);
        assert_eq!(cfg.poll.max_records_per_poll, 50);
        assert_eq!(cfg.poll.idle_sleep_ms, 500);
        assert_eq!(cfg.ledger.locator, "runs/archive_writer/ledger.sqlite");
        assert_eq!(
            cfg.effective_stream_id(),
            "aw_local::platform_20260101T000000Z"
        );
        validate(&cfg).expect("valid");
    }

    #[test]
    fn toml_profile_is_selected_by_extension() {
        let raw = r#"
stream_id = "aw_toml"

[object_store]
root = "s3://archive/prefix"
path_style = true
"#;
        let mut cfg = ArchiveWriterConfig::default();
        merge_profile(&mut cfg, parse_profile(Path::new("p.toml"), raw).expect("parse"));
        assert_eq!(cfg.stream_id, "aw_toml");
        assert!(cfg.object_store.path_style);
        assert_eq!(cfg.effective_stream_id(), "aw_toml");
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut cfg = ArchiveWriterConfig::default();
        cfg.poll.max_records_per_poll = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = ArchiveWriterConfig::default();
        cfg.bus.kind = BusKind::Kinesis;
        assert!(validate(&cfg).is_err());
        cfg.bus.stream = Some("fraud-bus".to_string());
        validate(&cfg).expect("kinesis with stream");

        let mut cfg = ArchiveWriterConfig::default();
        cfg.bus.topics = vec![" ".to_string()];
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn malformed_profile_names_the_file() {
        let err = parse_profile(Path::new("broken.yaml"), "bus: [unterminated").expect_err("bad yaml");
        assert!(err.to_string().contains("broken.yaml"));
    }
}
