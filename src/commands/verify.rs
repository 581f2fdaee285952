use anyhow::Result;
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};

use crate::archive::config::{BusKind, load_config};
use crate::archive::store::open_store;
use crate::commands::{CommandReport, status};

mod allowlist {
    include!(concat!(env!("OUT_DIR"), "/archive_writer_env_allowlist.rs"));
}

const ENV_PREFIX: &str = "ARCHIVE_WRITER_";

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub profile: Option<PathBuf>,
    pub strict: bool,
}

pub fn run(opts: &VerifyOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("verify");

    let unknown = unknown_env_keys(env::vars().map(|(key, _)| key), allowlist::GENERATED_ENV_ALLOWLIST);
    for key in &unknown {
        let text = format!("unrecognised environment variable {key}");
        if opts.strict {
            report.issue(text);
        } else {
            report.detail(format!("warning: {text}"));
        }
    }

    let cfg = match load_config(opts.profile.as_deref()) {
        Ok(cfg) => {
            report.detail("config: ok");
            cfg
        }
        Err(err) => {
            report.issue(format!("config: {err:#}"));
            return Ok(report);
        }
    };

    if cfg.bus.kind == BusKind::File && !Path::new(cfg.bus.root.trim()).is_dir() {
        let text = format!("bus root {} does not exist yet", cfg.bus.root);
        if opts.strict {
            report.issue(text);
        } else {
            report.detail(format!("warning: {text}"));
        }
    }

    match open_store(&cfg.object_store) {
        Ok(store) => report.detail(format!("object_store: ok ({})", store.ref_for(""))),
        Err(err) => report.issue(format!("object_store: {err}")),
    }

    match status::report_for(&cfg, None) {
        Ok(status) => report.merge(status),
        Err(err) => report.issue(format!("ledger: {err:#}")),
    }

    if opts.strict && !report.ok {
        report.issue("strict verify failed");
    }

    Ok(report)
}

fn unknown_env_keys(keys: impl Iterator<Item = String>, known: &[&str]) -> BTreeSet<String> {
    keys.filter(|key| key.starts_with(ENV_PREFIX))
        .filter(|key| !known.contains(&key.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_prefixed_unknown_keys_are_flagged() {
        let known = ["ARCHIVE_WRITER_LOG", "ARCHIVE_WRITER_TOPICS"];
        let typo = format!("{ENV_PREFIX}TOPIC");
        let keys = vec![
            "ARCHIVE_WRITER_LOG".to_string(),
            typo.clone(),
            "HOME".to_string(),
            "AWS_REGION".to_string(),
        ];
        let unknown = unknown_env_keys(keys.into_iter(), &known);
        assert_eq!(unknown.into_iter().collect::<Vec<_>>(), vec![typo]);
    }

    #[test]
    fn generated_allowlist_covers_config_overrides() {
        let known = allowlist::GENERATED_ENV_ALLOWLIST;
        for key in ["ARCHIVE_WRITER_LEDGER_LOCATOR", "ARCHIVE_WRITER_PROFILE", "ARCHIVE_WRITER_LOG"] {
            assert!(known.contains(&key), "{key} missing from allowlist");
        }
    }
}
