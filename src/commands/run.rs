use anyhow::Result;
use std::path::PathBuf;

use crate::archive::config::load_config;
use crate::archive::observability::HealthState;
use crate::archive::worker::{ArchiveWriterWorker, CycleOutcome};
use crate::commands::CommandReport;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub profile: Option<PathBuf>,
    pub once: bool,
    /// Stop after this many cycles; `None` runs until the process is killed.
    pub max_cycles: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

pub fn run(opts: &RunOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("run");

    if opts.once && opts.max_cycles.is_some() {
        report.issue("invalid flags: use only one of --once or --max-cycles");
        return Ok(report);
    }
    if opts.poll_interval_ms == Some(0) {
        report.issue("invalid --poll-interval-ms: must be >= 1");
        return Ok(report);
    }

    let mut cfg = load_config(opts.profile.as_deref())?;
    if let Some(ms) = opts.poll_interval_ms {
        cfg.poll.idle_sleep_ms = ms;
    }
    let mut worker = ArchiveWriterWorker::from_config(&cfg)?;
    tracing::info!(
        stream_id = %worker.ledger().stream_id(),
        ledger = %worker.ledger().backend_kind().redacted(),
        topics = %cfg.bus.topics.join(","),
        "archive writer started"
    );

    let mut last = CycleOutcome::default();
    let cycles = if opts.once {
        last = worker.run_once()?;
        1
    } else {
        match opts.max_cycles {
            Some(limit) => {
                let mut done = 0u64;
                worker.run_until(|outcome| {
                    done += 1;
                    last = outcome.clone();
                    done >= limit
                })?
            }
            None => {
                worker.run_forever()?;
                0
            }
        }
    };

    report.detail(format!("stream_id={}", worker.ledger().stream_id()));
    report.detail(format!("cycles={cycles}"));
    report.detail(format!("last_cycle.processed={}", last.processed));
    report.detail(format!("last_cycle.committed={}", last.committed));
    report.detail(format!(
        "last_cycle.blocked_partitions={}",
        last.blocked_partitions
    ));
    for (name, value) in worker.metrics().snapshot() {
        report.detail(format!("counters.{name}={value}"));
    }
    let reconciliation = worker.reconciliation().summary();
    report.detail(format!("reconciliation.seen_total={}", reconciliation.seen_total));
    report.detail(format!(
        "reconciliation.evidence_refs={}",
        reconciliation.evidence_refs.len()
    ));
    match worker.active_platform_run_id() {
        Some(run) => report.detail(format!("platform_run_id={run}")),
        None => report.detail("platform_run_id=none"),
    }

    let verdict = worker.metrics().health();
    match verdict.state {
        HealthState::Green => report.detail("health=GREEN"),
        HealthState::Red => {
            let reasons: Vec<&str> = verdict.reasons.iter().map(|r| r.as_str()).collect();
            report.issue(format!("health=RED reasons={}", reasons.join(",")));
        }
    }

    Ok(report)
}
