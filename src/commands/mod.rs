pub mod run;
pub mod status;
pub mod verify;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn merge(&mut self, mut other: CommandReport) {
        self.ok &= other.ok;
        self.details.append(&mut other.details);
        self.issues.append(&mut other.issues);
    }
}

#[cfg(test)]
mod tests {
    use super::CommandReport;

    #[test]
    fn merge_keeps_failures_sticky() {
        let mut report = CommandReport::new("verify");
        report.detail("config: ok");

        let mut status = CommandReport::new("status");
        status.issue("ledger unreachable");
        report.merge(status);

        assert!(!report.ok);
        assert_eq!(report.details, vec!["config: ok"]);
        assert_eq!(report.issues, vec!["ledger unreachable"]);
    }
}
