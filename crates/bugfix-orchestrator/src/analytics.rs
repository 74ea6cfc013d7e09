//! Append-only analytics for ticket outcomes.
//!
//! One JSON line per terminal run, written to a `.jsonl` sink. Analytics are
//! best-effort: a write failure is logged and never blocks the pipeline.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::run::RunStatus;

/// Summary of one finished ticket run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketResultRecord {
    pub ticket_id: String,
    pub total_attempts: u32,
    pub final_status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    #[serde(default)]
    pub early_escalation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_passed: Option<bool>,
    pub recorded_at: DateTime<Utc>,
}

pub struct AnalyticsTracker {
    path: PathBuf,
}

impl AnalyticsTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one record. Never fails the caller.
    pub fn record(&self, record: &TicketResultRecord) {
        if let Err(e) = self.append(record) {
            warn!(
                ticket = %record.ticket_id,
                path = %self.path.display(),
                error = %e,
                "failed to write analytics record"
            );
        }
    }

    fn append(&self, record: &TicketResultRecord) -> anyhow::Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ticket_id: &str, status: RunStatus) -> TicketResultRecord {
        TicketResultRecord {
            ticket_id: ticket_id.to_string(),
            total_attempts: 2,
            final_status: status,
            confidence_score: Some(85),
            escalation_reason: None,
            early_escalation: false,
            test_passed: Some(true),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_records_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.jsonl");
        let tracker = AnalyticsTracker::new(&path);

        tracker.record(&record("BUG-1", RunStatus::Completed));
        tracker.record(&record("BUG-2", RunStatus::Escalated));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: TicketResultRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.ticket_id, "BUG-1");
        assert_eq!(first.final_status, RunStatus::Completed);

        let second: TicketResultRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.final_status, RunStatus::Escalated);
    }

    #[test]
    fn test_unwritable_sink_does_not_panic() {
        let tracker = AnalyticsTracker::new("/nonexistent-dir/analytics.jsonl");
        tracker.record(&record("BUG-1", RunStatus::Failed));
    }
}
