use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Lifecycle status of a ticket in the external tracker.
///
/// The coordinator only ever requests three transitions: `InProgress` on
/// start and on each retry, `NeedsReview` on escalation or abnormal failure,
/// and `Done` when the communicate stage closes out a verified fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    ToDo,
    InProgress,
    NeedsReview,
    Done,
}

impl TicketStatus {
    /// Wire name used by the tracker CLI (`--status=` argument).
    pub fn slug(self) -> &'static str {
        match self {
            Self::ToDo => "to_do",
            Self::InProgress => "in_progress",
            Self::NeedsReview => "needs_review",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToDo => write!(f, "To Do"),
            Self::InProgress => write!(f, "In Progress"),
            Self::NeedsReview => write!(f, "Needs Review"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// A work item owned by the external tracker. The coordinator reads it and
/// requests status transitions; it never mutates tracker state directly.
#[derive(Debug, Clone, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TicketStatus,
}

/// Client contract for the external issue tracker.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Fetch the current batch of candidate tickets. The coordinator applies
    /// its own intake filter on top of whatever this returns.
    async fn fetch_eligible_tickets(&self) -> Result<Vec<Ticket>>;

    /// Request a status transition with a human-readable comment. Returns
    /// `Ok(false)` when the tracker rejected the update.
    async fn update_ticket(&self, id: &str, status: TicketStatus, comment: &str) -> Result<bool>;
}

/// Bridge to a tracker CLI binary speaking JSON on stdout.
///
/// The tracker service is binary-only from our side, so we shell out:
/// `<bin> list --status=to_do --json` and `<bin> update <id> --status=...
/// --comment=...`.
pub struct CliTracker {
    bin: String,
}

impl CliTracker {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl TrackerClient for CliTracker {
    async fn fetch_eligible_tickets(&self) -> Result<Vec<Ticket>> {
        let output = tokio::process::Command::new(&self.bin)
            .args(["list", "--status=to_do", "--json"])
            .output()
            .await
            .with_context(|| format!("failed to run `{} list`. Is the tracker CLI installed?", self.bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} list failed: {}", self.bin, stderr.trim());
        }

        let tickets: Vec<Ticket> = serde_json::from_slice(&output.stdout)
            .context("failed to parse tracker list output")?;

        Ok(tickets)
    }

    async fn update_ticket(&self, id: &str, status: TicketStatus, comment: &str) -> Result<bool> {
        let output = tokio::process::Command::new(&self.bin)
            .args([
                "update",
                id,
                &format!("--status={}", status.slug()),
                &format!("--comment={comment}"),
            ])
            .output()
            .await
            .with_context(|| format!("failed to run `{} update`", self.bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(ticket = id, %status, stderr = %stderr.trim(), "tracker rejected update");
            return Ok(false);
        }

        Ok(true)
    }
}
