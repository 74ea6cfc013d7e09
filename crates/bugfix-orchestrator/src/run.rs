//! In-memory bookkeeping for tickets this instance is working on.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::VerifyOutput;
use crate::state_machine::StateMachine;

/// Diagnostic snapshot of one attempt: the candidate patch, how verification
/// went, the confidence at that point, and the fault message if the attempt
/// aborted abnormally. Fed back to the implement stage on later attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerifyOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal-or-not status of a ticket run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Processing,
    Completed,
    Escalated,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Escalated => write!(f, "escalated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Everything the coordinator tracks about one ticket while it holds the
/// lock. Created on intake, archived at a terminal status. The lock protocol
/// guarantees at most one live run per ticket id.
#[derive(Debug)]
pub struct TicketRun {
    pub ticket_id: String,
    pub current_attempt: u32,
    pub retry_history: Vec<RetryRecord>,
    pub escalated: bool,
    pub early_escalation: bool,
    pub escalation_reason: Option<String>,
    pub confidence_score: Option<i32>,
    pub pull_request_url: Option<String>,
    pub test_passed: Option<bool>,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub states: StateMachine,
}

impl TicketRun {
    pub fn new(ticket_id: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            current_attempt: 0,
            retry_history: Vec::new(),
            escalated: false,
            early_escalation: false,
            escalation_reason: None,
            confidence_score: None,
            pull_request_url: None,
            test_passed: None,
            started_at: Utc::now(),
            status: RunStatus::Processing,
            states: StateMachine::new(),
        }
    }
}

/// Process-local active/processed bookkeeping, owned by the coordinator.
///
/// Plain collections are sufficient because the coordinator drives tickets
/// from a single sequential loop. Parallelizing ticket processing would
/// require putting these behind a mutex (or sharding by ticket id).
#[derive(Debug, Default)]
pub struct RunRegistry {
    active: HashSet<String>,
    processed: HashSet<String>,
    archived: Vec<TicketRun>,
}

impl RunRegistry {
    pub fn is_active(&self, ticket_id: &str) -> bool {
        self.active.contains(ticket_id)
    }

    /// At-most-once guard within this process: once a ticket id lands here it
    /// is filtered out of every later discovery pass.
    pub fn is_processed(&self, ticket_id: &str) -> bool {
        self.processed.contains(ticket_id)
    }

    pub fn mark_active(&mut self, ticket_id: &str) {
        self.active.insert(ticket_id.to_string());
    }

    pub fn mark_processed(&mut self, ticket_id: &str) {
        self.processed.insert(ticket_id.to_string());
    }

    /// Retire a finished run: drops the active claim and keeps the run for
    /// diagnostics.
    pub fn archive(&mut self, run: TicketRun) {
        self.active.remove(&run.ticket_id);
        self.archived.push(run);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn archived(&self) -> &[TicketRun] {
        &self.archived
    }
}
