//! Ticket run state machine — explicit states and legal transition guards.
//!
//! Gives the retry/escalation loop a typed state model so that every
//! transition is auditable and logged, and an out-of-order transition is a
//! loud error instead of silent bookkeeping drift. The transition log doubles
//! as a per-run trace for diagnostics.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The set of states a ticket run moves through.
///
/// Every run starts at `Intake` and terminates at `Completed`, `Escalated`,
/// or `Failed`. All states past `Locked` hold the ticket lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Eligibility filtering, before any lock attempt.
    Intake,
    /// Lock acquired; tracker is being moved to In Progress.
    Locked,
    /// Running the plan stage.
    Planning,
    /// Running the implement stage for the current attempt.
    Implementing,
    /// Running the verify stage for the current attempt.
    Verifying,
    /// Terminal disposition in progress: communicate stage + tracker update.
    Finalizing,
    /// Fix verified and communicated — terminal.
    Completed,
    /// Routed to human review — terminal.
    Escalated,
    /// Aborted abnormally — terminal.
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Escalated | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intake => write!(f, "Intake"),
            Self::Locked => write!(f, "Locked"),
            Self::Planning => write!(f, "Planning"),
            Self::Implementing => write!(f, "Implementing"),
            Self::Verifying => write!(f, "Verifying"),
            Self::Finalizing => write!(f, "Finalizing"),
            Self::Completed => write!(f, "Completed"),
            Self::Escalated => write!(f, "Escalated"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Legal transitions between run states.
///
/// ```text
/// Intake → Locked
/// Locked → Planning
/// Planning → Implementing
/// Implementing → Verifying | Implementing | Finalizing
/// Verifying → Implementing | Finalizing
/// Finalizing → Completed | Escalated
/// any non-terminal → Failed
/// ```
///
/// The `Implementing → Implementing` self-edge covers retrying after an
/// implement-stage fault (verification never ran, so there is no `Verifying`
/// state to come back from). `Implementing → Finalizing` covers escalating
/// when the fault budget is exhausted.
fn is_legal_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;

    // Any non-terminal state may abort to Failed.
    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Intake, Locked)
            | (Locked, Planning)
            | (Planning, Implementing)
            | (Implementing, Verifying)
            | (Implementing, Implementing)
            | (Implementing, Finalizing)
            // After verifying: fail → retry; pass or escalation → finalize
            | (Verifying, Implementing)
            | (Verifying, Finalizing)
            | (Finalizing, Completed)
            | (Finalizing, Escalated)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RunState,
    pub to: RunState,
    /// Attempt number at the time of transition (0 for pre-loop states).
    pub attempt: u32,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, Error)]
#[error("illegal run state transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: RunState,
    pub to: RunState,
}

/// Tracks the current state, enforces legal transitions, and keeps a full
/// transition log for the run.
#[derive(Debug)]
pub struct StateMachine {
    current: RunState,
    attempt: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    /// Create a new state machine starting at `Intake`.
    pub fn new() -> Self {
        Self {
            current: RunState::Intake,
            attempt: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Set the attempt counter (called by the retry loop).
    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Attempt to advance to the next state.
    pub fn advance(&mut self, to: RunState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            attempt: self.attempt,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(
            from = %self.current,
            to = %to,
            attempt = self.attempt,
            "run state transition"
        );

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Abort to `Failed` — always legal from non-terminal states.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(RunState::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// One-line summary of the run's state history.
    pub fn summary(&self) -> String {
        let states: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut summary = format!(
            "{} → {} ({}ms, {} transitions)",
            RunState::Intake,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !states.is_empty() {
            summary.push_str(&format!(" [{}]", states.join(" → ")));
        }
        summary
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
