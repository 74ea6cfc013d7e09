//! The ticket lifecycle coordinator: intake filtering, per-ticket locking,
//! stage sequencing, the retry/escalation loop, and terminal disposition.
//!
//! One coordinator drives tickets sequentially; several coordinator
//! instances may run against the same tracker concurrently, serialized per
//! ticket by the lock manager. Stage faults are converted to data by the
//! stage runner and flow through the retry loop; only programming errors
//! (e.g. an illegal state transition) propagate out of [`drive`], where the
//! per-ticket catch-all turns them into a failed run without crashing the
//! polling loop.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::analytics::{AnalyticsTracker, TicketResultRecord};
use crate::config::OrchestratorConfig;
use crate::lock::LockManager;
use crate::run::{RetryRecord, RunRegistry, RunStatus, TicketRun};
use crate::stage::{
    run_stage, CommunicateInput, CommunicateOutput, ImplementInput, ImplementOutput, PlanInput,
    PlanOutput, RetryContext, Stage, StageOutcome, VerifyInput, VerifyOutput,
};
use crate::state_machine::RunState;
use crate::tracker::{Ticket, TicketStatus, TrackerClient};
use crate::validation::{aggregate, PatchValidator};

pub type DynStage<I, O> = Arc<dyn Stage<Input = I, Output = O>>;

/// The four pipeline stages, in execution order.
pub struct PipelineStages {
    pub plan: DynStage<PlanInput, PlanOutput>,
    pub implement: DynStage<ImplementInput, ImplementOutput>,
    pub verify: DynStage<VerifyInput, VerifyOutput>,
    pub communicate: DynStage<CommunicateInput, CommunicateOutput>,
}

pub struct Coordinator {
    config: OrchestratorConfig,
    tracker: Arc<dyn TrackerClient>,
    locks: LockManager,
    stages: PipelineStages,
    validator: Arc<dyn PatchValidator>,
    analytics: AnalyticsTracker,
    registry: RunRegistry,
}

impl Coordinator {
    pub fn new(
        config: OrchestratorConfig,
        tracker: Arc<dyn TrackerClient>,
        locks: LockManager,
        stages: PipelineStages,
        validator: Arc<dyn PatchValidator>,
        analytics: AnalyticsTracker,
    ) -> Self {
        Self {
            config,
            tracker,
            locks,
            stages,
            validator,
            analytics,
            registry: RunRegistry::default(),
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Discovery pass: ask the tracker for candidates and apply the intake
    /// filter. Tracker failures yield an empty batch so the polling loop
    /// keeps going.
    pub async fn fetch_eligible(&self) -> Vec<Ticket> {
        match self.tracker.fetch_eligible_tickets().await {
            Ok(tickets) => self.eligible_tickets(tickets),
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to fetch tickets from tracker");
                Vec::new()
            }
        }
    }

    /// Intake filter, applied before any lock attempt. Process-local checks
    /// come first so we never touch the lock store for tickets this instance
    /// already claimed or finished.
    pub fn eligible_tickets(&self, tickets: Vec<Ticket>) -> Vec<Ticket> {
        tickets
            .into_iter()
            .filter(|ticket| {
                if ticket.id.is_empty() {
                    warn!("skipping ticket with empty id");
                    false
                } else if self.registry.is_active(&ticket.id) {
                    debug!(ticket = %ticket.id, "already being processed, skipping");
                    false
                } else if self.registry.is_processed(&ticket.id) {
                    debug!(ticket = %ticket.id, "already processed, skipping");
                    false
                } else if self.locks.is_locked(&ticket.id) {
                    info!(ticket = %ticket.id, "locked by another instance, skipping");
                    false
                } else {
                    ticket.status == TicketStatus::ToDo
                }
            })
            .collect()
    }

    /// Process a single ticket end to end.
    ///
    /// The ticket lock is held from acquisition until the run reaches a
    /// terminal status and is released exactly once on every exit path.
    pub async fn process_ticket(&mut self, ticket: &Ticket) {
        let ticket_id = ticket.id.as_str();

        if self.registry.is_processed(ticket_id) || self.registry.is_active(ticket_id) {
            info!(ticket = ticket_id, "already claimed by this instance, skipping");
            return;
        }
        if !self.locks.try_acquire(ticket_id) {
            info!(ticket = ticket_id, "could not acquire lock, skipping");
            return;
        }

        // Lock held from here. Mark the at-most-once guards immediately so a
        // concurrent discovery pass cannot hand us the same ticket again.
        self.registry.mark_processed(ticket_id);
        self.registry.mark_active(ticket_id);
        let mut run = TicketRun::new(ticket_id);

        if let Err(e) = self.drive(ticket, &mut run).await {
            error!(ticket = ticket_id, error = %format!("{e:#}"), "ticket processing aborted abnormally");
            run.status = RunStatus::Failed;
            if run.escalation_reason.is_none() {
                run.escalation_reason = Some(format!("process error: {e:#}"));
            }
            let _ = run.states.fail(&format!("{e:#}"));

            let comment = format!("Automated bug fix process failed with error: {e:#}");
            self.update_tracker(ticket_id, TicketStatus::NeedsReview, &comment)
                .await;
        }

        if !self.locks.release(ticket_id) {
            warn!(ticket = ticket_id, "failed to release ticket lock");
        }

        self.analytics.record(&TicketResultRecord {
            ticket_id: ticket_id.to_string(),
            total_attempts: run.current_attempt,
            final_status: run.status,
            confidence_score: run.confidence_score,
            escalation_reason: run.escalation_reason.clone(),
            early_escalation: run.early_escalation,
            test_passed: run.test_passed,
            recorded_at: Utc::now(),
        });

        info!(
            ticket = ticket_id,
            status = %run.status,
            attempts = run.current_attempt,
            trace = %run.states.summary(),
            "ticket run finished"
        );
        self.registry.archive(run);
    }

    /// Everything between lock acquisition and lock release. Errors returned
    /// from here are abnormal aborts, handled by the caller.
    async fn drive(&mut self, ticket: &Ticket, run: &mut TicketRun) -> Result<()> {
        run.states.advance(RunState::Locked, None)?;
        info!(ticket = %ticket.id, title = %ticket.title, "starting ticket processing");

        if ticket.status != TicketStatus::InProgress {
            self.update_tracker(
                &ticket.id,
                TicketStatus::InProgress,
                "Automated bug fix started. Agent workflow initiated.",
            )
            .await;
        }

        run.states.advance(RunState::Planning, None)?;
        let plan_input = PlanInput {
            ticket_id: ticket.id.clone(),
            title: ticket.title.clone(),
            description: ticket.description.clone(),
        };
        let plan = match run_stage(self.stages.plan.as_ref(), plan_input).await {
            StageOutcome::Completed(plan) => plan,
            StageOutcome::Failed { error } => anyhow::bail!(error),
        };

        self.retry_loop(ticket, run, plan).await
    }

    /// The implement → verify loop, bounded by `max_retries`.
    async fn retry_loop(
        &mut self,
        ticket: &Ticket,
        run: &mut TicketRun,
        plan: PlanOutput,
    ) -> Result<()> {
        let max = self.config.max_retries;
        let mut attempt: u32 = 1;

        loop {
            run.current_attempt = attempt;
            run.states.set_attempt(attempt);
            info!(ticket = %ticket.id, attempt, max, "starting implementation attempt");

            run.states.advance(RunState::Implementing, None)?;
            let implement_input = ImplementInput {
                ticket_id: ticket.id.clone(),
                plan: plan.plan.clone(),
                attempt,
                max_attempts: max,
                context: RetryContext {
                    previous_attempts: run.retry_history.clone(),
                },
            };

            let (record, verification) =
                match run_stage(self.stages.implement.as_ref(), implement_input).await {
                    StageOutcome::Failed { error } => (
                        RetryRecord {
                            attempt,
                            error: Some(error),
                            ..Default::default()
                        },
                        None,
                    ),
                    StageOutcome::Completed(output) => {
                        let confidence = self.score_attempt(&ticket.id, &output);
                        run.confidence_score = confidence;
                        self.verify_attempt(ticket, run, &output, confidence).await?
                    }
                };

            run.retry_history.push(record.clone());

            match verification {
                Some(outcome) if outcome.passed => {
                    info!(ticket = %ticket.id, attempt, "verification passed");
                    run.retry_history.clear();
                    run.test_passed = Some(true);
                    run.states
                        .advance(RunState::Finalizing, Some("verification passed"))?;
                    self.finalize_success(ticket, run, attempt).await?;
                    return Ok(());
                }
                Some(outcome) => {
                    warn!(
                        ticket = %ticket.id,
                        attempt,
                        summary = outcome.failure_summary.as_deref().unwrap_or("none"),
                        "verification failed"
                    );
                    run.test_passed = Some(false);

                    // Early escalation: a low-confidence miss on the very
                    // first attempt is not worth burning retries on. Later
                    // attempts carry diagnostic history, so the rule never
                    // fires again.
                    let confidence = run.confidence_score;
                    if attempt == 1
                        && confidence
                            .is_some_and(|score| score < self.config.low_confidence_threshold)
                    {
                        let reason = format!(
                            "Low confidence score ({}%) on first attempt",
                            confidence.unwrap_or(0)
                        );
                        run.states
                            .advance(RunState::Finalizing, Some("early escalation"))?;
                        self.escalate(ticket, run, attempt, outcome.failure_summary, true, reason)
                            .await?;
                        return Ok(());
                    }

                    if attempt >= max {
                        let reason = format!("Maximum retries ({max}) reached");
                        run.states
                            .advance(RunState::Finalizing, Some("retries exhausted"))?;
                        self.escalate(ticket, run, attempt, outcome.failure_summary, false, reason)
                            .await?;
                        return Ok(());
                    }

                    let summary = outcome.failure_summary.as_deref().unwrap_or("unknown failure");
                    let comment = format!(
                        "Attempt {attempt}/{max} failed with errors: {summary}. Retrying with improved fix..."
                    );
                    self.update_tracker(&ticket.id, TicketStatus::InProgress, &comment)
                        .await;
                }
                None => {
                    // A stage raised instead of producing a verdict. The
                    // fault is already in the retry record; retry it like a
                    // verification failure, escalate when out of budget.
                    let fault = record
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown stage fault".to_string());
                    error!(ticket = %ticket.id, attempt, error = %fault, "attempt aborted by stage fault");

                    if attempt >= max {
                        let reason =
                            format!("Stage fault after {attempt} attempt(s): {fault}");
                        run.states
                            .advance(RunState::Finalizing, Some("fault budget exhausted"))?;
                        self.escalate(ticket, run, attempt, Some(fault), false, reason)
                            .await?;
                        return Ok(());
                    }
                }
            }

            debug!(
                ticket = %ticket.id,
                delay_secs = self.config.retry_delay.as_secs(),
                "waiting before next retry"
            );
            tokio::time::sleep(self.config.retry_delay).await;
            attempt += 1;
        }
    }

    /// Confidence for this attempt: the implementer's own score, adjusted by
    /// patch validation when the stage emitted discrete patches. A missing
    /// implementer score counts as 0 for the adjustment base.
    fn score_attempt(&self, ticket_id: &str, output: &ImplementOutput) -> Option<i32> {
        if let Some(score) = output.confidence_score {
            info!(ticket = ticket_id, score, "implementer confidence");
        }
        if output.patches.is_empty() {
            return output.confidence_score;
        }

        let verdicts: Vec<_> = output
            .patches
            .iter()
            .map(|patch| self.validator.validate(patch))
            .collect();
        let summary = aggregate(output.confidence_score.unwrap_or(0), &verdicts);
        if summary.patch_valid {
            debug!(
                ticket = ticket_id,
                accepted = summary.accepted,
                confidence = summary.confidence_score,
                "all candidate patches valid"
            );
        } else {
            warn!(
                ticket = ticket_id,
                rejected = summary.rejected,
                accepted = summary.accepted,
                reason = summary.rejection_reason.as_deref().unwrap_or("unknown"),
                confidence = summary.confidence_score,
                "patch validation rejected candidate patches"
            );
        }
        Some(summary.confidence_score)
    }

    /// Run the verify stage and build this attempt's retry record.
    async fn verify_attempt(
        &mut self,
        ticket: &Ticket,
        run: &mut TicketRun,
        output: &ImplementOutput,
        confidence: Option<i32>,
    ) -> Result<(RetryRecord, Option<VerifyOutput>)> {
        let attempt = run.current_attempt;
        run.states.advance(RunState::Verifying, None)?;

        let verify_input = VerifyInput {
            ticket_id: ticket.id.clone(),
            test_command: self.config.test_command.clone(),
        };
        let record = match run_stage(self.stages.verify.as_ref(), verify_input).await {
            StageOutcome::Completed(outcome) => (
                RetryRecord {
                    attempt,
                    patch_content: primary_patch(output),
                    verification: Some(outcome.clone()),
                    confidence_score: confidence,
                    error: None,
                },
                Some(outcome),
            ),
            StageOutcome::Failed { error } => (
                RetryRecord {
                    attempt,
                    patch_content: primary_patch(output),
                    verification: None,
                    confidence_score: confidence,
                    error: Some(error),
                },
                None,
            ),
        };
        Ok(record)
    }

    /// Verified fix: run the communicate stage with success context and
    /// complete the run. A failing communicate stage routes the ticket to
    /// human review — the fix exists even if nobody was told about it.
    async fn finalize_success(
        &self,
        ticket: &Ticket,
        run: &mut TicketRun,
        attempt: u32,
    ) -> Result<()> {
        info!(ticket = %ticket.id, "running communicate stage for verified fix");

        let input = CommunicateInput {
            ticket_id: ticket.id.clone(),
            test_passed: true,
            pull_request_url: None,
            retry_count: attempt,
            max_retries: self.config.max_retries,
            confidence_score: run.confidence_score,
            escalated: false,
            early_escalation: false,
            escalation_reason: None,
            failure_summary: None,
        };
        match run_stage(self.stages.communicate.as_ref(), input).await {
            StageOutcome::Completed(output) => {
                if !output.communications_success {
                    warn!(ticket = %ticket.id, "communicate stage reported failure");
                }
                run.pull_request_url = output.pull_request_url;
            }
            StageOutcome::Failed { error } => {
                warn!(ticket = %ticket.id, error = %error, "communicate stage faulted after verified fix");
                let comment =
                    format!("Fix was verified but follow-up communication failed: {error}");
                self.update_tracker(&ticket.id, TicketStatus::NeedsReview, &comment)
                    .await;
            }
        }

        run.states.advance(RunState::Completed, None)?;
        run.status = RunStatus::Completed;
        info!(ticket = %ticket.id, attempt, "ticket completed");
        Ok(())
    }

    /// Route the ticket to human review, with the communicate stage first and
    /// a bare tracker update as the fallback when it fails.
    async fn escalate(
        &self,
        ticket: &Ticket,
        run: &mut TicketRun,
        attempt: u32,
        failure_summary: Option<String>,
        early: bool,
        reason: String,
    ) -> Result<()> {
        warn!(
            ticket = %ticket.id,
            attempt,
            early,
            %reason,
            "escalating ticket for human review"
        );
        run.escalated = true;
        run.early_escalation = early;
        run.escalation_reason = Some(reason.clone());

        let input = CommunicateInput {
            ticket_id: ticket.id.clone(),
            test_passed: false,
            pull_request_url: None,
            retry_count: attempt,
            max_retries: self.config.max_retries,
            confidence_score: run.confidence_score,
            escalated: true,
            early_escalation: early,
            escalation_reason: Some(reason.clone()),
            failure_summary: failure_summary.clone(),
        };
        match run_stage(self.stages.communicate.as_ref(), input).await {
            StageOutcome::Completed(output) => {
                if !output.communications_success {
                    warn!(ticket = %ticket.id, "communicate stage reported failure during escalation");
                }
                let details = failure_summary.as_deref().unwrap_or(reason.as_str());
                let comment = format!(
                    "Automated fix was unsuccessful after {attempt} attempt(s). Human review needed. Details: {details}"
                );
                self.update_tracker(&ticket.id, TicketStatus::NeedsReview, &comment)
                    .await;
            }
            StageOutcome::Failed { error } => {
                error!(ticket = %ticket.id, error = %error, "communicate stage faulted during escalation");
                // Best-effort fallback: the tracker still moves to review
                // with a generic note even when the richer summary failed.
                let comment = format!(
                    "Automated fix was unsuccessful after {attempt} attempt(s). Human review needed."
                );
                self.update_tracker(&ticket.id, TicketStatus::NeedsReview, &comment)
                    .await;
            }
        }

        run.states.advance(RunState::Escalated, Some(reason.as_str()))?;
        run.status = RunStatus::Escalated;
        Ok(())
    }

    /// Tracker updates are advisory: failures are logged and never block the
    /// local pipeline decision.
    async fn update_tracker(&self, ticket_id: &str, status: TicketStatus, comment: &str) {
        match self.tracker.update_ticket(ticket_id, status, comment).await {
            Ok(true) => {}
            Ok(false) => warn!(ticket = ticket_id, %status, "tracker rejected update"),
            Err(e) => {
                error!(ticket = ticket_id, %status, error = %format!("{e:#}"), "tracker update failed")
            }
        }
    }
}

/// The patch carried in retry records: the opaque payload when present,
/// otherwise the concatenation of the discrete patches.
fn primary_patch(output: &ImplementOutput) -> Option<String> {
    if let Some(content) = &output.patch_content {
        return Some(content.clone());
    }
    if output.patches.is_empty() {
        None
    } else {
        Some(output.patches.join("\n"))
    }
}
