//! End-to-end coordinator tests with scripted stage fakes.
//!
//! Time is paused (`start_paused`) so retry delays elapse instantly. The lock
//! store and analytics sink are real files in a temp directory, so these
//! tests also cover the cross-process lease protocol end to end.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;

use bugfix_orchestrator::analytics::{AnalyticsTracker, TicketResultRecord};
use bugfix_orchestrator::lock::{FsLeaseStore, Lease, LockManager};
use bugfix_orchestrator::run::RunStatus;
use bugfix_orchestrator::stage::{
    CommunicateInput, CommunicateOutput, ImplementInput, ImplementOutput, PlanInput, PlanOutput,
    Stage, VerifyInput, VerifyOutput,
};
use bugfix_orchestrator::tracker::{Ticket, TicketStatus, TrackerClient};
use bugfix_orchestrator::validation::HeuristicValidator;
use bugfix_orchestrator::{Coordinator, OrchestratorConfig, PipelineStages};

// ---------------------------------------------------------------------------
// Scripted fakes
// ---------------------------------------------------------------------------

struct FakePlan {
    fail: bool,
}

#[async_trait]
impl Stage for FakePlan {
    type Input = PlanInput;
    type Output = PlanOutput;

    fn name(&self) -> &'static str {
        "plan"
    }

    async fn run(&self, _input: PlanInput) -> Result<PlanOutput> {
        if self.fail {
            anyhow::bail!("planning model unavailable");
        }
        Ok(serde_json::from_value(serde_json::json!({
            "approach": "guard nil cart before total",
            "files": ["cart.js"],
        }))
        .unwrap())
    }
}

#[derive(Clone)]
enum ImplementScript {
    Output(ImplementOutput),
    Fault(&'static str),
}

#[derive(Default)]
struct FakeImplement {
    script: Mutex<VecDeque<ImplementScript>>,
    calls: Mutex<Vec<ImplementInput>>,
}

impl FakeImplement {
    fn scripted(steps: Vec<ImplementScript>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<ImplementInput> {
        self.calls.lock().unwrap().clone()
    }
}

fn patch_with_confidence(confidence: i32) -> ImplementScript {
    ImplementScript::Output(ImplementOutput {
        patch_content: Some("--- a/cart.js\n+++ b/cart.js\n".into()),
        patches: vec![],
        confidence_score: Some(confidence),
    })
}

#[async_trait]
impl Stage for FakeImplement {
    type Input = ImplementInput;
    type Output = ImplementOutput;

    fn name(&self) -> &'static str {
        "implement"
    }

    async fn run(&self, input: ImplementInput) -> Result<ImplementOutput> {
        self.calls.lock().unwrap().push(input);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| patch_with_confidence(90));
        match step {
            ImplementScript::Output(output) => Ok(output),
            ImplementScript::Fault(msg) => anyhow::bail!(msg),
        }
    }
}

#[derive(Default)]
struct FakeVerify {
    fault: bool,
    script: Mutex<VecDeque<VerifyOutput>>,
}

impl FakeVerify {
    fn scripted(outcomes: Vec<VerifyOutput>) -> Self {
        Self {
            fault: false,
            script: Mutex::new(outcomes.into()),
        }
    }

    fn faulting() -> Self {
        Self {
            fault: true,
            ..Default::default()
        }
    }
}

fn verify_pass() -> VerifyOutput {
    VerifyOutput {
        passed: true,
        failure_summary: None,
    }
}

fn verify_fail(summary: &str) -> VerifyOutput {
    VerifyOutput {
        passed: false,
        failure_summary: Some(summary.to_string()),
    }
}

#[async_trait]
impl Stage for FakeVerify {
    type Input = VerifyInput;
    type Output = VerifyOutput;

    fn name(&self) -> &'static str {
        "verify"
    }

    async fn run(&self, _input: VerifyInput) -> Result<VerifyOutput> {
        if self.fault {
            anyhow::bail!("test runner crashed");
        }
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(verify_pass))
    }
}

#[derive(Default)]
struct FakeCommunicate {
    fault: bool,
    calls: Mutex<Vec<CommunicateInput>>,
}

impl FakeCommunicate {
    fn calls(&self) -> Vec<CommunicateInput> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Stage for FakeCommunicate {
    type Input = CommunicateInput;
    type Output = CommunicateOutput;

    fn name(&self) -> &'static str {
        "communicate"
    }

    async fn run(&self, input: CommunicateInput) -> Result<CommunicateOutput> {
        let success = input.test_passed;
        self.calls.lock().unwrap().push(input);
        if self.fault {
            anyhow::bail!("notification service down");
        }
        Ok(CommunicateOutput {
            communications_success: true,
            pull_request_url: success.then(|| "https://example.com/pulls/7".to_string()),
        })
    }
}

#[derive(Default)]
struct FakeTracker {
    tickets: Mutex<Vec<Ticket>>,
    updates: Mutex<Vec<(String, TicketStatus, String)>>,
}

impl FakeTracker {
    fn updates(&self) -> Vec<(String, TicketStatus, String)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrackerClient for FakeTracker {
    async fn fetch_eligible_tickets(&self) -> Result<Vec<Ticket>> {
        Ok(self.tickets.lock().unwrap().clone())
    }

    async fn update_ticket(&self, id: &str, status: TicketStatus, comment: &str) -> Result<bool> {
        self.updates
            .lock()
            .unwrap()
            .push((id.to_string(), status, comment.to_string()));
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    coordinator: Coordinator,
    tracker: Arc<FakeTracker>,
    implement: Arc<FakeImplement>,
    communicate: Arc<FakeCommunicate>,
    lock_dir: std::path::PathBuf,
    analytics_path: std::path::PathBuf,
    _tempdir: tempfile::TempDir,
}

fn test_config(lock_dir: &std::path::Path, analytics_path: &std::path::Path) -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_secs(60),
        max_retries: 4,
        retry_delay: Duration::from_secs(5),
        low_confidence_threshold: 60,
        lock_dir: lock_dir.to_string_lossy().into_owned(),
        lock_staleness: Duration::from_secs(3600),
        test_command: "npm test".into(),
        analytics_path: analytics_path.to_string_lossy().into_owned(),
        owner: "orchestrator-test".into(),
        tracker_bin: "bugtracker".into(),
        plan_command: "bugfix-plan".into(),
        implement_command: "bugfix-implement".into(),
        verify_command: "bugfix-verify".into(),
        communicate_command: "bugfix-communicate".into(),
    }
}

fn harness(
    plan: FakePlan,
    implement: FakeImplement,
    verify: FakeVerify,
    communicate: FakeCommunicate,
) -> Harness {
    let tempdir = tempfile::tempdir().unwrap();
    let lock_dir = tempdir.path().join("locks");
    let analytics_path = tempdir.path().join("analytics.jsonl");
    let config = test_config(&lock_dir, &analytics_path);

    let tracker = Arc::new(FakeTracker::default());
    let implement = Arc::new(implement);
    let communicate = Arc::new(communicate);

    let locks = LockManager::new(
        Box::new(FsLeaseStore::new(&lock_dir).unwrap()),
        config.owner.clone(),
        config.lock_staleness,
    );
    let stages = PipelineStages {
        plan: Arc::new(plan),
        implement: implement.clone(),
        verify: Arc::new(verify),
        communicate: communicate.clone(),
    };
    let analytics = AnalyticsTracker::new(&analytics_path);

    let coordinator = Coordinator::new(
        config,
        tracker.clone(),
        locks,
        stages,
        Arc::new(HeuristicValidator),
        analytics,
    );

    Harness {
        coordinator,
        tracker,
        implement,
        communicate,
        lock_dir,
        analytics_path,
        _tempdir: tempdir,
    }
}

fn ticket(id: &str) -> Ticket {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "title": "Cart total is wrong for empty carts",
        "description": "Checkout crashes when the cart is empty.",
        "status": "to_do",
    }))
    .unwrap()
}

fn analytics_records(path: &std::path::Path) -> Vec<TicketResultRecord> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn first_attempt_success_completes_the_run() {
    let mut h = harness(
        FakePlan { fail: false },
        FakeImplement::scripted(vec![patch_with_confidence(90)]),
        FakeVerify::scripted(vec![verify_pass()]),
        FakeCommunicate::default(),
    );

    h.coordinator.process_ticket(&ticket("BUG-1")).await;

    let runs = h.coordinator.registry().archived();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].current_attempt, 1);
    assert_eq!(runs[0].test_passed, Some(true));
    assert!(runs[0].retry_history.is_empty());
    assert_eq!(
        runs[0].pull_request_url.as_deref(),
        Some("https://example.com/pulls/7")
    );

    // Exactly one communicate call, with success context.
    let comms = h.communicate.calls();
    assert_eq!(comms.len(), 1);
    assert!(comms[0].test_passed);
    assert!(!comms[0].escalated);
    assert_eq!(comms[0].retry_count, 1);
    assert_eq!(comms[0].confidence_score, Some(90));

    // Tracker saw the initial In Progress transition.
    let updates = h.tracker.updates();
    assert_eq!(updates[0].1, TicketStatus::InProgress);
    assert!(updates[0].2.contains("Automated bug fix started"));

    // One analytics line, lock file gone.
    let records = analytics_records(&h.analytics_path);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].final_status, RunStatus::Completed);
    assert_eq!(records[0].total_attempts, 1);
    assert!(!h.lock_dir.join("BUG-1.lock").exists());
}

#[tokio::test(start_paused = true)]
async fn low_confidence_first_attempt_escalates_immediately() {
    let mut h = harness(
        FakePlan { fail: false },
        FakeImplement::scripted(vec![patch_with_confidence(50)]),
        FakeVerify::scripted(vec![verify_fail("2 tests failing in cart.spec.js")]),
        FakeCommunicate::default(),
    );

    h.coordinator.process_ticket(&ticket("BUG-2")).await;

    let runs = h.coordinator.registry().archived();
    assert_eq!(runs[0].status, RunStatus::Escalated);
    assert_eq!(runs[0].current_attempt, 1);
    assert!(runs[0].early_escalation);
    assert_eq!(
        runs[0].escalation_reason.as_deref(),
        Some("Low confidence score (50%) on first attempt")
    );

    // Only one implement attempt was made.
    assert_eq!(h.implement.calls().len(), 1);

    let comms = h.communicate.calls();
    assert_eq!(comms.len(), 1);
    assert!(comms[0].escalated);
    assert!(comms[0].early_escalation);
    assert_eq!(
        comms[0].failure_summary.as_deref(),
        Some("2 tests failing in cart.spec.js")
    );

    // Ticket routed to review.
    let updates = h.tracker.updates();
    let last = updates.last().unwrap();
    assert_eq!(last.1, TicketStatus::NeedsReview);
    assert!(last.2.contains("Human review needed"));

    let records = analytics_records(&h.analytics_path);
    assert_eq!(records[0].final_status, RunStatus::Escalated);
    assert!(records[0].early_escalation);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_escalate_with_full_history() {
    let mut h = harness(
        FakePlan { fail: false },
        FakeImplement::scripted(vec![
            patch_with_confidence(80),
            patch_with_confidence(80),
            patch_with_confidence(80),
            patch_with_confidence(80),
        ]),
        FakeVerify::scripted(vec![
            verify_fail("assertion failed: total == 0"),
            verify_fail("assertion failed: total == 0"),
            verify_fail("assertion failed: total == 0"),
            verify_fail("assertion failed: total == 0"),
        ]),
        FakeCommunicate::default(),
    );

    h.coordinator.process_ticket(&ticket("BUG-3")).await;

    let runs = h.coordinator.registry().archived();
    assert_eq!(runs[0].status, RunStatus::Escalated);
    assert_eq!(runs[0].current_attempt, 4);
    assert!(!runs[0].early_escalation);
    assert_eq!(
        runs[0].escalation_reason.as_deref(),
        Some("Maximum retries (4) reached")
    );
    assert_eq!(runs[0].retry_history.len(), 4);

    // Each later attempt saw all the prior attempts.
    let calls = h.implement.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0].context.previous_attempts.len(), 0);
    assert_eq!(calls[3].context.previous_attempts.len(), 3);
    assert_eq!(calls[3].attempt, 4);

    // Retry comments went to the tracker between attempts.
    let updates = h.tracker.updates();
    assert!(updates.iter().any(|(_, status, comment)| {
        *status == TicketStatus::InProgress
            && comment.contains("Attempt 1/4 failed with errors")
            && comment.contains("Retrying with improved fix")
    }));
    assert_eq!(updates.last().unwrap().1, TicketStatus::NeedsReview);
}

#[tokio::test(start_paused = true)]
async fn implement_faults_burn_the_retry_budget_then_escalate() {
    let mut h = harness(
        FakePlan { fail: false },
        FakeImplement::scripted(vec![
            ImplementScript::Fault("model timeout"),
            ImplementScript::Fault("model timeout"),
            ImplementScript::Fault("model timeout"),
            ImplementScript::Fault("model timeout"),
        ]),
        FakeVerify::default(),
        FakeCommunicate::default(),
    );

    h.coordinator.process_ticket(&ticket("BUG-4")).await;

    let runs = h.coordinator.registry().archived();
    assert_eq!(runs[0].status, RunStatus::Escalated);
    assert_eq!(runs[0].current_attempt, 4);
    assert_eq!(runs[0].retry_history.len(), 4);
    assert!(runs[0]
        .retry_history
        .iter()
        .all(|record| record.error.as_deref().is_some_and(|e| e.contains("model timeout"))));
    assert!(runs[0]
        .escalation_reason
        .as_deref()
        .unwrap()
        .contains("Stage fault after 4 attempt(s)"));
    // Verification never ran.
    assert_eq!(runs[0].test_passed, None);
}

#[tokio::test(start_paused = true)]
async fn plan_failure_aborts_the_run_and_releases_the_lock() {
    let mut h = harness(
        FakePlan { fail: true },
        FakeImplement::default(),
        FakeVerify::default(),
        FakeCommunicate::default(),
    );

    h.coordinator.process_ticket(&ticket("BUG-5")).await;

    let runs = h.coordinator.registry().archived();
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(h.implement.calls().is_empty());

    let updates = h.tracker.updates();
    let last = updates.last().unwrap();
    assert_eq!(last.1, TicketStatus::NeedsReview);
    assert!(last.2.contains("Automated bug fix process failed with error"));
    assert!(last.2.contains("planning model unavailable"));

    let records = analytics_records(&h.analytics_path);
    assert_eq!(records[0].final_status, RunStatus::Failed);
    assert!(!h.lock_dir.join("BUG-5.lock").exists());
}

#[tokio::test(start_paused = true)]
async fn rejected_patches_drag_confidence_into_early_escalation() {
    let implement = FakeImplement::scripted(vec![ImplementScript::Output(ImplementOutput {
        patch_content: None,
        patches: vec!["// TODO: implement the null guard".into()],
        confidence_score: Some(50),
    })]);
    let mut h = harness(
        FakePlan { fail: false },
        implement,
        FakeVerify::scripted(vec![verify_fail("still crashes")]),
        FakeCommunicate::default(),
    );

    h.coordinator.process_ticket(&ticket("BUG-6")).await;

    let runs = h.coordinator.registry().archived();
    assert_eq!(runs[0].status, RunStatus::Escalated);
    assert!(runs[0].early_escalation);
    // 50 base, -15 for the placeholder marker.
    assert_eq!(runs[0].confidence_score, Some(35));
    assert_eq!(
        runs[0].escalation_reason.as_deref(),
        Some("Low confidence score (35%) on first attempt")
    );
}

#[tokio::test(start_paused = true)]
async fn communicate_fault_during_escalation_falls_back_to_tracker() {
    let mut h = harness(
        FakePlan { fail: false },
        FakeImplement::scripted(vec![
            patch_with_confidence(80),
            patch_with_confidence(80),
            patch_with_confidence(80),
            patch_with_confidence(80),
        ]),
        FakeVerify::scripted(vec![
            verify_fail("assertion failed: total == 0"),
            verify_fail("assertion failed: total == 0"),
            verify_fail("assertion failed: total == 0"),
            verify_fail("assertion failed: total == 0"),
        ]),
        FakeCommunicate {
            fault: true,
            ..Default::default()
        },
    );

    h.coordinator.process_ticket(&ticket("BUG-8")).await;

    // The run still escalates cleanly even though nobody could be told.
    let runs = h.coordinator.registry().archived();
    assert_eq!(runs[0].status, RunStatus::Escalated);
    assert_eq!(
        runs[0].escalation_reason.as_deref(),
        Some("Maximum retries (4) reached")
    );

    // The tracker fallback routed the ticket to review with the generic note.
    let updates = h.tracker.updates();
    let last = updates.last().unwrap();
    assert_eq!(last.1, TicketStatus::NeedsReview);
    assert!(last.2.contains("Human review needed"));

    let records = analytics_records(&h.analytics_path);
    assert_eq!(records[0].final_status, RunStatus::Escalated);
    assert!(!h.lock_dir.join("BUG-8.lock").exists());
}

#[tokio::test(start_paused = true)]
async fn verify_faults_burn_the_retry_budget_then_escalate() {
    let mut h = harness(
        FakePlan { fail: false },
        FakeImplement::default(),
        FakeVerify::faulting(),
        FakeCommunicate::default(),
    );

    h.coordinator.process_ticket(&ticket("BUG-9")).await;

    let runs = h.coordinator.registry().archived();
    assert_eq!(runs[0].status, RunStatus::Escalated);
    assert_eq!(runs[0].current_attempt, 4);
    // No verdict was ever produced, only faults.
    assert_eq!(runs[0].test_passed, None);
    assert_eq!(runs[0].retry_history.len(), 4);
    assert!(runs[0].retry_history.iter().all(|record| {
        record.verification.is_none()
            && record
                .error
                .as_deref()
                .is_some_and(|e| e.contains("test runner crashed"))
    }));
    // The patch from each attempt is still recorded for diagnostics.
    assert!(runs[0]
        .retry_history
        .iter()
        .all(|record| record.patch_content.is_some()));
    assert!(runs[0]
        .escalation_reason
        .as_deref()
        .unwrap()
        .contains("Stage fault after 4 attempt(s)"));
}

#[tokio::test(start_paused = true)]
async fn communicate_fault_after_verified_fix_still_completes() {
    let mut h = harness(
        FakePlan { fail: false },
        FakeImplement::scripted(vec![patch_with_confidence(90)]),
        FakeVerify::scripted(vec![verify_pass()]),
        FakeCommunicate {
            fault: true,
            ..Default::default()
        },
    );

    h.coordinator.process_ticket(&ticket("BUG-7")).await;

    // The fix exists; the run completes even though nobody was told.
    let runs = h.coordinator.registry().archived();
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert!(runs[0].pull_request_url.is_none());

    let updates = h.tracker.updates();
    let last = updates.last().unwrap();
    assert_eq!(last.1, TicketStatus::NeedsReview);
    assert!(last.2.contains("follow-up communication failed"));
}

#[tokio::test(start_paused = true)]
async fn intake_filters_claimed_foreign_locked_and_non_todo_tickets() {
    let mut h = harness(
        FakePlan { fail: false },
        FakeImplement::default(),
        FakeVerify::default(),
        FakeCommunicate::default(),
    );

    // BUG-10 was already processed this session.
    h.coordinator.process_ticket(&ticket("BUG-10")).await;

    // BUG-11 carries a fresh lease from another instance.
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let lease = Lease {
        owner: "other-instance".into(),
        pid: 1,
        acquired_at: now,
    };
    std::fs::write(
        h.lock_dir.join("BUG-11.lock"),
        serde_json::to_vec(&lease).unwrap(),
    )
    .unwrap();

    // BUG-12 is not in To Do.
    let in_progress: Ticket = serde_json::from_value(serde_json::json!({
        "id": "BUG-12",
        "title": "Already claimed elsewhere",
        "status": "in_progress",
    }))
    .unwrap();

    let eligible = h.coordinator.eligible_tickets(vec![
        ticket("BUG-10"),
        ticket("BUG-11"),
        in_progress,
        ticket("BUG-13"),
    ]);

    let ids: Vec<&str> = eligible.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, ["BUG-13"]);
}

#[tokio::test(start_paused = true)]
async fn second_pass_does_not_reprocess_a_finished_ticket() {
    let mut h = harness(
        FakePlan { fail: false },
        FakeImplement::scripted(vec![patch_with_confidence(90)]),
        FakeVerify::scripted(vec![verify_pass()]),
        FakeCommunicate::default(),
    );

    let t = ticket("BUG-20");
    h.coordinator.process_ticket(&t).await;
    h.coordinator.process_ticket(&t).await;

    assert_eq!(h.implement.calls().len(), 1);
    assert_eq!(h.coordinator.registry().archived().len(), 1);
    assert_eq!(analytics_records(&h.analytics_path).len(), 1);
}
