//! Pipeline stages as uniform black-box capabilities.
//!
//! A stage is anything that can turn a typed input into a typed output,
//! possibly suspending on I/O. The coordinator never special-cases a stage's
//! internals: [`run_stage`] awaits the stage and converts any raised fault
//! into a [`StageOutcome::Failed`] value, so faults flow through the retry
//! loop as data instead of unwinding through it.
//!
//! Verification failure is deliberately NOT a fault — it is the `passed:
//! false` value inside [`VerifyOutput`], a normal outcome of the loop.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::run::RetryRecord;

/// One pipeline step (plan / implement / verify / communicate).
#[async_trait]
pub trait Stage: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    async fn run(&self, input: Self::Input) -> Result<Self::Output>;
}

/// Normalized result of a stage invocation: either the stage's payload or a
/// structured failure. Raised faults never escape past this.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Completed(T),
    Failed { error: String },
}

/// Invoke a stage and normalize its result.
pub async fn run_stage<S>(stage: &S, input: S::Input) -> StageOutcome<S::Output>
where
    S: Stage + ?Sized,
{
    match stage.run(input).await {
        Ok(output) => StageOutcome::Completed(output),
        Err(e) => {
            error!(stage = stage.name(), error = %format!("{e:#}"), "stage raised a fault");
            StageOutcome::Failed {
                error: format!("{} stage failed: {e:#}", stage.name()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-stage payload contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PlanInput {
    pub ticket_id: String,
    pub title: String,
    pub description: String,
}

/// Opaque plan payload. The coordinator passes it verbatim to the implement
/// stage without inspecting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutput {
    #[serde(flatten)]
    pub plan: Value,
}

/// Prior attempts handed back to the implement stage so later attempts can
/// see earlier failures and patches.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryContext {
    pub previous_attempts: Vec<RetryRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImplementInput {
    pub ticket_id: String,
    #[serde(flatten)]
    pub plan: Value,
    pub attempt: u32,
    pub max_attempts: u32,
    pub context: RetryContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImplementOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_content: Option<String>,
    /// Discrete candidate patches, when the stage emits them individually
    /// rather than as one opaque payload. Each one goes through patch
    /// validation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,
    /// 0–100 heuristic estimate of fix correctness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyInput {
    pub ticket_id: String,
    pub test_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutput {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_summary: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommunicateInput {
    pub ticket_id: String,
    pub test_passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<i32>,
    pub escalated: bool,
    pub early_escalation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicateOutput {
    pub communications_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
}
