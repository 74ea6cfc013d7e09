use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::scm::SourceControl;
use crate::stage::{CommunicateInput, CommunicateOutput, Stage};
use crate::tracker::{TicketStatus, TrackerClient};

/// Communicate stage backed by the source-control and tracker collaborators.
///
/// On a verified fix it reuses the existing pull request for the ticket's fix
/// branch or opens a new one, then closes the ticket out. On escalation it
/// only posts the review request. Collaborator failures degrade to
/// `communications_success: false` — the coordinator's own bookkeeping never
/// depends on this stage succeeding.
pub struct PullRequestCommunicator {
    scm: Arc<dyn SourceControl>,
    tracker: Arc<dyn TrackerClient>,
}

impl PullRequestCommunicator {
    pub fn new(scm: Arc<dyn SourceControl>, tracker: Arc<dyn TrackerClient>) -> Self {
        Self { scm, tracker }
    }

    fn branch_name(ticket_id: &str) -> String {
        format!("bugfix/{ticket_id}")
    }

    /// Find-or-create the pull request for the fix branch. Returns `None`
    /// when source control is unusable; the caller reports that as a
    /// communications failure rather than a fault.
    async fn pull_request_url(&self, input: &CommunicateInput) -> Option<String> {
        if let Some(url) = &input.pull_request_url {
            return Some(url.clone());
        }

        let branch = Self::branch_name(&input.ticket_id);
        match self.scm.find_pull_request(&branch).await {
            Ok(Some(url)) => {
                info!(ticket = %input.ticket_id, %url, "reusing existing pull request");
                return Some(url);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(ticket = %input.ticket_id, error = %e, "pull request lookup failed");
                return None;
            }
        }

        if let Err(e) = self.scm.ensure_branch(&branch).await {
            warn!(ticket = %input.ticket_id, %branch, error = %e, "failed to ensure fix branch");
            return None;
        }

        let title = format!("Fix {}", input.ticket_id);
        let body = format!(
            "Automated fix for {}. Verified on attempt {}/{}{}.",
            input.ticket_id,
            input.retry_count,
            input.max_retries,
            input
                .confidence_score
                .map(|score| format!(" with confidence {score}%"))
                .unwrap_or_default(),
        );
        match self.scm.create_pull_request(&branch, &title, &body).await {
            Ok(url) => {
                info!(ticket = %input.ticket_id, %url, "opened pull request");
                Some(url)
            }
            Err(e) => {
                warn!(ticket = %input.ticket_id, error = %e, "failed to open pull request");
                None
            }
        }
    }

    async fn update_tracker(&self, ticket_id: &str, status: TicketStatus, comment: &str) -> bool {
        match self.tracker.update_ticket(ticket_id, status, comment).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(ticket = ticket_id, %status, error = %e, "tracker update failed");
                false
            }
        }
    }
}

#[async_trait]
impl Stage for PullRequestCommunicator {
    type Input = CommunicateInput;
    type Output = CommunicateOutput;

    fn name(&self) -> &'static str {
        "communicate"
    }

    async fn run(&self, input: CommunicateInput) -> Result<CommunicateOutput> {
        if input.test_passed {
            let url = self.pull_request_url(&input).await;
            let updated = match &url {
                Some(url) => {
                    let comment = format!(
                        "Fix verified on attempt {}/{}. Pull request: {url}",
                        input.retry_count, input.max_retries
                    );
                    self.update_tracker(&input.ticket_id, TicketStatus::Done, &comment)
                        .await
                }
                None => {
                    let comment =
                        "Fix was verified but pull request creation failed. Manual review of the fix branch is needed.";
                    self.update_tracker(&input.ticket_id, TicketStatus::NeedsReview, comment)
                        .await
                }
            };

            return Ok(CommunicateOutput {
                communications_success: updated && url.is_some(),
                pull_request_url: url,
            });
        }

        // Escalation / failure path: review request only, no pull request.
        let mut comment = format!(
            "Automated fix was unsuccessful after {} of {} attempt(s). Human review needed.",
            input.retry_count, input.max_retries
        );
        if let Some(reason) = &input.escalation_reason {
            comment.push_str(&format!(" Reason: {reason}."));
        }
        if let Some(summary) = &input.failure_summary {
            comment.push_str(&format!(" Last failure: {summary}"));
        }

        let updated = self
            .update_tracker(&input.ticket_id, TicketStatus::NeedsReview, &comment)
            .await;

        Ok(CommunicateOutput {
            communications_success: updated,
            pull_request_url: None,
        })
    }
}
