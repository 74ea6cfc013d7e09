//! Source-control collaborator contract.
//!
//! Consumed by communicate-stage implementations, never by the coordinator
//! itself. Concrete providers (GitHub API, git CLI) live outside this crate.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Create the branch if it does not exist. Returns true when the branch
    /// already existed.
    async fn ensure_branch(&self, branch: &str) -> Result<bool>;

    /// Commit the given patch content to the branch.
    async fn commit_patch(&self, branch: &str, message: &str, patch: &str) -> Result<()>;

    /// Open a pull request for the branch and return its URL.
    async fn create_pull_request(&self, branch: &str, title: &str, body: &str) -> Result<String>;

    /// Find an existing open pull request for the branch, if any.
    async fn find_pull_request(&self, branch: &str) -> Result<Option<String>>;
}
