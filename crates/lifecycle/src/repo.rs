//! Source repository client contract.

use async_trait::async_trait;

use crate::commit_status::CommitStatusUpdate;
use crate::error::RepoError;

/// Reads commits and reports statuses on the repository host.
#[async_trait]
pub trait RepoClient: Send + Sync {
    /// First line of the commit message for `sha`.
    async fn get_commit_message(&self, repo: &str, sha: &str) -> Result<String, RepoError>;

    /// Set a commit status on `sha`.
    async fn set_status(&self, repo: &str, sha: &str, status: &CommitStatusUpdate) -> Result<(), RepoError>;
}
