//! Environment records and the data that drives them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commit_status::RenderedCommitStatus;

/// The commit and pull request that triggered an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRevisionData {
    pub user: String,
    pub repo: String,
    pub pull_request: u32,
    pub source_sha: String,
    pub base_sha: String,
    pub source_branch: String,
    pub base_branch: String,
    /// Fully qualified source ref, when it differs from the branch name
    #[serde(default)]
    pub source_ref: String,
}

/// Lifecycle status of an environment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    /// Being built
    Spawned,
    Success,
    Failure,
    Destroyed,
    Cancelled,
}

impl EnvironmentStatus {
    /// Extant records are the ones that still represent the pull request's
    /// environment. At most one may exist per repository and pull request.
    #[must_use]
    pub const fn is_extant(self) -> bool {
        !matches!(self, Self::Destroyed | Self::Cancelled)
    }

    /// Running records count against the global environment limit.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Spawned | Self::Success)
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawned => "spawned",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Destroyed => "destroyed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A preview environment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Unique generated name
    pub name: String,
    pub created: DateTime<Utc>,
    pub status: EnvironmentStatus,
    pub user: String,
    pub repo: String,
    pub pull_request: u32,
    pub source_sha: String,
    pub base_sha: String,
    pub source_branch: String,
    pub base_branch: String,
    pub source_ref: String,
    /// Repository to branch for every repository in the environment
    #[serde(default)]
    pub ref_map: BTreeMap<String, String>,
    /// Repository to commit SHA for every repository in the environment
    #[serde(default)]
    pub commit_sha_map: BTreeMap<String, String>,
}

impl Environment {
    /// A new `Spawned` record for `rd`.
    #[must_use]
    pub fn new(name: impl Into<String>, rd: &RepoRevisionData, created: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            created,
            status: EnvironmentStatus::Spawned,
            user: rd.user.clone(),
            repo: rd.repo.clone(),
            pull_request: rd.pull_request,
            source_sha: rd.source_sha.clone(),
            base_sha: rd.base_sha.clone(),
            source_branch: rd.source_branch.clone(),
            base_branch: rd.base_branch.clone(),
            source_ref: rd.source_ref.clone(),
            ref_map: BTreeMap::new(),
            commit_sha_map: BTreeMap::new(),
        }
    }

    /// Overwrite the revision fields with `rd`.
    pub fn apply_revision(&mut self, rd: &RepoRevisionData) {
        self.user.clone_from(&rd.user);
        self.repo.clone_from(&rd.repo);
        self.pull_request = rd.pull_request;
        self.source_sha.clone_from(&rd.source_sha);
        self.base_sha.clone_from(&rd.base_sha);
        self.source_branch.clone_from(&rd.source_branch);
        self.base_branch.clone_from(&rd.base_branch);
        self.source_ref.clone_from(&rd.source_ref);
    }

    /// The revision data this record was last built from.
    #[must_use]
    pub fn revision_data(&self) -> RepoRevisionData {
        RepoRevisionData {
            user: self.user.clone(),
            repo: self.repo.clone(),
            pull_request: self.pull_request,
            source_sha: self.source_sha.clone(),
            base_sha: self.base_sha.clone(),
            source_branch: self.source_branch.clone(),
            base_branch: self.base_branch.clone(),
            source_ref: self.source_ref.clone(),
        }
    }
}

/// Cluster-side state of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEnvironment {
    pub env_name: String,
    pub namespace: String,
    /// Signature of the configuration the namespace was built from
    pub config_signature: Vec<u8>,
    pub updated: DateTime<Utc>,
}

/// A chart release installed for one dependency of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelmRelease {
    pub env_name: String,
    /// Dependency name the release was installed for
    pub name: String,
    /// Release name in the cluster
    pub release: String,
    pub revision_sha: String,
}

/// An entry in an environment's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentEvent {
    pub env_name: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Why an environment is being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestroyReason {
    PullRequestClosed,
    ApiRequest,
    ReapAgeSpent,
    ReapPullRequestClosed,
    EnvironmentLimitExceeded,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PullRequestClosed => "pull request closed",
            Self::ApiRequest => "api request",
            Self::ReapAgeSpent => "reaped: age spent",
            Self::ReapPullRequestClosed => "reaped: pull request closed",
            Self::EnvironmentLimitExceeded => "environment limit exceeded",
        };
        f.write_str(s)
    }
}

/// Kind of lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Destroy,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
        })
    }
}

/// Progress of one lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Done,
    Failed,
    Cancelled,
}

/// Record of one lifecycle operation, addressable by its id from commit
/// status links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    pub kind: OperationKind,
    pub env_name: String,
    pub repo: String,
    pub pull_request: u32,
    pub status: OperationStatus,
    pub rendered_status: Option<RenderedCommitStatus>,
    pub started: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
}

impl OperationRecord {
    #[must_use]
    pub fn new(id: Uuid, kind: OperationKind, env_name: &str, rd: &RepoRevisionData) -> Self {
        Self {
            id,
            kind,
            env_name: env_name.to_string(),
            repo: rd.repo.clone(),
            pull_request: rd.pull_request,
            status: OperationStatus::Pending,
            rendered_status: None,
            started: Utc::now(),
            completed: None,
        }
    }
}
