//! Persistence contract and an in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::commit_status::RenderedCommitStatus;
use crate::error::PersistenceError;
use crate::models::{
    ClusterEnvironment, Environment, EnvironmentEvent, EnvironmentStatus, HelmRelease,
    OperationRecord, OperationStatus, RepoRevisionData,
};

/// Storage for environment records and their bookkeeping.
#[async_trait]
pub trait DataLayer: Send + Sync {
    async fn create_environment(&self, env: &Environment) -> Result<(), PersistenceError>;

    async fn get_environment(&self, name: &str) -> Result<Option<Environment>, PersistenceError>;

    /// Every record for a repository and pull request, in any status.
    async fn get_environments_by_repo_and_pr(
        &self,
        repo: &str,
        pull_request: u32,
    ) -> Result<Vec<Environment>, PersistenceError>;

    /// Records for a repository and pull request that are neither destroyed
    /// nor cancelled.
    async fn get_extant_environments(
        &self,
        repo: &str,
        pull_request: u32,
    ) -> Result<Vec<Environment>, PersistenceError>;

    /// Spawned and successful records, oldest first.
    async fn get_running_environments(&self) -> Result<Vec<Environment>, PersistenceError>;

    async fn set_environment_status(
        &self,
        name: &str,
        status: EnvironmentStatus,
    ) -> Result<(), PersistenceError>;

    async fn set_environment_repo_data(
        &self,
        name: &str,
        rd: &RepoRevisionData,
    ) -> Result<(), PersistenceError>;

    async fn set_environment_created(
        &self,
        name: &str,
        created: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn set_environment_ref_map(
        &self,
        name: &str,
        ref_map: &BTreeMap<String, String>,
    ) -> Result<(), PersistenceError>;

    async fn set_environment_commit_sha_map(
        &self,
        name: &str,
        commit_sha_map: &BTreeMap<String, String>,
    ) -> Result<(), PersistenceError>;

    async fn get_cluster_environment(
        &self,
        env_name: &str,
    ) -> Result<Option<ClusterEnvironment>, PersistenceError>;

    async fn upsert_cluster_environment(&self, env: &ClusterEnvironment) -> Result<(), PersistenceError>;

    async fn get_helm_releases_for_env(&self, env_name: &str) -> Result<Vec<HelmRelease>, PersistenceError>;

    /// Replace the release rows for an environment.
    async fn set_helm_releases_for_env(
        &self,
        env_name: &str,
        releases: &[HelmRelease],
    ) -> Result<(), PersistenceError>;

    /// Remove the release rows for an environment, returning how many existed.
    async fn delete_helm_releases_for_env(&self, env_name: &str) -> Result<usize, PersistenceError>;

    /// Append to an environment's event log.
    async fn add_event(&self, env_name: &str, message: &str) -> Result<(), PersistenceError>;

    async fn get_events(&self, env_name: &str) -> Result<Vec<EnvironmentEvent>, PersistenceError>;

    /// Insert or replace an operation record.
    async fn save_operation(&self, op: &OperationRecord) -> Result<(), PersistenceError>;

    async fn get_operation(&self, id: Uuid) -> Result<Option<OperationRecord>, PersistenceError>;

    async fn set_operation_status(&self, id: Uuid, status: OperationStatus) -> Result<(), PersistenceError>;

    async fn set_operation_rendered_status(
        &self,
        id: Uuid,
        rendered: &RenderedCommitStatus,
    ) -> Result<(), PersistenceError>;
}

/// [`DataLayer`] held in process memory.
///
/// Status writes are also appended to a per-environment history, which tests
/// use to check transitions.
#[derive(Default)]
pub struct MemoryDataLayer {
    environments: DashMap<String, Environment>,
    status_history: DashMap<String, Vec<EnvironmentStatus>>,
    cluster_environments: DashMap<String, ClusterEnvironment>,
    helm_releases: DashMap<String, Vec<HelmRelease>>,
    events: DashMap<String, Vec<EnvironmentEvent>>,
    operations: DashMap<Uuid, OperationRecord>,
}

impl MemoryDataLayer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status the environment has held, in order.
    #[must_use]
    pub fn status_history(&self, name: &str) -> Vec<EnvironmentStatus> {
        self.status_history
            .get(name)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    fn update_env(
        &self,
        name: &str,
        f: impl FnOnce(&mut Environment),
    ) -> Result<(), PersistenceError> {
        let mut env = self
            .environments
            .get_mut(name)
            .ok_or_else(|| PersistenceError::NotFound(name.to_string()))?;
        f(env.value_mut());
        Ok(())
    }

    fn update_op(&self, id: Uuid, f: impl FnOnce(&mut OperationRecord)) -> Result<(), PersistenceError> {
        let mut op = self
            .operations
            .get_mut(&id)
            .ok_or(PersistenceError::OperationNotFound(id))?;
        f(op.value_mut());
        Ok(())
    }

    fn select(&self, pred: impl Fn(&Environment) -> bool) -> Vec<Environment> {
        let mut out: Vec<Environment> = self
            .environments
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
        out
    }
}

#[async_trait]
impl DataLayer for MemoryDataLayer {
    async fn create_environment(&self, env: &Environment) -> Result<(), PersistenceError> {
        match self.environments.entry(env.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PersistenceError::Duplicate(env.name.clone())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(env.clone());
                self.status_history.insert(env.name.clone(), vec![env.status]);
                Ok(())
            }
        }
    }

    async fn get_environment(&self, name: &str) -> Result<Option<Environment>, PersistenceError> {
        Ok(self.environments.get(name).map(|e| e.value().clone()))
    }

    async fn get_environments_by_repo_and_pr(
        &self,
        repo: &str,
        pull_request: u32,
    ) -> Result<Vec<Environment>, PersistenceError> {
        Ok(self.select(|e| e.repo == repo && e.pull_request == pull_request))
    }

    async fn get_extant_environments(
        &self,
        repo: &str,
        pull_request: u32,
    ) -> Result<Vec<Environment>, PersistenceError> {
        Ok(self.select(|e| e.repo == repo && e.pull_request == pull_request && e.status.is_extant()))
    }

    async fn get_running_environments(&self) -> Result<Vec<Environment>, PersistenceError> {
        Ok(self.select(|e| e.status.is_running()))
    }

    async fn set_environment_status(
        &self,
        name: &str,
        status: EnvironmentStatus,
    ) -> Result<(), PersistenceError> {
        self.update_env(name, |e| e.status = status)?;
        self.status_history
            .entry(name.to_string())
            .or_default()
            .push(status);
        Ok(())
    }

    async fn set_environment_repo_data(
        &self,
        name: &str,
        rd: &RepoRevisionData,
    ) -> Result<(), PersistenceError> {
        self.update_env(name, |e| e.apply_revision(rd))
    }

    async fn set_environment_created(
        &self,
        name: &str,
        created: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.update_env(name, |e| e.created = created)
    }

    async fn set_environment_ref_map(
        &self,
        name: &str,
        ref_map: &BTreeMap<String, String>,
    ) -> Result<(), PersistenceError> {
        self.update_env(name, |e| e.ref_map.clone_from(ref_map))
    }

    async fn set_environment_commit_sha_map(
        &self,
        name: &str,
        commit_sha_map: &BTreeMap<String, String>,
    ) -> Result<(), PersistenceError> {
        self.update_env(name, |e| e.commit_sha_map.clone_from(commit_sha_map))
    }

    async fn get_cluster_environment(
        &self,
        env_name: &str,
    ) -> Result<Option<ClusterEnvironment>, PersistenceError> {
        Ok(self.cluster_environments.get(env_name).map(|e| e.value().clone()))
    }

    async fn upsert_cluster_environment(&self, env: &ClusterEnvironment) -> Result<(), PersistenceError> {
        self.cluster_environments.insert(env.env_name.clone(), env.clone());
        Ok(())
    }

    async fn get_helm_releases_for_env(&self, env_name: &str) -> Result<Vec<HelmRelease>, PersistenceError> {
        Ok(self
            .helm_releases
            .get(env_name)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn set_helm_releases_for_env(
        &self,
        env_name: &str,
        releases: &[HelmRelease],
    ) -> Result<(), PersistenceError> {
        self.helm_releases.insert(env_name.to_string(), releases.to_vec());
        Ok(())
    }

    async fn delete_helm_releases_for_env(&self, env_name: &str) -> Result<usize, PersistenceError> {
        Ok(self
            .helm_releases
            .remove(env_name)
            .map_or(0, |(_, releases)| releases.len()))
    }

    async fn add_event(&self, env_name: &str, message: &str) -> Result<(), PersistenceError> {
        self.events
            .entry(env_name.to_string())
            .or_default()
            .push(EnvironmentEvent {
                env_name: env_name.to_string(),
                timestamp: Utc::now(),
                message: message.to_string(),
            });
        Ok(())
    }

    async fn get_events(&self, env_name: &str) -> Result<Vec<EnvironmentEvent>, PersistenceError> {
        Ok(self
            .events
            .get(env_name)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn save_operation(&self, op: &OperationRecord) -> Result<(), PersistenceError> {
        self.operations.insert(op.id, op.clone());
        Ok(())
    }

    async fn get_operation(&self, id: Uuid) -> Result<Option<OperationRecord>, PersistenceError> {
        Ok(self.operations.get(&id).map(|o| o.value().clone()))
    }

    async fn set_operation_status(&self, id: Uuid, status: OperationStatus) -> Result<(), PersistenceError> {
        self.update_op(id, |op| {
            op.status = status;
            if status != OperationStatus::Pending {
                op.completed = Some(Utc::now());
            }
        })
    }

    async fn set_operation_rendered_status(
        &self,
        id: Uuid,
        rendered: &RenderedCommitStatus,
    ) -> Result<(), PersistenceError> {
        self.update_op(id, |op| op.rendered_status = Some(rendered.clone()))
    }
}
