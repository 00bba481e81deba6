//! Create, plus the build pipeline pieces shared with update.

use std::collections::BTreeMap;

use chrono::Utc;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use super::{ensure_active, repo_tags, success_tag, Manager, NewEnv, TimeoutGuard};
use crate::commit_status::CommitStatus;
use crate::context::{CancelReason, OpContext};
use crate::error::{LifecycleError, PersistenceError, StepContext};
use crate::installer::EnvInfo;
use crate::metadata::{ChartLocations, RepoConfig};
use crate::models::{Environment, EnvironmentStatus, OperationKind, OperationStatus, RepoRevisionData};
use crate::notifications::NotificationEvent;

impl Manager {
    /// Create the environment for a pull request, returning its name.
    ///
    /// An earlier record for the same pull request is reused, keeping its
    /// name. The environment is built under the pull request's lock,
    /// preempting any operation already running on it.
    ///
    /// # Errors
    ///
    /// Fails if the lock cannot be obtained, the operation is cancelled, or
    /// any step of the build fails. Build failures leave the environment in
    /// `Failure`, cancellation in `Cancelled`.
    pub async fn create(&self, ctx: &OpContext, rd: RepoRevisionData) -> Result<String, LifecycleError> {
        let this = self.clone();
        let body_rd = rd.clone();
        self.locking_operation(ctx, &rd, "create", move |op| async move {
            this.create_inner(&op, &body_rd).await
        })
        .await
    }

    /// Create without taking the lock; the caller holds it.
    pub(super) async fn create_inner(&self, op: &OpContext, rd: &RepoRevisionData) -> Result<String, LifecycleError> {
        let timing = self.timing("create", &rd.repo);
        let result = self.create_env(op, rd).await;
        timing.finish(&[success_tag(result.is_ok())]);
        result
    }

    async fn create_env(&self, op: &OpContext, rd: &RepoRevisionData) -> Result<String, LifecycleError> {
        ensure_active(op)?;
        let env = self
            .generate_new_env(op, rd)
            .await
            .step("error generating environment")?;
        info!(env = %env.name, repo = %rd.repo, pull_request = rd.pull_request, "Creating environment");
        let mut ne = NewEnv::new(env);
        self.start_operation(op, OperationKind::Create, &ne.env.name, rd)
            .await;
        let _timeout = self.enforce_timeout(op, &ne.env);
        let result = self.create_steps(op, rd, &mut ne).await;
        self.finish_build(op, rd, &ne, OperationKind::Create, &result)
            .await;
        result
    }

    /// Reset the newest record for the pull request to `Spawned`, or insert
    /// a fresh one under a new name.
    async fn generate_new_env(&self, op: &OpContext, rd: &RepoRevisionData) -> Result<Environment, LifecycleError> {
        let existing = self
            .data
            .get_environments_by_repo_and_pr(&rd.repo, rd.pull_request)
            .await?;
        let extant = existing.iter().filter(|e| e.status.is_extant()).count();
        if extant > 1 {
            return Err(LifecycleError::ExtantEnvironments { found: extant });
        }
        ensure_active(op)?;
        if let Some(prior) = existing.into_iter().max_by_key(|e| e.created) {
            debug!(env = %prior.name, status = %prior.status, "Reusing environment record");
            self.data
                .set_environment_status(&prior.name, EnvironmentStatus::Spawned)
                .await?;
            ensure_active(op)?;
            self.data.set_environment_repo_data(&prior.name, rd).await?;
            ensure_active(op)?;
            self.data
                .set_environment_created(&prior.name, Utc::now())
                .await?;
            self.add_event(&prior.name, &format!("reusing environment record (was {})", prior.status))
                .await;
            return self
                .data
                .get_environment(&prior.name)
                .await?
                .ok_or_else(|| PersistenceError::NotFound(prior.name).into());
        }

        let env = Environment::new(self.names.generate()?, rd, Utc::now());
        ensure_active(op)?;
        self.data.create_environment(&env).await?;
        self.add_event(&env.name, "environment created").await;
        Ok(env)
    }

    async fn create_steps(
        &self,
        op: &OpContext,
        rd: &RepoRevisionData,
        ne: &mut NewEnv,
    ) -> Result<String, LifecycleError> {
        let rc = self
            .process_env_config(op, ne, rd)
            .await
            .step("error processing environment config")?;
        self.add_event(&ne.env.name, "environment config processed")
            .await;

        ensure_active(op)?;
        self.push_notification(ne, NotificationEvent::CreateEnvironment, None)
            .await;
        self.set_commit_status(op, rd, ne, CommitStatus::Pending, None)
            .await;

        let (_scratch, charts) = self
            .fetch_charts(&ne.env, &rc)
            .await
            .step("error fetching charts")?;
        self.enforce_global_limit(op)
            .await
            .step("error enforcing global limit")?;

        ensure_active(op)?;
        let info = EnvInfo {
            env: ne.env.clone(),
            rc,
            releases: BTreeMap::new(),
        };
        self.installer
            .build_and_install_charts(op.token(), &info, &charts)
            .await
            .step("error installing charts")?;
        Ok(ne.env.name.clone())
    }

    /// Resolve configuration for `rd` and persist its ref and commit maps.
    pub(super) async fn process_env_config(
        &self,
        op: &OpContext,
        ne: &mut NewEnv,
        rd: &RepoRevisionData,
    ) -> Result<RepoConfig, LifecycleError> {
        let timing = self.timing("process_config", &rd.repo);
        let result = self.resolve_env_config(op, ne, rd).await;
        timing.finish(&[success_tag(result.is_ok())]);
        result
    }

    async fn resolve_env_config(
        &self,
        op: &OpContext,
        ne: &mut NewEnv,
        rd: &RepoRevisionData,
    ) -> Result<RepoConfig, LifecycleError> {
        let name = ne.env.name.clone();
        let rc = self.metadata.get(rd).await.step("error getting metadata")?;
        ne.rc = Some(rc.clone());

        #[allow(clippy::cast_precision_loss)]
        let dependencies = rc.dependencies.count() as f64;
        self.metrics
            .gauge("env.dependencies", dependencies, &repo_tags(&rd.repo));

        let ref_map = rc.ref_map().step("error building ref map")?;
        let commit_sha_map = rc.commit_sha_map().step("error building commit sha map")?;
        ensure_active(op)?;
        self.data
            .set_environment_ref_map(&name, &ref_map)
            .await
            .step("error saving ref map")?;
        ensure_active(op)?;
        self.data
            .set_environment_commit_sha_map(&name, &commit_sha_map)
            .await
            .step("error saving commit sha map")?;
        ensure_active(op)?;
        self.data
            .set_environment_repo_data(&name, rd)
            .await
            .step("error saving repo data")?;
        ne.env = self
            .data
            .get_environment(&name)
            .await?
            .ok_or(PersistenceError::NotFound(name))?;
        Ok(rc)
    }

    /// Fetch chart artifacts into a scratch directory removed when the
    /// returned handle drops.
    pub(super) async fn fetch_charts(
        &self,
        env: &Environment,
        rc: &RepoConfig,
    ) -> Result<(TempDir, ChartLocations), LifecycleError> {
        let timing = self.timing("fetch_helm_charts", &env.repo);
        let result = async {
            let scratch = tempfile::Builder::new()
                .prefix(&format!("{}-", env.name))
                .tempdir()?;
            let charts = self.metadata.fetch_charts(rc, scratch.path()).await?;
            debug!(env = %env.name, charts = charts.len(), dir = %scratch.path().display(), "Fetched charts");
            Ok::<_, LifecycleError>((scratch, charts))
        }
        .await;
        timing.finish(&[success_tag(result.is_ok())]);
        result
    }

    /// Cancel `op` once the operation timeout passes, notifying first.
    pub(super) fn enforce_timeout(&self, op: &OpContext, env: &Environment) -> TimeoutGuard {
        let this = self.clone();
        let op = op.clone();
        let env = env.clone();
        let timeout = self.config.operation_timeout;
        TimeoutGuard(tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {}
                () = op.cancelled() => return,
            }
            warn!(env = %env.name, ?timeout, "Operation timed out");
            let ne = NewEnv::new(env);
            this.push_notification(
                &ne,
                NotificationEvent::Failure,
                Some(&format!("timeout reached ({timeout:?}), aborting")),
            )
            .await;
            op.cancel(CancelReason::Timeout(timeout));
        }))
    }

    /// Report the outcome of a create or update.
    ///
    /// A cancelled operation reports nothing here; its final status is
    /// written by the locking wrapper.
    pub(super) async fn finish_build(
        &self,
        op: &OpContext,
        rd: &RepoRevisionData,
        ne: &NewEnv,
        kind: OperationKind,
        result: &Result<String, LifecycleError>,
    ) {
        if op.is_cancelled() {
            debug!(env = %ne.env.name, reason = %op.reason_text(), "Skipping build reporting for cancelled operation");
            return;
        }
        match result {
            Ok(_) => {
                info!(env = %ne.env.name, operation = %kind, "Environment ready");
                self.push_notification(ne, NotificationEvent::Success, None)
                    .await;
                self.set_commit_status(op, rd, ne, CommitStatus::Success, None)
                    .await;
                self.complete_operation(op, OperationStatus::Done).await;
            }
            Err(e) => {
                self.increment(&format!("{kind}_errors"), &rd.repo);
                if let Err(se) = self
                    .data
                    .set_environment_status(&ne.env.name, EnvironmentStatus::Failure)
                    .await
                {
                    error!(env = %ne.env.name, error = %se, "Error setting environment status to failure");
                }
                let verb = if kind == OperationKind::Update { "updating" } else { "creating" };
                let message = format!("error {verb} environment: {e}");
                self.add_event(&ne.env.name, &message).await;
                self.push_notification(ne, NotificationEvent::Failure, Some(&message))
                    .await;
                self.set_commit_status(op, rd, ne, CommitStatus::Failure, Some(&message))
                    .await;
                self.complete_operation(op, OperationStatus::Failed).await;
            }
        }
    }
}
