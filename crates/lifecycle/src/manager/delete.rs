//! Delete.

use tracing::{info, warn};

use super::{ensure_active, success_tag, Manager, NewEnv};
use crate::context::OpContext;
use crate::error::{LifecycleError, StepContext};
use crate::models::{DestroyReason, EnvironmentStatus, OperationKind, OperationRecord, OperationStatus, RepoRevisionData};
use crate::notifications::NotificationEvent;

impl Manager {
    /// Destroy a pull request's environment.
    ///
    /// The namespace is deleted in the background; the record is marked
    /// `Destroyed` before this returns. Destroying a pull request with no
    /// extant environment succeeds and marks its historical records
    /// `Destroyed`.
    ///
    /// # Errors
    ///
    /// Fails if the lock cannot be obtained, the operation is cancelled, or
    /// the record cannot be updated.
    pub async fn delete(
        &self,
        ctx: &OpContext,
        rd: RepoRevisionData,
        reason: DestroyReason,
    ) -> Result<(), LifecycleError> {
        let this = self.clone();
        let body_rd = rd.clone();
        self.locking_operation(ctx, &rd, "destroy", move |op| async move {
            this.delete_inner(&op, &body_rd, reason).await
        })
        .await
    }

    async fn delete_inner(
        &self,
        op: &OpContext,
        rd: &RepoRevisionData,
        reason: DestroyReason,
    ) -> Result<(), LifecycleError> {
        ensure_active(op)?;
        let env = match self.getenv(rd).await {
            Ok(env) => env,
            Err(LifecycleError::ExtantEnvironments { found: 0 }) => {
                return self.destroy_history(op, rd).await;
            }
            Err(e) => return Err(e).step("error getting environment"),
        };

        let timing = self.timing("destroy", &rd.repo);
        info!(env = %env.name, reason = %reason, "Destroying environment");
        let mut ne = NewEnv::new(env);
        self.start_operation(op, OperationKind::Destroy, &ne.env.name, rd)
            .await;
        if let Err(e) = self.process_env_config(op, &mut ne, rd).await {
            warn!(env = %ne.env.name, error = %e, "Error processing environment config, continuing with destroy");
        }

        let result = self.delete_steps(op, &ne, reason).await;
        if !op.is_cancelled() {
            match &result {
                Ok(()) => self.complete_operation(op, OperationStatus::Done).await,
                Err(e) => {
                    self.increment("destroy_errors", &rd.repo);
                    let message = format!("error destroying environment: {e}");
                    self.add_event(&ne.env.name, &message).await;
                    self.push_notification(&ne, NotificationEvent::Failure, Some(&message))
                        .await;
                    self.complete_operation(op, OperationStatus::Failed).await;
                }
            }
        }
        timing.finish(&[success_tag(result.is_ok())]);
        result
    }

    async fn delete_steps(&self, op: &OpContext, ne: &NewEnv, reason: DestroyReason) -> Result<(), LifecycleError> {
        let name = &ne.env.name;
        ensure_active(op)?;
        self.push_notification(ne, NotificationEvent::DestroyEnvironment, None)
            .await;

        match self
            .data
            .get_cluster_environment(name)
            .await
            .step("error getting cluster environment")?
        {
            Some(ce) => self.spawn_namespace_deletion(ce, &ne.env.repo).await,
            None => warn!(env = %name, "No cluster environment, skipping namespace deletion"),
        }

        self.data
            .set_environment_status(name, EnvironmentStatus::Destroyed)
            .await
            .step("error setting environment status")?;
        self.add_event(name, &format!("environment destroyed: {reason}"))
            .await;
        info!(env = %name, reason = %reason, "Environment destroyed");
        Ok(())
    }

    /// Mark every record for the pull request `Destroyed`.
    async fn destroy_history(&self, op: &OpContext, rd: &RepoRevisionData) -> Result<(), LifecycleError> {
        info!(
            repo = %rd.repo,
            pull_request = rd.pull_request,
            "No extant environment, marking historical records destroyed"
        );
        if let Err(e) = self
            .data
            .save_operation(&OperationRecord::new(op.id(), OperationKind::Destroy, "<unknown>", rd))
            .await
        {
            warn!(operation = %op.id(), error = %e, "Error saving operation record");
        }
        let envs = self
            .data
            .get_environments_by_repo_and_pr(&rd.repo, rd.pull_request)
            .await
            .step("error getting environments")?;
        for env in envs
            .iter()
            .filter(|e| e.status != EnvironmentStatus::Destroyed)
        {
            self.data
                .set_environment_status(&env.name, EnvironmentStatus::Destroyed)
                .await
                .step("error setting environment status")?;
            self.add_event(&env.name, &format!("marked destroyed (was {})", env.status))
                .await;
        }
        self.complete_operation(op, OperationStatus::Done).await;
        Ok(())
    }
}
