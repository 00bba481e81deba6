//! Update: upgrade in place when the configuration is unchanged, otherwise
//! rebuild into a fresh namespace.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{ensure_active, success_tag, Manager, NewEnv};
use crate::commit_status::CommitStatus;
use crate::context::OpContext;
use crate::error::{LifecycleError, StepContext};
use crate::installer::EnvInfo;
use crate::models::{EnvironmentStatus, OperationKind, RepoRevisionData};
use crate::notifications::NotificationEvent;

impl Manager {
    /// Bring a pull request's environment up to date with a new revision.
    ///
    /// Falls back to [`create`](Self::create) when the pull request has no
    /// extant environment.
    ///
    /// # Errors
    ///
    /// As for `create`. More than one extant environment is reported as a
    /// data integrity error.
    pub async fn update(&self, ctx: &OpContext, rd: RepoRevisionData) -> Result<String, LifecycleError> {
        let this = self.clone();
        let body_rd = rd.clone();
        self.locking_operation(ctx, &rd, "update", move |op| async move {
            this.update_inner(&op, &body_rd).await
        })
        .await
    }

    async fn update_inner(&self, op: &OpContext, rd: &RepoRevisionData) -> Result<String, LifecycleError> {
        ensure_active(op)?;
        let env = match self.getenv(rd).await {
            Ok(env) => env,
            Err(LifecycleError::ExtantEnvironments { found: 0 }) => {
                info!(repo = %rd.repo, pull_request = rd.pull_request, "No extant environment, creating");
                self.increment("update_create", &rd.repo);
                return self.create_inner(op, rd).await;
            }
            Err(e) => return Err(e).step("error getting environment"),
        };

        let timing = self.timing("update", &rd.repo);
        info!(env = %env.name, repo = %rd.repo, pull_request = rd.pull_request, "Updating environment");
        let prior = env.status;
        let mut ne = NewEnv::new(env);
        self.start_operation(op, OperationKind::Update, &ne.env.name, rd)
            .await;
        let _timeout = self.enforce_timeout(op, &ne.env);
        let result = self.update_steps(op, rd, &mut ne, prior).await;
        self.finish_build(op, rd, &ne, OperationKind::Update, &result)
            .await;
        timing.finish(&[success_tag(result.is_ok())]);
        result
    }

    async fn update_steps(
        &self,
        op: &OpContext,
        rd: &RepoRevisionData,
        ne: &mut NewEnv,
        prior: EnvironmentStatus,
    ) -> Result<String, LifecycleError> {
        let name = ne.env.name.clone();
        self.data
            .set_environment_status(&name, EnvironmentStatus::Spawned)
            .await
            .step("error setting environment status")?;
        let rc = self
            .process_env_config(op, ne, rd)
            .await
            .step("error processing environment config")?;
        let cluster_env = self
            .data
            .get_cluster_environment(&name)
            .await
            .step("error getting cluster environment")?;

        ensure_active(op)?;
        self.push_notification(ne, NotificationEvent::UpdateEnvironment, None)
            .await;
        self.set_commit_status(op, rd, ne, CommitStatus::Pending, None)
            .await;

        let (_scratch, charts) = self
            .fetch_charts(&ne.env, &rc)
            .await
            .step("error fetching charts")?;
        let signature = rc.config_signature();
        let mut info = EnvInfo {
            env: ne.env.clone(),
            rc,
            releases: BTreeMap::new(),
        };

        match cluster_env {
            Some(ce) if prior == EnvironmentStatus::Success && ce.config_signature == signature => {
                info!(env = %name, signature = %hex::encode(signature), "Config unchanged, upgrading in place");
                self.increment("update_in_place", &rd.repo);
                info.releases = self
                    .data
                    .get_helm_releases_for_env(&name)
                    .await
                    .step("error getting helm releases")?
                    .into_iter()
                    .map(|r| (r.name, r.release))
                    .collect();
                ensure_active(op)?;
                self.installer
                    .build_and_upgrade_charts(op.token(), &info, &ce, &charts)
                    .await
                    .step("error upgrading charts")?;
            }
            cluster_env => {
                info!(
                    env = %name,
                    prior = %prior,
                    signature = %hex::encode(signature),
                    "Config changed or environment unhealthy, rebuilding"
                );
                self.increment("update_tear_down", &rd.repo);
                match cluster_env {
                    Some(ce) => self.spawn_namespace_deletion(ce, &rd.repo).await,
                    None => debug!(env = %name, "No cluster environment to tear down"),
                }
                ensure_active(op)?;
                self.installer
                    .build_and_install_charts(op.token(), &info, &charts)
                    .await
                    .step("error installing charts")?;
            }
        }
        Ok(name)
    }
}
