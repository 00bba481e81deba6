//! Detached namespace deletion.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{success_tag, Manager};
use crate::error::InstallError;
use crate::models::ClusterEnvironment;

impl Manager {
    /// Drop the environment's release records, then delete its namespace on
    /// a background task that outlives the calling operation.
    pub(super) async fn spawn_namespace_deletion(&self, cluster_env: ClusterEnvironment, repo: &str) {
        match self.data.delete_helm_releases_for_env(&cluster_env.env_name).await {
            Ok(n) => debug!(env = %cluster_env.env_name, releases = n, "Deleted helm release records"),
            Err(e) => warn!(env = %cluster_env.env_name, error = %e, "Error deleting helm release records"),
        }
        let this = self.clone();
        let repo = repo.to_string();
        self.tasks.spawn(async move {
            this.delete_namespace(&cluster_env, &repo).await;
        });
    }

    async fn delete_namespace(&self, cluster_env: &ClusterEnvironment, repo: &str) {
        let timing = self.timing("delete_namespace_duration", repo);
        let timeout = self.config.namespace_delete_timeout;
        let cancel = CancellationToken::new();
        let attempts = self.config.namespace_delete_attempts;
        let outcome = tokio::time::timeout(
            timeout,
            self.delete_namespace_with_retry(&cancel, cluster_env, attempts),
        )
        .await;

        let env = &cluster_env.env_name;
        let ns = &cluster_env.namespace;
        let ok = match outcome {
            Ok(Ok(())) => {
                info!(env = %env, namespace = %ns, "Namespace deleted");
                self.add_event(env, &format!("namespace {ns} deleted")).await;
                true
            }
            Ok(Err(e)) => {
                error!(env = %env, namespace = %ns, attempts, error = %e, "Giving up deleting namespace");
                self.add_event(env, &format!("error deleting namespace {ns}: {e}"))
                    .await;
                false
            }
            Err(_) => {
                cancel.cancel();
                error!(env = %env, namespace = %ns, ?timeout, "Timed out deleting namespace");
                self.add_event(env, &format!("timed out deleting namespace {ns}"))
                    .await;
                false
            }
        };
        timing.finish(&[success_tag(ok)]);
    }

    async fn delete_namespace_with_retry(
        &self,
        cancel: &CancellationToken,
        cluster_env: &ClusterEnvironment,
        attempts: u32,
    ) -> Result<(), InstallError> {
        let mut last = InstallError::Cluster("no deletion attempted".to_string());
        for attempt in 1..=attempts {
            match self.installer.delete_namespace(cancel.clone(), cluster_env).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        namespace = %cluster_env.namespace,
                        attempt,
                        attempts,
                        error = %e,
                        "Error deleting namespace"
                    );
                    last = e;
                }
            }
        }
        Err(last)
    }
}
