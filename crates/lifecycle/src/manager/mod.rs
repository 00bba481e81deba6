//! Environment lifecycle orchestration.
//!
//! Every entry point runs as a locking operation: the environment's lock is
//! taken (preempting whatever operation currently holds it), the body runs on
//! its own task, and the caller gets an answer as soon as the body finishes or
//! the operation is cancelled by preemption, timeout or its caller. A
//! cancelled operation leaves its environment in `Cancelled`.

mod create;
mod delete;
mod limit;
mod namespace;
mod report;
mod update;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use locker::{LockProvider, PreemptiveLockerFactory};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::context::{CancelReason, OpContext};
use crate::error::{LifecycleError, StepContext};
use crate::installer::ChartInstaller;
use crate::metadata::{MetadataGetter, RepoConfig};
use crate::metrics::{MetricsCollector, Timing};
use crate::models::{
    Environment, EnvironmentStatus, OperationKind, OperationRecord, OperationStatus,
    RepoRevisionData,
};
use crate::namegen::NameGenerator;
use crate::notifications::NotificationRouterFactory;
use crate::persistence::DataLayer;
use crate::repo::RepoClient;

/// Metric name prefix.
const METRICS_PREFIX: &str = "env.";

/// Bound on releasing a lock once an operation is over.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// External systems the manager drives.
#[derive(Clone)]
pub struct Collaborators {
    pub data: Arc<dyn DataLayer>,
    pub repo: Arc<dyn RepoClient>,
    pub metadata: Arc<dyn MetadataGetter>,
    pub installer: Arc<dyn ChartInstaller>,
    pub names: Arc<dyn NameGenerator>,
    pub metrics: Arc<dyn MetricsCollector>,
    pub notifiers: Arc<dyn NotificationRouterFactory>,
}

/// Creates, updates and deletes preview environments.
///
/// Cheap to clone; clones share collaborators and background tasks.
#[derive(Clone)]
pub struct Manager {
    config: Arc<ManagerConfig>,
    data: Arc<dyn DataLayer>,
    repo: Arc<dyn RepoClient>,
    metadata: Arc<dyn MetadataGetter>,
    installer: Arc<dyn ChartInstaller>,
    names: Arc<dyn NameGenerator>,
    metrics: Arc<dyn MetricsCollector>,
    notifiers: Arc<dyn NotificationRouterFactory>,
    lockers: PreemptiveLockerFactory,
    tasks: TaskTracker,
}

/// An environment record and, once resolved, its configuration.
struct NewEnv {
    env: Environment,
    rc: Option<RepoConfig>,
}

impl NewEnv {
    const fn new(env: Environment) -> Self {
        Self { env, rc: None }
    }
}

/// Aborts the operation timeout when the operation ends.
struct TimeoutGuard(JoinHandle<()>);

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn repo_tags(repo: &str) -> Vec<String> {
    vec![format!("triggering_repo:{repo}")]
}

fn success_tag(ok: bool) -> String {
    format!("success:{ok}")
}

/// `Cancelled` if the operation has been cancelled.
fn ensure_active(op: &OpContext) -> Result<(), LifecycleError> {
    if op.is_cancelled() {
        return Err(LifecycleError::Cancelled(op.reason_text()));
    }
    Ok(())
}

impl Manager {
    #[must_use]
    pub fn new(config: ManagerConfig, collaborators: Collaborators, locks: Arc<dyn LockProvider>) -> Self {
        let lockers = PreemptiveLockerFactory::new(locks, config.lock_wait);
        Self {
            config: Arc::new(config),
            data: collaborators.data,
            repo: collaborators.repo,
            metadata: collaborators.metadata,
            installer: collaborators.installer,
            names: collaborators.names,
            metrics: collaborators.metrics,
            notifiers: collaborators.notifiers,
            lockers,
            tasks: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Wait for detached work (namespace deletions) to finish.
    pub async fn wait_for_background_tasks(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn timing(&self, name: &str, repo: &str) -> Timing {
        Timing::start(&self.metrics, format!("{METRICS_PREFIX}{name}"), repo_tags(repo))
    }

    fn increment(&self, name: &str, repo: &str) {
        self.metrics
            .increment(&format!("{METRICS_PREFIX}{name}"), &repo_tags(repo));
    }

    /// Run `body` while holding the environment lock for `rd`.
    ///
    /// The body runs on its own task and receives a child of `ctx` that is
    /// cancelled on preemption. If the context is cancelled first, the body
    /// task is aborted and joined, then the environment is marked `Cancelled`
    /// before the lock is released.
    async fn locking_operation<T, F, Fut>(
        &self,
        ctx: &OpContext,
        rd: &RepoRevisionData,
        event: &str,
        body: F,
    ) -> Result<T, LifecycleError>
    where
        F: FnOnce(OpContext) -> Fut,
        Fut: Future<Output = Result<T, LifecycleError>> + Send + 'static,
        T: Send + 'static,
    {
        let op = ctx.child();
        let lock_wait = self.timing("lock_wait", &rd.repo);
        let mut locker = self.lockers.locker(&rd.repo, rd.pull_request, event);
        let acquired = tokio::select! {
            acquired = locker.lock() => acquired.map_err(LifecycleError::from),
            () = op.cancelled() => Err(LifecycleError::LockAbandoned(op.reason_text())),
        };
        lock_wait.finish(&[success_tag(acquired.is_ok())]);
        let preempted = acquired?;

        let watcher = {
            let op = op.clone();
            let metrics = Arc::clone(&self.metrics);
            let repo = rd.repo.clone();
            let pull_request = rd.pull_request;
            tokio::spawn(async move {
                tokio::select! {
                    payload = preempted => {
                        if let Ok(payload) = payload {
                            metrics.increment(&format!("{METRICS_PREFIX}lock_preempt"), &repo_tags(&repo));
                            warn!(repo = %repo, pull_request, reason = %payload, "Operation preempted");
                            op.cancel(CancelReason::Preempted(payload.message));
                        }
                    }
                    () = op.cancelled() => {}
                }
            })
        };

        let operation = self.timing("operation", &rd.repo);
        let mut task = tokio::spawn(body(op.clone()));
        let result = tokio::select! {
            joined = &mut task => {
                if op.is_cancelled() {
                    Err(LifecycleError::Cancelled(op.reason_text()))
                } else {
                    joined.unwrap_or_else(|e| Err(e.into()))
                }
            }
            () = op.cancelled() => {
                // the body must not touch the environment once it is marked cancelled
                task.abort();
                if let Err(e) = (&mut task).await {
                    if !e.is_cancelled() {
                        warn!(repo = %rd.repo, pull_request = rd.pull_request, error = %e, "Cancelled operation task failed");
                    }
                }
                Err(LifecycleError::Cancelled(op.reason_text()))
            }
        };

        if result.as_ref().is_err_and(LifecycleError::is_cancelled) {
            self.mark_cancelled(&op, rd).await;
        }
        watcher.abort();
        match tokio::time::timeout(RELEASE_TIMEOUT, locker.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(repo = %rd.repo, pull_request = rd.pull_request, error = %e, "Error releasing lock"),
            Err(_) => warn!(repo = %rd.repo, pull_request = rd.pull_request, "Timed out releasing lock"),
        }

        let (user_error, system_error) = match &result {
            Err(e) if !e.is_cancelled() => {
                error!(
                    repo = %rd.repo,
                    pull_request = rd.pull_request,
                    user_error = e.is_user_error(),
                    system_error = e.is_system_error(),
                    error = %e,
                    "Operation error"
                );
                (e.is_user_error(), e.is_system_error())
            }
            Err(e) => {
                info!(repo = %rd.repo, pull_request = rd.pull_request, reason = %e, "Operation cancelled");
                (false, false)
            }
            Ok(_) => (false, false),
        };
        operation.finish(&[
            success_tag(result.is_ok()),
            format!("user_error:{user_error}"),
            format!("system_error:{system_error}"),
        ]);
        result
    }

    /// Move the extant environment to `Cancelled`.
    async fn mark_cancelled(&self, op: &OpContext, rd: &RepoRevisionData) {
        match self.getenv(rd).await {
            Ok(env) => match self
                .data
                .set_environment_status(&env.name, EnvironmentStatus::Cancelled)
                .await
            {
                Ok(()) => {
                    info!(env = %env.name, reason = %op.reason_text(), "Environment cancelled");
                    self.add_event(&env.name, &format!("operation {} cancelled: {}", op.id(), op.reason_text()))
                        .await;
                }
                Err(e) => error!(env = %env.name, error = %e, "Error persisting cancelled status after cancellation"),
            },
            Err(e) => debug!(repo = %rd.repo, pull_request = rd.pull_request, error = %e, "No environment to mark cancelled"),
        }
        self.complete_operation(op, OperationStatus::Cancelled).await;
    }

    /// The single extant environment for `rd`.
    async fn getenv(&self, rd: &RepoRevisionData) -> Result<Environment, LifecycleError> {
        let mut envs = self
            .data
            .get_extant_environments(&rd.repo, rd.pull_request)
            .await
            .step("error getting extant environments")?;
        if envs.len() != 1 {
            debug!(
                repo = %rd.repo,
                pull_request = rd.pull_request,
                found = envs.len(),
                "Expected exactly one extant environment"
            );
            return Err(LifecycleError::ExtantEnvironments { found: envs.len() });
        }
        Ok(envs.remove(0))
    }

    async fn start_operation(&self, op: &OpContext, kind: OperationKind, env_name: &str, rd: &RepoRevisionData) {
        if let Err(e) = self
            .data
            .save_operation(&OperationRecord::new(op.id(), kind, env_name, rd))
            .await
        {
            warn!(operation = %op.id(), error = %e, "Error saving operation record");
        }
        self.add_event(env_name, &format!("{kind} operation {} started", op.id()))
            .await;
    }

    async fn complete_operation(&self, op: &OpContext, status: OperationStatus) {
        if let Err(e) = self.data.set_operation_status(op.id(), status).await {
            debug!(operation = %op.id(), error = %e, "Error updating operation status");
        }
    }

    /// Append to the environment event log, logging failures.
    async fn add_event(&self, env_name: &str, message: &str) {
        if let Err(e) = self.data.add_event(env_name, message).await {
            warn!(env = %env_name, error = %e, "Error adding environment event");
        }
    }
}
