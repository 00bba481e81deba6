//! Notifications and commit statuses. Both are best effort: failures are
//! logged and recorded on the environment, never returned.

use tracing::{debug, warn};

use super::{Manager, NewEnv};
use crate::commit_status::{CommitStatus, CommitStatusTemplate, CommitStatusUpdate};
use crate::context::OpContext;
use crate::models::RepoRevisionData;
use crate::notifications::{
    merge_notification_defaults, Notification, NotificationData, NotificationEvent, Notifications,
};

impl Manager {
    /// Namespace of an environment, or a placeholder describing why it is unknown.
    pub(super) async fn namespace_name(&self, env_name: &str) -> String {
        match self.data.get_cluster_environment(env_name).await {
            Ok(Some(ce)) => ce.namespace,
            Ok(None) => "<cluster environment not found>".to_string(),
            Err(e) => format!("<error getting namespace: {e}>"),
        }
    }

    /// The repository's notification settings merged over the server defaults.
    pub(super) fn notifications_for(&self, ne: &NewEnv) -> Notifications {
        ne.rc.as_ref().map_or_else(
            || self.config.default_notifications.clone(),
            |rc| merge_notification_defaults(&rc.notifications, &self.config.default_notifications),
        )
    }

    async fn notification_data(&self, ne: &NewEnv, event: &str, error: Option<&str>) -> NotificationData {
        let env = &ne.env;
        let commit_message = match self.repo.get_commit_message(&env.repo, &env.source_sha).await {
            Ok(msg) => msg,
            Err(e) => format!("<error getting commit message: {e}>"),
        };
        NotificationData {
            env_name: env.name.clone(),
            repo: env.repo.clone(),
            pull_request: env.pull_request,
            source_branch: env.source_branch.clone(),
            source_sha: env.source_sha.clone(),
            base_branch: env.base_branch.clone(),
            base_sha: env.base_sha.clone(),
            user: env.user.clone(),
            namespace: self.namespace_name(&env.name).await,
            commit_message,
            error_message: error.unwrap_or_default().to_string(),
            event: event.to_string(),
        }
    }

    /// Fan a notification out to the environment's configured sinks.
    pub(super) async fn push_notification(&self, ne: &NewEnv, event: NotificationEvent, error: Option<&str>) {
        let notifications = self.notifications_for(ne);
        let notification = Notification {
            event,
            data: self.notification_data(ne, event.key(), error).await,
            template: notifications.templates.get(event.key()).cloned(),
        };
        let router = self.notifiers.router(&notifications, &ne.env.user);
        if let Err(e) = router.fan_out(&notification).await {
            warn!(env = %ne.env.name, event = event.key(), error = %e, "Error pushing notification");
            self.add_event(&ne.env.name, &format!("error pushing {} notification: {e}", event.key()))
                .await;
        }
    }

    /// Render and publish a commit status for the triggering commit.
    pub(super) async fn set_commit_status(
        &self,
        op: &OpContext,
        rd: &RepoRevisionData,
        ne: &NewEnv,
        status: CommitStatus,
        error: Option<&str>,
    ) {
        let template = self
            .notifications_for(ne)
            .github
            .commit_statuses
            .templates
            .get(status.key())
            .cloned()
            .unwrap_or_else(|| CommitStatusTemplate::default_for(status));
        let data = self.notification_data(ne, status.key(), error).await;
        let rendered = match template.render(&data) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(env = %ne.env.name, status = %status, error = %e, "Error rendering commit status template");
                self.add_event(&ne.env.name, &format!("error rendering commit status: {e}"))
                    .await;
                return;
            }
        };
        if let Err(e) = self.data.set_operation_rendered_status(op.id(), &rendered).await {
            debug!(operation = %op.id(), error = %e, "Error saving rendered commit status");
        }

        let target_url = self.config.ui_base_url.as_ref().map_or_else(
            || rendered.target_url.clone(),
            |base| format!("{base}/ui/event/status?id={}", op.id()),
        );
        let update = CommitStatusUpdate {
            context: self.config.commit_status_context.clone(),
            status,
            description: rendered.description,
            target_url,
        };
        if let Err(e) = self.repo.set_status(&rd.repo, &rd.source_sha, &update).await {
            warn!(repo = %rd.repo, sha = %rd.source_sha, status = %status, error = %e, "Error setting commit status");
            self.add_event(&ne.env.name, &format!("error setting {status} commit status: {e}"))
                .await;
        }
    }
}
