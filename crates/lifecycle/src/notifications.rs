//! Lifecycle notifications.
//!
//! Repositories configure where notifications go (Slack channels and users,
//! GitHub pull request comments and commit statuses) and how they read. The
//! server supplies defaults for anything a repository leaves unset; the two
//! are combined by [`merge_notification_defaults`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::commit_status::CommitStatuses;
use crate::error::NotifyError;

/// Lifecycle events that produce notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationEvent {
    CreateEnvironment,
    UpdateEnvironment,
    DestroyEnvironment,
    Success,
    Failure,
}

impl NotificationEvent {
    /// Stable key used for template lookup.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::CreateEnvironment => "create",
            Self::UpdateEnvironment => "update",
            Self::DestroyEnvironment => "destroy",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateEnvironment => "Create Environment",
            Self::UpdateEnvironment => "Update Environment",
            Self::DestroyEnvironment => "Destroy Environment",
            Self::Success => "Environment Ready",
            Self::Failure => "Environment Error",
        })
    }
}

/// Values available to notification and commit status templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    pub env_name: String,
    pub repo: String,
    pub pull_request: u32,
    pub source_branch: String,
    pub source_sha: String,
    pub base_branch: String,
    pub base_sha: String,
    pub user: String,
    pub namespace: String,
    pub commit_message: String,
    pub error_message: String,
    pub event: String,
}

/// Per-event message template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub title: String,
    #[serde(default)]
    pub sections: Vec<NotificationSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSection {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackNotifications {
    pub channels: Option<Vec<String>>,
    pub users: Option<Vec<String>>,
    pub disable_direct_messages: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubNotifications {
    pub pr_comments: Option<bool>,
    #[serde(default)]
    pub commit_statuses: CommitStatuses,
}

/// Notification configuration for one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notifications {
    #[serde(default)]
    pub slack: SlackNotifications,
    #[serde(default)]
    pub github: GitHubNotifications,
    /// Templates keyed by [`NotificationEvent::key`]
    #[serde(default)]
    pub templates: BTreeMap<String, NotificationTemplate>,
}

/// Fill every field `repo` leaves unset from `defaults`.
///
/// Options take the default when `None`; template maps gain the default
/// entries for keys the repository does not define. Neither input changes.
#[must_use]
pub fn merge_notification_defaults(repo: &Notifications, defaults: &Notifications) -> Notifications {
    fn merge_map<V: Clone>(repo: &BTreeMap<String, V>, defaults: &BTreeMap<String, V>) -> BTreeMap<String, V> {
        let mut out = defaults.clone();
        out.extend(repo.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    Notifications {
        slack: SlackNotifications {
            channels: repo.slack.channels.clone().or_else(|| defaults.slack.channels.clone()),
            users: repo.slack.users.clone().or_else(|| defaults.slack.users.clone()),
            disable_direct_messages: repo
                .slack
                .disable_direct_messages
                .or(defaults.slack.disable_direct_messages),
        },
        github: GitHubNotifications {
            pr_comments: repo.github.pr_comments.or(defaults.github.pr_comments),
            commit_statuses: CommitStatuses {
                templates: merge_map(
                    &repo.github.commit_statuses.templates,
                    &defaults.github.commit_statuses.templates,
                ),
            },
        },
        templates: merge_map(&repo.templates, &defaults.templates),
    }
}

/// A notification ready to be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: NotificationEvent,
    pub data: NotificationData,
    pub template: Option<NotificationTemplate>,
}

/// Delivers a notification to every configured sink.
#[async_trait]
pub trait NotificationRouter: Send + Sync {
    async fn fan_out(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Builds a router for one repository's merged configuration.
pub trait NotificationRouterFactory: Send + Sync {
    fn router(&self, notifications: &Notifications, user: &str) -> Arc<dyn NotificationRouter>;
}

/// Router that only logs.
#[derive(Debug, Clone, Default)]
pub struct LogRouter;

#[async_trait]
impl NotificationRouter for LogRouter {
    async fn fan_out(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(
            event = n.event.key(),
            env = %n.data.env_name,
            repo = %n.data.repo,
            pull_request = n.data.pull_request,
            error = %n.data.error_message,
            "{}",
            n.event
        );
        Ok(())
    }
}

impl NotificationRouterFactory for LogRouter {
    fn router(&self, _notifications: &Notifications, _user: &str) -> Arc<dyn NotificationRouter> {
        Arc::new(Self)
    }
}
