//! Commit statuses reported back to the triggering pull request.

use std::collections::BTreeMap;
use std::fmt;

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

use crate::notifications::NotificationData;

/// Commit status states, from the environment's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    /// The environment is ready
    Success,
    /// The environment is being created or updated
    Pending,
    /// Creation or update failed
    Failure,
}

impl CommitStatus {
    /// Key used for template lookup and as the reported state.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Pending => "pending",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// User supplied commit status templates, keyed by [`CommitStatus::key`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatuses {
    #[serde(default)]
    pub templates: BTreeMap<String, CommitStatusTemplate>,
}

/// Handlebars templates for a commit status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatusTemplate {
    pub description: String,
    pub target_url: String,
}

/// A rendered commit status template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedCommitStatus {
    pub description: String,
    pub target_url: String,
}

impl CommitStatusTemplate {
    /// Built-in template used when the repository does not provide one.
    #[must_use]
    pub fn default_for(status: CommitStatus) -> Self {
        let description = match status {
            CommitStatus::Success => "Environment {{env_name}} is ready",
            CommitStatus::Pending => "Environment {{env_name}} is being built",
            CommitStatus::Failure => "Environment {{env_name}} failed: {{error_message}}",
        };
        Self {
            description: description.to_string(),
            target_url: "https://github.com/{{repo}}/pull/{{pull_request}}".to_string(),
        }
    }

    /// Render both fields against `data`.
    ///
    /// # Errors
    ///
    /// Returns the handlebars error if either template fails to parse or render.
    pub fn render(&self, data: &NotificationData) -> Result<RenderedCommitStatus, handlebars::RenderError> {
        let mut hb = Handlebars::new();
        // statuses are plain text, not HTML
        hb.register_escape_fn(handlebars::no_escape);
        Ok(RenderedCommitStatus {
            description: hb.render_template(&self.description, data)?,
            target_url: hb.render_template(&self.target_url, data)?,
        })
    }
}

/// A commit status as sent to the repository host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatusUpdate {
    /// Label that groups statuses from this system
    pub context: String,
    pub status: CommitStatus,
    pub description: String,
    pub target_url: String,
}
