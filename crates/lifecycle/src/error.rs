//! Error types for environment lifecycle operations.
//!
//! Collaborator failures each have their own type. They are folded into
//! [`LifecycleError`], which carries the step that failed and classifies the
//! failure as a lock problem, a cancellation, a user error or a system error.

use locker::LockError;
use thiserror::Error;

/// Errors returned by the persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// No record with this name exists
    #[error("environment not found: {0}")]
    NotFound(String),

    /// No operation record with this id exists
    #[error("operation not found: {0}")]
    OperationNotFound(uuid::Uuid),

    /// A record with this name already exists
    #[error("environment already exists: {0}")]
    Duplicate(String),

    /// Backend failure
    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors resolving or fetching environment configuration.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The configuration is invalid; caused by the repository contents
    #[error("invalid environment config: {0}")]
    Invalid(String),

    /// Two dependencies pin the same repository to different refs
    #[error("conflicting {field} for repo {repo}: {first} vs {second}")]
    Conflict {
        field: &'static str,
        repo: String,
        first: String,
        second: String,
    },

    /// Upstream fetch failed
    #[error("error fetching metadata: {0}")]
    Fetch(String),

    /// Filesystem failure while staging artifacts
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the cluster chart installer.
#[derive(Debug, Error)]
pub enum InstallError {
    /// A chart failed to build or install; caused by the chart contents
    #[error("chart {chart} failed: {message}")]
    Chart { chart: String, message: String },

    /// The cluster rejected or failed an operation
    #[error("cluster error: {0}")]
    Cluster(String),

    /// The installer observed cancellation and stopped
    #[error("installation cancelled")]
    Cancelled,
}

/// Errors from the source repository client.
#[derive(Debug, Error)]
pub enum RepoError {
    /// The request was rejected upstream
    #[error("repository request failed: {0}")]
    Request(String),

    /// The commit does not exist
    #[error("commit not found: {repo}@{sha}")]
    CommitNotFound { repo: String, sha: String },
}

/// Errors from a notification router.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Delivery to one or more sinks failed
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors generating environment names.
#[derive(Debug, Error)]
pub enum NameError {
    #[error("name generator has no words to draw from")]
    Empty,
}

/// Errors reading manager configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held an unparseable value
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Errors returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The environment lock could not be obtained
    #[error("error getting lock: {0}")]
    Lock(#[from] LockError),

    /// The caller gave up while the operation waited for its lock
    #[error("lock wait abandoned: {0}")]
    LockAbandoned(String),

    /// The operation was preempted, timed out or was cancelled by its caller
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Zero or several extant records where exactly one is required
    #[error("did not find exactly one extant environment (found {found})")]
    ExtantEnvironments { found: usize },

    /// A failure annotated with the step that produced it
    #[error("{context}: {source}")]
    Step {
        context: String,
        #[source]
        source: Box<LifecycleError>,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Name(#[from] NameError),

    /// A commit status template failed to render
    #[error("error rendering template: {0}")]
    Template(#[from] handlebars::RenderError),

    /// Filesystem failure, e.g. creating a scratch directory
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation task panicked
    #[error("operation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl LifecycleError {
    /// The innermost error, with step annotations removed.
    #[must_use]
    pub fn root(&self) -> &Self {
        let mut err = self;
        while let Self::Step { source, .. } = err {
            err = source;
        }
        err
    }

    /// Whether the operation ended because its context was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled(_))
    }

    /// Whether the lock could not be obtained.
    #[must_use]
    pub fn is_lock_error(&self) -> bool {
        matches!(self.root(), Self::Lock(_) | Self::LockAbandoned(_))
    }

    /// Whether the failure was caused by the triggering repository's
    /// contents rather than by the platform.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self.root(),
            Self::Metadata(MetadataError::Invalid(_) | MetadataError::Conflict { .. })
                | Self::Install(InstallError::Chart { .. })
        )
    }

    /// Whether the failure came from the platform or its dependencies.
    #[must_use]
    pub fn is_system_error(&self) -> bool {
        match self.root() {
            Self::Metadata(MetadataError::Fetch(_) | MetadataError::Io(_))
            | Self::Install(InstallError::Cluster(_))
            | Self::ExtantEnvironments { .. }
            | Self::Persistence(_)
            | Self::Repo(_)
            | Self::Notify(_)
            | Self::Name(_)
            | Self::Template(_)
            | Self::Io(_)
            | Self::Task(_) => true,
            _ => false,
        }
    }
}

/// Annotates a failure with the step that produced it.
pub trait StepContext<T> {
    /// Wrap the error, if any, as `"{context}: {error}"`.
    ///
    /// # Errors
    ///
    /// Returns the wrapped error.
    fn step(self, context: &str) -> Result<T, LifecycleError>;
}

impl<T, E> StepContext<T> for Result<T, E>
where
    E: Into<LifecycleError>,
{
    fn step(self, context: &str) -> Result<T, LifecycleError> {
        self.map_err(|e| LifecycleError::Step {
            context: context.to_string(),
            source: Box::new(e.into()),
        })
    }
}
