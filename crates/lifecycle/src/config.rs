//! Configuration for the lifecycle manager.

use std::env;
use std::time::Duration;

use locker::DEFAULT_LOCK_WAIT;

use crate::error::ConfigError;
use crate::notifications::Notifications;

/// Default bound on a whole create or update.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default bound on a detached namespace deletion, all attempts included.
pub const DEFAULT_NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default number of namespace deletion attempts.
pub const DEFAULT_NAMESPACE_DELETE_ATTEMPTS: u32 = 3;

/// Lifecycle manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum running environments; zero disables the limit.
    pub global_limit: u32,
    /// Maximum duration of a create or update.
    pub operation_timeout: Duration,
    /// Maximum wait for an environment lock.
    pub lock_wait: Duration,
    /// Maximum duration of a background namespace deletion.
    pub namespace_delete_timeout: Duration,
    /// Namespace deletion attempts before giving up.
    pub namespace_delete_attempts: u32,
    /// When set, commit statuses link to the operation's status page here.
    pub ui_base_url: Option<String>,
    /// Context label on commit statuses.
    pub commit_status_context: String,
    /// Server-wide notification defaults.
    pub default_notifications: Notifications,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            global_limit: 0,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            lock_wait: DEFAULT_LOCK_WAIT,
            namespace_delete_timeout: DEFAULT_NAMESPACE_DELETE_TIMEOUT,
            namespace_delete_attempts: DEFAULT_NAMESPACE_DELETE_ATTEMPTS,
            ui_base_url: None,
            commit_status_context: "preview".to_string(),
            default_notifications: Notifications::default(),
        }
    }
}

impl ManagerConfig {
    /// Read `PREVIEW_*` environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a set but unparseable variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a set but unparseable variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("PREVIEW_GLOBAL_LIMIT") {
            config.global_limit = parse("PREVIEW_GLOBAL_LIMIT", &v)?;
        }
        if let Some(v) = get("PREVIEW_OPERATION_TIMEOUT_SECS") {
            config.operation_timeout = secs("PREVIEW_OPERATION_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("PREVIEW_LOCK_WAIT_SECS") {
            config.lock_wait = secs("PREVIEW_LOCK_WAIT_SECS", &v)?;
        }
        if let Some(v) = get("PREVIEW_NAMESPACE_DELETE_TIMEOUT_SECS") {
            config.namespace_delete_timeout = secs("PREVIEW_NAMESPACE_DELETE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("PREVIEW_NAMESPACE_DELETE_ATTEMPTS") {
            config.namespace_delete_attempts = parse("PREVIEW_NAMESPACE_DELETE_ATTEMPTS", &v)?;
            if config.namespace_delete_attempts == 0 {
                return Err(ConfigError::Invalid {
                    var: "PREVIEW_NAMESPACE_DELETE_ATTEMPTS",
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if let Some(v) = get("PREVIEW_UI_BASE_URL") {
            config.ui_base_url = Some(v.trim_end_matches('/').to_string());
        }
        if let Some(v) = get("PREVIEW_COMMIT_STATUS_CONTEXT") {
            config.commit_status_context = v;
        }
        if let Some(v) = get("PREVIEW_DEFAULT_NOTIFICATIONS") {
            config.default_notifications =
                serde_json::from_str(&v).map_err(|e| ConfigError::Invalid {
                    var: "PREVIEW_DEFAULT_NOTIFICATIONS",
                    message: e.to_string(),
                })?;
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        message: e.to_string(),
    })
}

fn secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(var, value).map(Duration::from_secs)
}
