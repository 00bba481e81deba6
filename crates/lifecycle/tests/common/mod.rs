//! Fake collaborators for driving the manager against in-memory backends.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lifecycle::commit_status::{CommitStatus, CommitStatusUpdate};
use lifecycle::error::{InstallError, MetadataError, NameError, NotifyError, RepoError};
use lifecycle::installer::{ChartInstaller, EnvInfo};
use lifecycle::metadata::{AppMetadata, ChartLocation, ChartLocations, Dependency, MetadataGetter, RepoConfig};
use lifecycle::metrics::MemoryCollector;
use lifecycle::models::{ClusterEnvironment, Environment, EnvironmentStatus, HelmRelease, RepoRevisionData};
use lifecycle::namegen::NameGenerator;
use lifecycle::notifications::{
    Notification, NotificationEvent, NotificationRouter, NotificationRouterFactory, Notifications,
};
use lifecycle::{Collaborators, DataLayer, Manager, ManagerConfig, MemoryDataLayer};
use locker::MemoryLockProvider;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const REPO: &str = "acme/widgets";

// =============================================================================
// Fixtures
// =============================================================================

pub fn revision(pull_request: u32, sha: &str) -> RepoRevisionData {
    RepoRevisionData {
        user: "octocat".into(),
        repo: REPO.into(),
        pull_request,
        source_sha: sha.into(),
        base_sha: "base0000".into(),
        source_branch: format!("feature-{pull_request}"),
        base_branch: "main".into(),
        source_ref: String::new(),
    }
}

/// A configuration whose signature changes with `chart_vars`.
pub fn repo_config(chart_vars: &str) -> RepoConfig {
    RepoConfig {
        application: AppMetadata {
            repo: REPO.into(),
            branch: "feature".into(),
            commit_sha: "abc123".into(),
            chart_path: ".chart/widgets".into(),
            chart_vars_path: chart_vars.into(),
            ..AppMetadata::default()
        },
        dependencies: lifecycle::metadata::Dependencies {
            direct: vec![Dependency {
                name: "postgres".into(),
                chart_repo_path: "charts/postgres".into(),
                ..Dependency::default()
            }],
            environment: Vec::new(),
        },
        notifications: Notifications::default(),
    }
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        lock_wait: Duration::from_secs(2),
        operation_timeout: Duration::from_secs(30),
        namespace_delete_timeout: Duration::from_secs(5),
        ..ManagerConfig::default()
    }
}

// =============================================================================
// Metadata
// =============================================================================

pub struct FakeMetadata {
    config: Mutex<RepoConfig>,
    failure: Mutex<Option<String>>,
    delays: Mutex<BTreeMap<String, Duration>>,
    pub get_started: Notify,
    pub scratch_dirs: Mutex<Vec<PathBuf>>,
}

impl FakeMetadata {
    fn new() -> Self {
        Self {
            config: Mutex::new(repo_config("values/default.yaml")),
            failure: Mutex::new(None),
            delays: Mutex::new(BTreeMap::new()),
            get_started: Notify::new(),
            scratch_dirs: Mutex::new(Vec::new()),
        }
    }

    pub fn set_config(&self, rc: RepoConfig) {
        *self.config.lock().unwrap() = rc;
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    /// Make `get` take `delay` for revisions at `sha`.
    pub fn delay_get(&self, sha: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(sha.to_string(), delay);
    }

    pub fn scratch_dirs(&self) -> Vec<PathBuf> {
        self.scratch_dirs.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataGetter for FakeMetadata {
    async fn get(&self, rd: &RepoRevisionData) -> Result<RepoConfig, MetadataError> {
        self.get_started.notify_one();
        let delay = self.delays.lock().unwrap().get(&rd.source_sha).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failure.lock().unwrap().clone();
        match failure {
            Some(message) => Err(MetadataError::Invalid(message)),
            None => Ok(self.config.lock().unwrap().clone()),
        }
    }

    async fn fetch_charts(&self, rc: &RepoConfig, scratch_dir: &Path) -> Result<ChartLocations, MetadataError> {
        self.scratch_dirs.lock().unwrap().push(scratch_dir.to_path_buf());
        let mut charts = BTreeMap::new();
        let names = std::iter::once(rc.application.repo.replace('/', "-"))
            .chain(rc.dependencies.all().map(|d| d.name.clone()));
        for name in names {
            let dir = scratch_dir.join(&name);
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join("Chart.yaml"), format!("name: {name}\n"))?;
            std::fs::write(dir.join("values.yaml"), "")?;
            charts.insert(
                name,
                ChartLocation {
                    chart_path: dir.clone(),
                    var_file_path: dir.join("values.yaml"),
                },
            );
        }
        Ok(charts)
    }
}

// =============================================================================
// Installer
// =============================================================================

/// Records calls and persists the cluster side of a successful install the
/// way a real installer would.
/// Leaves the in-flight count when dropped, including when its task is aborted.
struct Leave<'a>(&'a AtomicUsize);

impl Drop for Leave<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeInstaller {
    data: Arc<MemoryDataLayer>,
    calls: Mutex<Vec<String>>,
    running_at_install: Mutex<Vec<Vec<String>>>,
    delay: Mutex<Duration>,
    pub block_until_cancelled: AtomicBool,
    pub fail_install: AtomicBool,
    pub fail_delete_namespace: AtomicBool,
    pub delete_attempts: AtomicUsize,
    pub started: Notify,
    inside: AtomicUsize,
    pub max_inside: AtomicUsize,
    installs: AtomicUsize,
}

impl FakeInstaller {
    fn new(data: Arc<MemoryDataLayer>) -> Self {
        Self {
            data,
            calls: Mutex::new(Vec::new()),
            running_at_install: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            block_until_cancelled: AtomicBool::new(false),
            fail_install: AtomicBool::new(false),
            fail_delete_namespace: AtomicBool::new(false),
            delete_attempts: AtomicUsize::new(0),
            started: Notify::new(),
            inside: AtomicUsize::new(0),
            max_inside: AtomicUsize::new(0),
            installs: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, kind: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(kind)).count()
    }

    /// Names of running environments seen at each install.
    pub fn running_at_install(&self) -> Vec<Vec<String>> {
        self.running_at_install.lock().unwrap().clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn work(&self, cancel: &CancellationToken) -> Result<(), InstallError> {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        let _leave = Leave(&self.inside);
        self.max_inside.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();
        let delay = *self.delay.lock().unwrap();
        if self.block_until_cancelled.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            Err(InstallError::Cancelled)
        } else {
            tokio::select! {
                () = tokio::time::sleep(delay) => Ok(()),
                () = cancel.cancelled() => Err(InstallError::Cancelled),
            }
        }
    }

    async fn finish(&self, info: &EnvInfo, charts: &ChartLocations, namespace: String) -> Result<(), InstallError> {
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(InstallError::Chart {
                chart: "widgets".into(),
                message: "values did not validate".into(),
            });
        }
        let name = &info.env.name;
        let cluster = |e: lifecycle::error::PersistenceError| InstallError::Cluster(e.to_string());
        self.data
            .upsert_cluster_environment(&ClusterEnvironment {
                env_name: name.clone(),
                namespace: namespace.clone(),
                config_signature: info.rc.config_signature().to_vec(),
                updated: Utc::now(),
            })
            .await
            .map_err(cluster)?;
        let releases: Vec<HelmRelease> = charts
            .keys()
            .map(|chart| HelmRelease {
                env_name: name.clone(),
                name: chart.clone(),
                release: info
                    .releases
                    .get(chart)
                    .cloned()
                    .unwrap_or_else(|| format!("{namespace}-{chart}")),
                revision_sha: info.env.source_sha.clone(),
            })
            .collect();
        self.data
            .set_helm_releases_for_env(name, &releases)
            .await
            .map_err(cluster)?;
        self.data
            .set_environment_status(name, EnvironmentStatus::Success)
            .await
            .map_err(cluster)
    }
}

#[async_trait]
impl ChartInstaller for FakeInstaller {
    async fn build_and_install_charts(
        &self,
        cancel: CancellationToken,
        info: &EnvInfo,
        charts: &ChartLocations,
    ) -> Result<(), InstallError> {
        self.record(format!("install:{}", info.env.name));
        let running: Vec<String> = self
            .data
            .get_running_environments()
            .await
            .map_err(|e| InstallError::Cluster(e.to_string()))?
            .into_iter()
            .map(|e| e.name)
            .collect();
        self.running_at_install.lock().unwrap().push(running);
        self.work(&cancel).await?;
        let n = self.installs.fetch_add(1, Ordering::SeqCst) + 1;
        self.finish(info, charts, format!("preview-{}-{n}", info.env.name))
            .await
    }

    async fn build_and_upgrade_charts(
        &self,
        cancel: CancellationToken,
        info: &EnvInfo,
        cluster_env: &ClusterEnvironment,
        charts: &ChartLocations,
    ) -> Result<(), InstallError> {
        self.record(format!("upgrade:{}", info.env.name));
        self.work(&cancel).await?;
        self.finish(info, charts, cluster_env.namespace.clone()).await
    }

    async fn delete_namespace(
        &self,
        _cancel: CancellationToken,
        cluster_env: &ClusterEnvironment,
    ) -> Result<(), InstallError> {
        self.record(format!("delete_namespace:{}", cluster_env.namespace));
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete_namespace.load(Ordering::SeqCst) {
            return Err(InstallError::Cluster("namespace stuck terminating".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Repository, notifications, names
// =============================================================================

#[derive(Default)]
pub struct RecordingRepo {
    statuses: Mutex<Vec<(String, CommitStatusUpdate)>>,
}

impl RecordingRepo {
    /// Commit statuses set, in order.
    pub fn statuses(&self) -> Vec<CommitStatus> {
        self.statuses.lock().unwrap().iter().map(|(_, s)| s.status).collect()
    }

    pub fn updates(&self) -> Vec<(String, CommitStatusUpdate)> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl lifecycle::repo::RepoClient for RecordingRepo {
    async fn get_commit_message(&self, _repo: &str, sha: &str) -> Result<String, RepoError> {
        Ok(format!("commit {sha}"))
    }

    async fn set_status(&self, _repo: &str, sha: &str, status: &CommitStatusUpdate) -> Result<(), RepoError> {
        self.statuses.lock().unwrap().push((sha.to_string(), status.clone()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.sent().iter().map(|n| n.event).collect()
    }

    pub fn events_for(&self, env_name: &str) -> Vec<NotificationEvent> {
        self.sent()
            .iter()
            .filter(|n| n.data.env_name == env_name)
            .map(|n| n.event)
            .collect()
    }
}

#[async_trait]
impl NotificationRouter for RecordingNotifier {
    async fn fan_out(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

impl NotificationRouterFactory for RecordingNotifier {
    fn router(&self, _notifications: &Notifications, _user: &str) -> Arc<dyn NotificationRouter> {
        Arc::new(self.clone())
    }
}

/// Names environments `env-1`, `env-2`, ...
#[derive(Default)]
pub struct SequentialNames {
    next: AtomicUsize,
}

impl NameGenerator for SequentialNames {
    fn generate(&self) -> Result<String, NameError> {
        Ok(format!("env-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub manager: Manager,
    pub data: Arc<MemoryDataLayer>,
    pub metadata: Arc<FakeMetadata>,
    pub installer: Arc<FakeInstaller>,
    pub repo: Arc<RecordingRepo>,
    pub notifier: RecordingNotifier,
    pub metrics: Arc<MemoryCollector>,
    pub locks: MemoryLockProvider,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let data = Arc::new(MemoryDataLayer::new());
        let metadata = Arc::new(FakeMetadata::new());
        let installer = Arc::new(FakeInstaller::new(Arc::clone(&data)));
        let repo = Arc::new(RecordingRepo::default());
        let notifier = RecordingNotifier::default();
        let metrics = Arc::new(MemoryCollector::new());
        let locks = MemoryLockProvider::default();
        let manager = Manager::new(
            config,
            Collaborators {
                data: data.clone(),
                repo: repo.clone(),
                metadata: metadata.clone(),
                installer: installer.clone(),
                names: Arc::new(SequentialNames::default()),
                metrics: metrics.clone(),
                notifiers: Arc::new(notifier.clone()),
            },
            Arc::new(locks.clone()),
        );
        Self {
            manager,
            data,
            metadata,
            installer,
            repo,
            notifier,
            metrics,
            locks,
        }
    }

    /// Insert a record directly, `age` old, in `status`.
    pub async fn seed_environment(
        &self,
        name: &str,
        pull_request: u32,
        status: EnvironmentStatus,
        age: chrono::Duration,
    ) -> Environment {
        let mut env = Environment::new(name, &revision(pull_request, "seed"), Utc::now() - age);
        env.status = status;
        self.data.create_environment(&env).await.unwrap();
        env
    }

    pub async fn env(&self, name: &str) -> Environment {
        self.data.get_environment(name).await.unwrap().unwrap()
    }

    pub async fn cluster_env(&self, name: &str) -> Option<ClusterEnvironment> {
        self.data.get_cluster_environment(name).await.unwrap()
    }
}
