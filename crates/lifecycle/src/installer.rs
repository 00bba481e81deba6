//! Cluster chart installer contract.
//!
//! Installers own the cluster side of an environment. On success they record
//! the cluster environment (namespace and config signature) and the release
//! rows, and mark the environment `Success`. Every call receives the
//! operation's cancellation token and must stop, without recording success,
//! once it is cancelled.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::InstallError;
use crate::metadata::{ChartLocations, RepoConfig};
use crate::models::{ClusterEnvironment, Environment};

/// Everything an installer needs to build an environment.
#[derive(Debug, Clone)]
pub struct EnvInfo {
    pub env: Environment,
    pub rc: RepoConfig,
    /// Dependency name to existing release name, set for upgrades
    pub releases: BTreeMap<String, String>,
}

#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Build images and install every chart into a fresh namespace.
    async fn build_and_install_charts(
        &self,
        cancel: CancellationToken,
        info: &EnvInfo,
        charts: &ChartLocations,
    ) -> Result<(), InstallError>;

    /// Build images and upgrade the releases in `cluster_env` in place.
    async fn build_and_upgrade_charts(
        &self,
        cancel: CancellationToken,
        info: &EnvInfo,
        cluster_env: &ClusterEnvironment,
        charts: &ChartLocations,
    ) -> Result<(), InstallError>;

    /// Delete the namespace of `cluster_env` and everything in it.
    async fn delete_namespace(
        &self,
        cancel: CancellationToken,
        cluster_env: &ClusterEnvironment,
    ) -> Result<(), InstallError>;
}
