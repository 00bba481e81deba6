//! Resolved environment configuration and the collaborator that produces it.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MetadataError;
use crate::models::RepoRevisionData;
use crate::notifications::Notifications;

/// The application a repository deploys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub chart_path: String,
    #[serde(default)]
    pub chart_repo_path: String,
    #[serde(default)]
    pub chart_vars_path: String,
    #[serde(default)]
    pub value_overrides: Vec<String>,
}

/// A dependency deployed alongside the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    /// Source repository, empty for chart-only dependencies
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub chart_path: String,
    #[serde(default)]
    pub chart_repo_path: String,
    #[serde(default)]
    pub chart_vars_path: String,
    #[serde(default)]
    pub value_overrides: Vec<String>,
    /// Names of dependencies that must be installed first
    #[serde(default)]
    pub requires: Vec<String>,
}

/// Dependencies declared by the repository itself and those inherited from
/// the environment definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub direct: Vec<Dependency>,
    #[serde(default)]
    pub environment: Vec<Dependency>,
}

impl Dependencies {
    pub fn all(&self) -> impl Iterator<Item = &Dependency> {
        self.direct.iter().chain(self.environment.iter())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.direct.len() + self.environment.len()
    }
}

/// Fully resolved configuration for one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub application: AppMetadata,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default)]
    pub notifications: Notifications,
}

/// The chart-shaping projection of a component, hashed for the signature.
#[derive(Serialize)]
struct SignedComponent<'a> {
    name: &'a str,
    repo: &'a str,
    chart_path: &'a str,
    chart_repo_path: &'a str,
    chart_vars_path: &'a str,
    value_overrides: &'a [String],
    requires: &'a [String],
}

impl RepoConfig {
    /// Repository to branch for the application and every dependency.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Conflict`] if one repository is pinned to two
    /// different branches.
    pub fn ref_map(&self) -> Result<BTreeMap<String, String>, MetadataError> {
        self.collect_map("branch", |branch, _sha| branch)
    }

    /// Repository to commit SHA for the application and every dependency.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Conflict`] if one repository is pinned to two
    /// different commits.
    pub fn commit_sha_map(&self) -> Result<BTreeMap<String, String>, MetadataError> {
        self.collect_map("commit SHA", |_branch, sha| sha)
    }

    fn collect_map(
        &self,
        field: &'static str,
        pick: impl for<'a> Fn(&'a str, &'a str) -> &'a str,
    ) -> Result<BTreeMap<String, String>, MetadataError> {
        let mut out = BTreeMap::new();
        let app = &self.application;
        let entries = std::iter::once((app.repo.as_str(), pick(&app.branch, &app.commit_sha)))
            .chain(
                self.dependencies
                    .all()
                    .map(|d| (d.repo.as_str(), pick(&d.branch, &d.commit_sha))),
            );
        for (repo, value) in entries {
            if repo.is_empty() {
                continue;
            }
            match out.entry(repo.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(value.to_string());
                }
                Entry::Occupied(slot) if slot.get() != value => {
                    return Err(MetadataError::Conflict {
                        field,
                        repo: repo.to_string(),
                        first: slot.get().clone(),
                        second: value.to_string(),
                    });
                }
                Entry::Occupied(_) => {}
            }
        }
        Ok(out)
    }

    /// SHA-256 over the parts of the configuration that shape the installed
    /// charts. Branches, commits and notifications are left out, so a new
    /// push alone keeps the signature stable.
    #[must_use]
    pub fn config_signature(&self) -> [u8; 32] {
        let app = &self.application;
        let mut components = vec![SignedComponent {
            name: "",
            repo: &app.repo,
            chart_path: &app.chart_path,
            chart_repo_path: &app.chart_repo_path,
            chart_vars_path: &app.chart_vars_path,
            value_overrides: &app.value_overrides,
            requires: &[],
        }];
        components.extend(self.dependencies.all().map(|d| SignedComponent {
            name: &d.name,
            repo: &d.repo,
            chart_path: &d.chart_path,
            chart_repo_path: &d.chart_repo_path,
            chart_vars_path: &d.chart_vars_path,
            value_overrides: &d.value_overrides,
            requires: &d.requires,
        }));

        let mut hasher = Sha256::new();
        for component in &components {
            // serializing borrowed strings and slices cannot fail
            if let Ok(bytes) = serde_json::to_vec(component) {
                hasher.update(&bytes);
            }
            hasher.update(b"\n");
        }
        hasher.finalize().into()
    }
}

/// Where a fetched chart and its values file landed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartLocation {
    pub chart_path: PathBuf,
    pub var_file_path: PathBuf,
}

/// Chart locations keyed by component name.
pub type ChartLocations = BTreeMap<String, ChartLocation>;

/// Resolves repository configuration and fetches chart artifacts.
#[async_trait]
pub trait MetadataGetter: Send + Sync {
    /// Resolve the configuration for a revision.
    async fn get(&self, rd: &RepoRevisionData) -> Result<RepoConfig, MetadataError>;

    /// Fetch every chart named by `rc` into `scratch_dir`.
    async fn fetch_charts(
        &self,
        rc: &RepoConfig,
        scratch_dir: &Path,
    ) -> Result<ChartLocations, MetadataError>;
}
