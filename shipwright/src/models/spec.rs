//! Deployment specification
//!
//! A `DeploymentSpec` is read once from JSON at the start of a run and never
//! mutated afterwards.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::filesys::owner::Ownership;
use crate::storage::layout::DeployLayout;

/// What the run should do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployAction {
    #[default]
    Deploy,
    Rollback,
}

impl std::str::FromStr for DeployAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deploy" => Ok(DeployAction::Deploy),
            "rollback" => Ok(DeployAction::Rollback),
            _ => Err(format!("Invalid action: {}", s)),
        }
    }
}

/// Raw SCM configuration as it appears in the deployment file.
///
/// `scm_type` is validated into a closed set by `ScmSource::from_spec`.
#[derive(Debug, Deserialize)]
pub struct ScmConfig {
    /// One of `git`, `svn`, `archive`, `s3`, `none`
    pub scm_type: String,

    /// Repository or download URL
    #[serde(default)]
    pub repository: Option<String>,

    /// Branch, tag, commit or svn revision
    #[serde(default)]
    pub revision: Option<String>,

    /// Username for svn
    #[serde(default)]
    pub user: Option<String>,

    /// Password for svn
    #[serde(default)]
    pub password: Option<SecretString>,

    /// Private key installed for the deploy user before a git checkout
    #[serde(default)]
    pub ssh_key: Option<SecretString>,

    /// Object storage bucket
    #[serde(default)]
    pub bucket: Option<String>,

    /// Object storage key
    #[serde(default)]
    pub key: Option<String>,

    /// Object storage region
    #[serde(default)]
    pub region: Option<String>,
}

impl ScmConfig {
    /// A config of the given type with every locator unset
    pub fn of_type(scm_type: impl Into<String>) -> Self {
        Self {
            scm_type: scm_type.into(),
            repository: None,
            revision: None,
            user: None,
            password: None,
            ssh_key: None,
            bucket: None,
            key: None,
            region: None,
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// Everything needed to deploy one application to this host
#[derive(Debug, Deserialize)]
pub struct DeploymentSpec {
    /// Application identifier, also used for the service unit name
    pub application: String,

    /// Deploy root
    pub deploy_to: PathBuf,

    /// Deploy user
    #[serde(default)]
    pub user: Option<String>,

    /// Deploy group
    #[serde(default)]
    pub group: Option<String>,

    /// Home directory of the deploy user, used as `HOME` during checkout
    #[serde(default)]
    pub home: Option<PathBuf>,

    /// Source control; absent means the source is provisioned elsewhere
    #[serde(default)]
    pub scm: Option<ScmConfig>,

    /// Environment passed to every command the run executes
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// How many releases to keep on disk; unbounded when unset
    #[serde(default)]
    pub keep_releases: Option<usize>,

    #[serde(default)]
    pub delete_cached_copy: bool,

    #[serde(default)]
    pub shallow_clone: bool,

    #[serde(default)]
    pub enable_submodules: bool,

    #[serde(default)]
    pub ssl_support: bool,

    #[serde(default)]
    pub auto_npm_install_on_deploy: bool,

    /// Domains the application answers on; no domains skips the build
    #[serde(default)]
    pub domains: Vec<String>,

    /// Domain used for `ROOT_URL`; defaults to the first domain
    #[serde(default)]
    pub domain_name: Option<String>,

    #[serde(default)]
    pub mongo_url: Option<String>,

    /// Run `migrate_command` during the migrate stage
    #[serde(default)]
    pub migrate: bool,

    #[serde(default)]
    pub migrate_command: Option<String>,

    /// `shared/<key>` is linked to `release/<value>` before migrating
    #[serde(default)]
    pub symlink_before_migrate: BTreeMap<String, String>,

    #[serde(default)]
    pub action: DeployAction,
}

impl DeploymentSpec {
    /// A minimal spec with no SCM and every flag off
    pub fn new(application: impl Into<String>, deploy_to: impl Into<PathBuf>) -> Self {
        Self {
            application: application.into(),
            deploy_to: deploy_to.into(),
            user: None,
            group: None,
            home: None,
            scm: None,
            environment: BTreeMap::new(),
            keep_releases: None,
            delete_cached_copy: false,
            shallow_clone: false,
            enable_submodules: false,
            ssl_support: false,
            auto_npm_install_on_deploy: false,
            domains: Vec::new(),
            domain_name: None,
            mongo_url: None,
            migrate: false,
            migrate_command: None,
            symlink_before_migrate: BTreeMap::new(),
            action: DeployAction::Deploy,
        }
    }

    pub fn layout(&self) -> DeployLayout {
        DeployLayout::new(&self.deploy_to)
    }

    pub fn ownership(&self) -> Ownership {
        Ownership::new(self.user.clone(), self.group.clone())
    }

    /// The domain `ROOT_URL` is built from, if any domain is configured
    pub fn primary_domain(&self) -> Option<&str> {
        if self.domains.is_empty() {
            return None;
        }
        self.domain_name
            .as_deref()
            .or_else(|| self.domains.first().map(|d| d.as_str()))
    }

    /// Check the fields that have no sensible default
    pub fn validate(&self) -> Result<(), crate::errors::DeployError> {
        use crate::errors::DeployError;

        if self.application.trim().is_empty() {
            return Err(DeployError::InvalidSpec("application is empty".to_string()));
        }
        if !self.deploy_to.is_absolute() {
            return Err(DeployError::InvalidSpec(format!(
                "deploy_to must be absolute: {}",
                self.deploy_to.display()
            )));
        }
        if self.migrate && self.migrate_command.is_none() {
            return Err(DeployError::InvalidSpec(
                "migrate is set without migrate_command".to_string(),
            ));
        }
        for (shared, target) in &self.symlink_before_migrate {
            for path in [shared, target] {
                if !is_contained(path) {
                    return Err(DeployError::InvalidSpec(format!(
                        "symlink_before_migrate path must stay inside its directory: {:?}",
                        path
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A non-empty relative path without `..` components
fn is_contained(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && path.components().any(|c| matches!(c, Component::Normal(_)))
}
