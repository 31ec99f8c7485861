//! SCM Resolver
//!
//! Turns the deployment's SCM configuration into a refreshed cached copy at
//! `<deploy_to>/shared/cached-copy`. Archive and object storage sources are
//! first staged as a local git repository, so the checkout step only ever
//! sees git, subversion, or nothing.

pub mod archive;
pub mod client;
pub mod home;

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::models::spec::{DeploymentSpec, ScmConfig};
use crate::storage::layout::DeployLayout;

use self::archive::Downloader;
use self::client::{GitCheckout, ScmClient, SvnCheckout};
use self::home::HomeOverride;

const DEFAULT_GIT_REVISION: &str = "HEAD";
const DEFAULT_SVN_REVISION: &str = "HEAD";

/// A git source
#[derive(Debug)]
pub struct GitSource<'a> {
    pub repository: Cow<'a, str>,
    pub revision: Cow<'a, str>,
    pub ssh_key: Option<&'a SecretString>,
}

/// A subversion source
#[derive(Debug)]
pub struct SvnSource<'a> {
    pub repository: &'a str,
    pub revision: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a SecretString>,
}

/// Every SCM variant a spec may name
#[derive(Debug)]
pub enum ScmSource<'a> {
    Git(GitSource<'a>),
    Subversion(SvnSource<'a>),
    Archive { url: &'a str },
    ObjectStorage { url: String },
    None,
}

/// A source the checkout step can act on directly
#[derive(Debug)]
pub enum CheckoutSource<'a> {
    Git(GitSource<'a>),
    Subversion(SvnSource<'a>),
    None,
}

impl CheckoutSource<'_> {
    pub fn variant(&self) -> &'static str {
        match self {
            CheckoutSource::Git(_) => "git",
            CheckoutSource::Subversion(_) => "svn",
            CheckoutSource::None => "none",
        }
    }
}

fn required<'a>(config: &'a ScmConfig, field: Option<&'a String>, name: &str) -> Result<&'a str, DeployError> {
    field
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            DeployError::InvalidSpec(format!("scm type {} requires {}", config.scm_type, name))
        })
}

impl<'a> ScmSource<'a> {
    /// Validate the SCM configuration into a closed variant.
    ///
    /// Performs no I/O, so an unsupported type is reported before anything on
    /// disk changes.
    pub fn from_spec(spec: &'a DeploymentSpec) -> Result<Self, DeployError> {
        let Some(config) = spec.scm.as_ref() else {
            return Ok(ScmSource::None);
        };

        let source = match config.scm_type.as_str() {
            "git" => ScmSource::Git(GitSource {
                repository: Cow::Borrowed(required(config, config.repository.as_ref(), "repository")?),
                revision: Cow::Borrowed(
                    config.revision.as_deref().unwrap_or(DEFAULT_GIT_REVISION),
                ),
                ssh_key: config.ssh_key.as_ref(),
            }),
            "svn" | "subversion" => ScmSource::Subversion(SvnSource {
                repository: required(config, config.repository.as_ref(), "repository")?,
                revision: config.revision.as_deref().unwrap_or(DEFAULT_SVN_REVISION),
                username: config.user.as_deref(),
                password: config.password.as_ref(),
            }),
            "archive" => ScmSource::Archive {
                url: required(config, config.repository.as_ref(), "repository")?,
            },
            "s3" => {
                let url = match config.repository.as_deref().filter(|r| !r.is_empty()) {
                    Some(url) => url.to_string(),
                    None => archive::object_storage_url(
                        required(config, config.bucket.as_ref(), "bucket")?,
                        required(config, config.key.as_ref(), "key")?,
                        config.region.as_deref(),
                    ),
                };
                ScmSource::ObjectStorage { url }
            }
            "none" => ScmSource::None,
            other => return Err(DeployError::UnsupportedScmVariant(other.to_string())),
        };

        Ok(source)
    }

    pub fn variant(&self) -> &'static str {
        match self {
            ScmSource::Git(_) => "git",
            ScmSource::Subversion(_) => "svn",
            ScmSource::Archive { .. } => "archive",
            ScmSource::ObjectStorage { .. } => "s3",
            ScmSource::None => "none",
        }
    }
}

/// The refreshed working tree of an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCopy {
    pub path: PathBuf,
    pub variant: &'static str,
}

impl CachedCopy {
    pub fn dir(&self) -> Dir {
        Dir::new(&self.path)
    }
}

/// Resolves SCM sources into the cached copy
#[derive(Clone)]
pub struct ScmResolver {
    client: Arc<dyn ScmClient>,
    downloader: Downloader,
}

impl ScmResolver {
    pub fn new(client: Arc<dyn ScmClient>) -> Self {
        Self {
            client,
            downloader: Downloader::new(),
        }
    }

    /// Stage archive and object storage sources as a local git repository
    pub async fn normalize<'a>(
        &self,
        source: ScmSource<'a>,
        layout: &DeployLayout,
    ) -> Result<CheckoutSource<'a>, DeployError> {
        let url = match source {
            ScmSource::Git(git) => return Ok(CheckoutSource::Git(git)),
            ScmSource::Subversion(svn) => return Ok(CheckoutSource::Subversion(svn)),
            ScmSource::None => return Ok(CheckoutSource::None),
            ScmSource::Archive { url } => url.to_string(),
            ScmSource::ObjectStorage { url } => url,
        };

        let staging = layout.staging_dir();
        staging.recreate().await?;
        let download = staging.path().join("download");
        let unpacked = staging.path().join("archive");

        self.downloader.fetch(&url, &download).await?;
        archive::unpack(&download, &unpacked).await?;
        tokio::fs::remove_file(&download).await?;

        let root = archive::source_root(&unpacked).await?;
        self.client.git_init(&root).await?;

        info!("Staged archive as git repository at {}", root.display());
        Ok(CheckoutSource::Git(GitSource {
            repository: Cow::Owned(root.display().to_string()),
            revision: Cow::Borrowed(DEFAULT_GIT_REVISION),
            ssh_key: None,
        }))
    }

    /// Refresh the cached copy from a normalized source.
    ///
    /// `HOME` points at the deploy user's home for the whole call and is
    /// restored before returning, whatever the outcome.
    pub async fn checkout(
        &self,
        source: &CheckoutSource<'_>,
        spec: &DeploymentSpec,
    ) -> Result<CachedCopy, DeployError> {
        let layout = spec.layout();
        let cached_copy = layout.cached_copy_dir();
        let ownership = spec.ownership();

        let _home = spec.home.as_deref().map(HomeOverride::acquire);

        // Children get HOME explicitly as well as through the process override.
        let mut env = spec.environment.clone();
        if let Some(home) = &spec.home {
            env.insert("HOME".to_string(), home.display().to_string());
        }

        if spec.delete_cached_copy {
            info!("Deleting cached copy {}", cached_copy.path().display());
            cached_copy.delete().await?;
        }

        match source {
            CheckoutSource::None => {
                debug!("No SCM configured, using cached copy as provisioned");
            }
            CheckoutSource::Git(git) => {
                if let Some(key) = git.ssh_key {
                    let home = spec.home.as_deref().ok_or_else(|| {
                        DeployError::CheckoutFailed(
                            "an ssh key is configured but the deploy user has no home".to_string(),
                        )
                    })?;
                    home::install_ssh_key(home, key, &ownership)
                        .await
                        .map_err(|e| DeployError::CheckoutFailed(format!("ssh key: {}", e)))?;
                }

                prepare_working_tree(&cached_copy, ".git").await?;
                let checkout = GitCheckout {
                    repository: &git.repository,
                    revision: &git.revision,
                    shallow: spec.shallow_clone,
                    submodules: spec.enable_submodules,
                };
                self.client
                    .git_sync(&checkout, cached_copy.path(), &env)
                    .await?;
            }
            CheckoutSource::Subversion(svn) => {
                prepare_working_tree(&cached_copy, ".svn").await?;
                let checkout = SvnCheckout {
                    repository: svn.repository,
                    revision: svn.revision,
                    username: svn.username,
                    password: svn.password,
                };
                self.client
                    .svn_sync(&checkout, cached_copy.path(), &env)
                    .await?;
            }
        }

        if cached_copy.exists().await {
            ownership.apply_recursive(cached_copy.path()).await?;
        }

        Ok(CachedCopy {
            path: cached_copy.path().to_path_buf(),
            variant: source.variant(),
        })
    }

    /// Validate, normalize and check out in one call
    pub async fn resolve(&self, spec: &DeploymentSpec) -> Result<CachedCopy, DeployError> {
        let source = ScmSource::from_spec(spec)?;
        let source = self.normalize(source, &spec.layout()).await?;
        self.checkout(&source, spec).await
    }
}

/// Clear a cached copy left behind by a different SCM type.
///
/// The client clones into a missing directory and updates one that carries its
/// own metadata directory; anything else would make it fail.
async fn prepare_working_tree(cached_copy: &Dir, metadata_dir: &str) -> Result<(), DeployError> {
    if cached_copy.exists().await
        && !cached_copy.subdir(metadata_dir).exists().await
        && !cached_copy.is_empty().await?
    {
        info!(
            "Cached copy {} has no {} directory, recreating it",
            cached_copy.path().display(),
            metadata_dir
        );
        cached_copy.delete().await?;
    }
    if let Some(parent) = cached_copy.path().parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}
