//! Build/Transform step
//!
//! Turns the cached copy into a runnable release. The orchestrator hands the
//! transformer a `BuildRequest` and expects `server.js` in the release
//! afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::filesys::owner::Ownership;
use crate::models::spec::DeploymentSpec;
use crate::process::Cmd;
use crate::scm::archive;
use crate::utils::temp_suffix;

/// File the service supervisor executes
pub const ENTRYPOINT: &str = "server.js";

/// The application's own entry file, loaded by the entrypoint
pub const APP_MAIN: &str = "main.js";

const BUNDLE: &str = "app.tar.gz";

/// Values the orchestrator supplies to the build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnv {
    pub root_url: String,
    pub mongo_url: String,
    pub port: u16,
}

impl BuildEnv {
    /// Derive the build environment; `None` when no domain is configured
    pub fn from_spec(spec: &DeploymentSpec) -> Option<Self> {
        let domain = spec.primary_domain()?;
        let (scheme, port) = if spec.ssl_support {
            ("https", 443)
        } else {
            ("http", 80)
        };

        Some(Self {
            root_url: format!("{}://{}", scheme, domain),
            mongo_url: spec.mongo_url.clone().unwrap_or_default(),
            port,
        })
    }

    pub fn vars(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("ROOT_URL".to_string(), self.root_url.clone()),
            ("MONGO_URL".to_string(), self.mongo_url.clone()),
            ("PORT".to_string(), self.port.to_string()),
        ])
    }
}

fn js_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// Contents of the generated entrypoint
pub fn render_entrypoint(env: &BuildEnv) -> String {
    format!(
        "process.env.ROOT_URL  = {};\nprocess.env.MONGO_URL = {};\nprocess.env.PORT = {};\nrequire({});\n",
        js_string(&env.root_url),
        js_string(&env.mongo_url),
        env.port,
        js_string(&format!("./{}", APP_MAIN)),
    )
}

/// Write the entrypoint into a release and hand it to the deploy user
pub async fn write_entrypoint(
    release: &Dir,
    env: &BuildEnv,
    ownership: &Ownership,
) -> Result<File, DeployError> {
    let entrypoint = release.file(ENTRYPOINT);
    entrypoint.write_string(&render_entrypoint(env)).await?;
    ownership.apply(entrypoint.path())?;
    Ok(entrypoint)
}

/// Everything a transformer gets to work with
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub cached_copy: &'a Path,
    pub release: &'a Path,
    pub env: &'a BuildEnv,
    /// Environment mapping of the deployment, passed to every command
    pub environment: &'a BTreeMap<String, String>,
    pub ownership: &'a Ownership,
}

/// Produces a runnable entrypoint in the release from the cached copy
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, request: &BuildRequest<'_>) -> Result<(), DeployError>;
}

/// Bundles a Meteor application with demeteorizer.
///
/// The cached copy is bundled in a scratch directory, the bundle is unpacked
/// into the release, its npm dependencies are installed, and the entrypoint
/// is written.
#[derive(Debug, Clone, Default)]
pub struct MeteorBundleTransformer;

impl MeteorBundleTransformer {
    async fn bundle(&self, request: &BuildRequest<'_>, scratch: &Dir) -> Result<(), DeployError> {
        let release = Dir::new(request.release);

        Dir::new(request.cached_copy)
            .copy_contents_to(scratch, &[".git", ".svn"])
            .await?;

        Cmd::new("demeteorizer")
            .args(["-t", BUNDLE])
            .current_dir(scratch.path())
            .envs(request.environment)
            .run()
            .await
            .map_err(DeployError::BuildStepFailed)?;

        archive::unpack(&scratch.path().join(BUNDLE), release.path())
            .await
            .map_err(|e| DeployError::BuildStepFailed(e.to_string()))?;

        Cmd::new("npm")
            .arg("install")
            .current_dir(release.path())
            .envs(request.environment)
            .run()
            .await
            .map_err(DeployError::BuildStepFailed)?;

        write_entrypoint(&release, request.env, request.ownership).await?;
        Ok(())
    }
}

#[async_trait]
impl Transformer for MeteorBundleTransformer {
    async fn transform(&self, request: &BuildRequest<'_>) -> Result<(), DeployError> {
        info!(
            "Bundling {} into {}",
            request.cached_copy.display(),
            request.release.display()
        );

        let scratch = Dir::new(
            std::env::temp_dir().join(format!("shipwright-build-{}", temp_suffix())),
        );
        scratch.create().await?;

        let result = self.bundle(request, &scratch).await;

        if let Err(e) = scratch.delete().await {
            warn!("Failed to remove build scratch {}: {}", scratch.path().display(), e);
        }
        result
    }
}
