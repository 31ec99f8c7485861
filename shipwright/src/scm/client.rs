//! SCM client invocations

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::errors::DeployError;
use crate::process::Cmd;

/// Flags shared by every svn invocation
const SVN_ARGS: [&str; 3] = ["--no-auth-cache", "--non-interactive", "--trust-server-cert"];

/// A git checkout request
#[derive(Debug, Clone)]
pub struct GitCheckout<'a> {
    pub repository: &'a str,
    pub revision: &'a str,
    pub shallow: bool,
    pub submodules: bool,
}

/// A subversion checkout request
#[derive(Debug, Clone)]
pub struct SvnCheckout<'a> {
    pub repository: &'a str,
    pub revision: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a SecretString>,
}

/// The commands the SCM resolver needs from a version control client
#[async_trait]
pub trait ScmClient: Send + Sync {
    /// Clone or update `target` to the requested git revision
    async fn git_sync(
        &self,
        checkout: &GitCheckout<'_>,
        target: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), DeployError>;

    /// Check out or update `target` to the requested svn revision
    async fn svn_sync(
        &self,
        checkout: &SvnCheckout<'_>,
        target: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), DeployError>;

    /// Turn a plain directory into a single-commit git repository
    async fn git_init(&self, path: &Path) -> Result<(), DeployError>;
}

/// `ScmClient` backed by the `git` and `svn` executables
#[derive(Debug, Clone, Default)]
pub struct SystemScmClient;

fn checkout_failed(message: String) -> DeployError {
    DeployError::CheckoutFailed(message)
}

#[async_trait]
impl ScmClient for SystemScmClient {
    async fn git_sync(
        &self,
        checkout: &GitCheckout<'_>,
        target: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), DeployError> {
        info!(
            "Syncing git repository {} ({}) to {}",
            checkout.repository,
            checkout.revision,
            target.display()
        );

        if target.join(".git").exists() {
            Cmd::new("git")
                .args(["remote", "set-url", "origin", checkout.repository])
                .current_dir(target)
                .envs(env)
                .run()
                .await
                .map_err(checkout_failed)?;
        } else {
            let mut clone = Cmd::new("git").arg("clone");
            if checkout.shallow {
                clone = clone.args(["--depth", "1"]);
            }
            clone
                .args([checkout.repository.to_string(), target.display().to_string()])
                .envs(env)
                .run()
                .await
                .map_err(checkout_failed)?;
        }

        let mut fetch = Cmd::new("git").args(["fetch", "--prune"]);
        if checkout.shallow {
            fetch = fetch.args(["--depth", "1"]);
        }
        fetch
            .args(["origin", checkout.revision])
            .current_dir(target)
            .envs(env)
            .run()
            .await
            .map_err(checkout_failed)?;

        Cmd::new("git")
            .args(["reset", "--hard", "FETCH_HEAD"])
            .current_dir(target)
            .envs(env)
            .run()
            .await
            .map_err(checkout_failed)?;

        if checkout.submodules {
            Cmd::new("git")
                .args(["submodule", "sync", "--recursive"])
                .current_dir(target)
                .envs(env)
                .run()
                .await
                .map_err(checkout_failed)?;
            Cmd::new("git")
                .args(["submodule", "update", "--init", "--recursive"])
                .current_dir(target)
                .envs(env)
                .run()
                .await
                .map_err(checkout_failed)?;
        }

        Ok(())
    }

    async fn svn_sync(
        &self,
        checkout: &SvnCheckout<'_>,
        target: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), DeployError> {
        info!(
            "Syncing svn repository {} (r{}) to {}",
            checkout.repository,
            checkout.revision,
            target.display()
        );

        let mut cmd = if target.join(".svn").exists() {
            Cmd::new("svn")
                .args(["update", "--revision", checkout.revision])
                .arg(target.display().to_string())
        } else {
            Cmd::new("svn")
                .args(["checkout", "--revision", checkout.revision, checkout.repository])
                .arg(target.display().to_string())
        };

        cmd = cmd.args(SVN_ARGS);
        if let Some(username) = checkout.username {
            cmd = cmd.args(["--username", username]);
        }
        if let Some(password) = checkout.password {
            cmd = cmd
                .arg("--password")
                .secret_arg(password.expose_secret().to_string());
        }

        cmd.envs(env).run().await.map_err(checkout_failed)
    }

    async fn git_init(&self, path: &Path) -> Result<(), DeployError> {
        info!("Creating temporary git repository in {}", path.display());

        Cmd::new("git")
            .args(["init", "--quiet"])
            .current_dir(path)
            .run()
            .await
            .map_err(checkout_failed)?;
        Cmd::new("git")
            .args(["add", "--all"])
            .current_dir(path)
            .run()
            .await
            .map_err(checkout_failed)?;
        Cmd::new("git")
            .args([
                "-c",
                "user.name=shipwright",
                "-c",
                "user.email=shipwright@localhost",
                "commit",
                "--quiet",
                "--allow-empty",
                "-m",
                "Create temporary repository from downloaded contents.",
            ])
            .current_dir(path)
            .run()
            .await
            .map_err(checkout_failed)
    }
}
