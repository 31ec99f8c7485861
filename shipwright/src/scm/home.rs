//! Deploy user home handling during checkout

use std::ffi::OsString;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::filesys::owner::Ownership;

const HOME_VAR: &str = "HOME";

/// Overrides `HOME` until dropped, then restores the previous value.
///
/// Restoration happens in `Drop`, so it runs on every exit path of the scope
/// holding the guard, including `?` returns and panics.
#[derive(Debug)]
pub struct HomeOverride {
    previous: Option<OsString>,
}

impl HomeOverride {
    pub fn acquire(home: &Path) -> Self {
        let previous = std::env::var_os(HOME_VAR);
        debug!("Setting HOME to {} for checkout", home.display());
        std::env::set_var(HOME_VAR, home);
        Self { previous }
    }
}

impl Drop for HomeOverride {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(previous) => std::env::set_var(HOME_VAR, previous),
            None => std::env::remove_var(HOME_VAR),
        }
        debug!("Restored HOME after checkout");
    }
}

/// Install a private key for git over ssh in `<home>/.ssh`.
///
/// The key is written to `id_dsa` with mode 0600. A `config` disabling strict
/// host key checking is created only when none exists.
pub async fn install_ssh_key(
    home: &Path,
    key: &SecretString,
    ownership: &Ownership,
) -> Result<(), DeployError> {
    let ssh_dir = Dir::new(home.join(".ssh"));
    ssh_dir.create().await?;
    ssh_dir.set_mode(0o700).await?;
    ownership.apply(ssh_dir.path())?;

    let key_file = ssh_dir.file("id_dsa");
    let mut contents = key.expose_secret().trim_end().to_string();
    contents.push('\n');
    key_file.write_atomic(contents.as_bytes()).await?;
    key_file.set_mode(0o600).await?;
    ownership.apply(key_file.path())?;

    let config: File = ssh_dir.file("config");
    if !config.exists().await {
        config
            .write_string("Host *\n  StrictHostKeyChecking no\n")
            .await?;
        config.set_mode(0o600).await?;
        ownership.apply(config.path())?;
    }

    info!("Installed ssh key in {}", ssh_dir.path().display());
    Ok(())
}
