//! Restart coordinator

use async_trait::async_trait;

use crate::errors::DeployError;
use crate::process::Cmd;

/// Restarts the served process of an application
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self, application: &str) -> Result<(), DeployError>;
}

/// Restarts through monit, which supervises `node_web_app_<application>`
#[derive(Debug, Clone)]
pub struct MonitRestarter {
    service_prefix: String,
}

impl MonitRestarter {
    pub fn new(service_prefix: impl Into<String>) -> Self {
        Self {
            service_prefix: service_prefix.into(),
        }
    }

    pub fn service_name(&self, application: &str) -> String {
        format!("{}{}", self.service_prefix, application)
    }
}

impl Default for MonitRestarter {
    fn default() -> Self {
        Self::new("node_web_app_")
    }
}

#[async_trait]
impl Restarter for MonitRestarter {
    async fn restart(&self, application: &str) -> Result<(), DeployError> {
        Cmd::new("monit")
            .arg("restart")
            .arg(self.service_name(application))
            .run()
            .await
            .map_err(DeployError::RestartFailed)
    }
}
