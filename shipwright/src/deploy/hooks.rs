//! Hook pipeline
//!
//! The stage order is fixed. Each stage has a default behavior, which a
//! registered `StageHook` replaces. For the `before_*`/`after_*` stages the
//! default runs the application's callback script at
//! `<release>/deploy/<stage>.sh` when it exists. The release is still empty
//! at `before_checkout`, so that script is taken from the cached copy left by
//! the previous checkout.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::models::release::Release;
use crate::models::spec::DeploymentSpec;
use crate::process::Cmd;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    BeforeCheckout,
    Checkout,
    BeforeMigrate,
    Migrate,
    BeforeSymlink,
    BeforeRestart,
    Restart,
    AfterRestart,
}

impl Stage {
    /// Stages that must all succeed before `current` is switched
    pub const PRE_PROMOTE: [Stage; 5] = [
        Stage::BeforeCheckout,
        Stage::Checkout,
        Stage::BeforeMigrate,
        Stage::Migrate,
        Stage::BeforeSymlink,
    ];

    /// Stages run after `current` is switched
    pub const POST_PROMOTE: [Stage; 3] = [Stage::BeforeRestart, Stage::Restart, Stage::AfterRestart];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::BeforeCheckout => "before_checkout",
            Stage::Checkout => "checkout",
            Stage::BeforeMigrate => "before_migrate",
            Stage::Migrate => "migrate",
            Stage::BeforeSymlink => "before_symlink",
            Stage::BeforeRestart => "before_restart",
            Stage::Restart => "restart",
            Stage::AfterRestart => "after_restart",
        }
    }

    /// Callback script consulted when no hook is registered
    pub fn callback_path(&self, release_dir: &Path, cached_copy: &Path) -> Option<PathBuf> {
        let base = match self {
            Stage::Checkout | Stage::Migrate | Stage::Restart => return None,
            Stage::BeforeCheckout => cached_copy,
            _ => release_dir,
        };
        Some(base.join("deploy").join(format!("{}.sh", self.name())))
    }

    /// Map a failure inside this stage onto the error taxonomy
    pub fn classify(&self, err: DeployError) -> DeployError {
        match (self, err) {
            (Stage::Checkout, e @ DeployError::CheckoutFailed(_)) => e,
            (Stage::Checkout, e) => DeployError::CheckoutFailed(e.to_string()),
            (Stage::Migrate, e @ DeployError::BuildStepFailed(_)) => e,
            (Stage::Migrate, e) => DeployError::BuildStepFailed(e.to_string()),
            (Stage::Restart, e @ DeployError::RestartFailed(_)) => e,
            (Stage::Restart, e) => DeployError::RestartFailed(e.to_string()),
            (_, e @ DeployError::HookFailed { .. }) => e,
            (stage, e) => DeployError::HookFailed {
                stage: stage.name().to_string(),
                message: e.to_string(),
            },
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a stage did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Ran,
    Skipped(String),
    Failed(String),
}

/// What a hook sees of the run
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub stage: Stage,
    pub spec: &'a DeploymentSpec,
    pub release: &'a Release,
    pub release_dir: &'a Dir,
    pub cached_copy: &'a Path,
}

/// Application-supplied behavior for a stage
#[async_trait]
pub trait StageHook: Send + Sync {
    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), DeployError>;
}

/// Stage handlers registered for one run
#[derive(Clone, Default)]
pub struct HookPipeline {
    handlers: HashMap<Stage, Arc<dyn StageHook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaces
    pub fn register(&mut self, stage: Stage, hook: Arc<dyn StageHook>) -> Option<Arc<dyn StageHook>> {
        self.handlers.insert(stage, hook)
    }

    pub fn with(mut self, stage: Stage, hook: Arc<dyn StageHook>) -> Self {
        self.register(stage, hook);
        self
    }

    /// Run one stage: the registered handler if any, otherwise `default`.
    ///
    /// Errors come back classified for the stage.
    pub async fn run<F>(
        &self,
        ctx: &HookContext<'_>,
        default: F,
    ) -> Result<StageOutcome, DeployError>
    where
        F: Future<Output = Result<StageOutcome, DeployError>> + Send,
    {
        let stage = ctx.stage;
        info!("Stage {} for release {}", stage, ctx.release.id);

        let result = match self.handlers.get(&stage) {
            Some(hook) => {
                debug!("Running registered handler for {}", stage);
                hook.run(ctx).await.map(|_| StageOutcome::Ran)
            }
            None => default.await,
        };

        result.map_err(|e| stage.classify(e))
    }
}

impl fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<_> = self.handlers.keys().collect();
        stages.sort();
        f.debug_struct("HookPipeline")
            .field("overridden", &stages)
            .finish()
    }
}

/// Default for hook stages: run the release's callback script if present
pub async fn run_callback(ctx: &HookContext<'_>) -> Result<StageOutcome, DeployError> {
    let Some(script) = ctx.stage.callback_path(ctx.release_dir.path(), ctx.cached_copy) else {
        return Ok(StageOutcome::Skipped("stage has no callback".to_string()));
    };

    if !tokio::fs::try_exists(&script).await.unwrap_or(false) {
        return Ok(StageOutcome::Skipped("no callback".to_string()));
    }

    info!("Running {} callback {}", ctx.stage, script.display());
    Cmd::new("sh")
        .arg(script.display().to_string())
        .current_dir(ctx.release_dir.path())
        .envs(&ctx.spec.environment)
        .env("APPLICATION", ctx.spec.application.as_str())
        .env("DEPLOY_TO", ctx.spec.deploy_to.display().to_string())
        .env("RELEASE_PATH", ctx.release_dir.path().display().to_string())
        .env("RELEASE_ID", ctx.release.id.as_str())
        .env("STAGE", ctx.stage.name())
        .run()
        .await
        .map_err(|message| DeployError::HookFailed {
            stage: ctx.stage.name().to_string(),
            message,
        })?;

    Ok(StageOutcome::Ran)
}
