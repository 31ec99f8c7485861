//! Deployment orchestrator
//!
//! Drives one run: resolve the source, allocate a release, run the
//! pre-promote stages, switch `current`, run the post-promote stages and
//! prune. Any pre-promote failure aborts the run with the previous release
//! still active. Post-promote failures are recorded in the report and leave
//! the new release active.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::deploy::build::{BuildEnv, BuildRequest, MeteorBundleTransformer, Transformer, ENTRYPOINT};
use crate::deploy::hooks::{run_callback, HookContext, HookPipeline, Stage, StageOutcome};
use crate::deploy::releases::ReleaseManager;
use crate::deploy::restart::{MonitRestarter, Restarter};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::lock::DeployLock;
use crate::models::release::Release;
use crate::models::spec::{DeployAction, DeploymentSpec};
use crate::process::Cmd;
use crate::scm::client::{ScmClient, SystemScmClient};
use crate::scm::{ScmResolver, ScmSource};

/// A stage failure recorded after `current` was switched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

/// What a run did
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub application: String,
    pub action: DeployAction,
    /// The release `current` points at after the run
    pub release: Option<Release>,
    pub stages: Vec<(Stage, StageOutcome)>,
    pub pruned: Vec<String>,
    pub post_promote_failures: Vec<StageFailure>,
}

impl DeployReport {
    fn new(spec: &DeploymentSpec, action: DeployAction) -> Self {
        Self {
            application: spec.application.clone(),
            action,
            release: None,
            stages: Vec::new(),
            pruned: Vec::new(),
            post_promote_failures: Vec::new(),
        }
    }

    /// True when nothing failed after the pointer switch
    pub fn is_clean(&self) -> bool {
        self.post_promote_failures.is_empty()
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, outcome)| outcome)
    }
}

/// Runs deployments and rollbacks
pub struct Deployer {
    resolver: ScmResolver,
    transformer: Arc<dyn Transformer>,
    restarter: Arc<dyn Restarter>,
    pipeline: HookPipeline,
}

impl Deployer {
    pub fn new(
        client: Arc<dyn ScmClient>,
        transformer: Arc<dyn Transformer>,
        restarter: Arc<dyn Restarter>,
    ) -> Self {
        Self {
            resolver: ScmResolver::new(client),
            transformer,
            restarter,
            pipeline: HookPipeline::new(),
        }
    }

    /// A deployer backed by the system's git/svn, demeteorizer and monit
    pub fn system() -> Self {
        Self::new(
            Arc::new(SystemScmClient),
            Arc::new(MeteorBundleTransformer),
            Arc::new(MonitRestarter::default()),
        )
    }

    pub fn with_pipeline(mut self, pipeline: HookPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn pipeline(&self) -> &HookPipeline {
        &self.pipeline
    }

    /// Run the requested action
    pub async fn run(&self, spec: &DeploymentSpec) -> Result<DeployReport, DeployError> {
        match spec.action {
            DeployAction::Deploy => self.deploy(spec).await,
            DeployAction::Rollback => self.rollback(spec).await,
        }
    }

    /// Deploy a new release
    pub async fn deploy(&self, spec: &DeploymentSpec) -> Result<DeployReport, DeployError> {
        spec.validate()?;
        let source = ScmSource::from_spec(spec)?;
        info!(
            "Deploying {} to {} from {} source",
            spec.application,
            spec.deploy_to.display(),
            source.variant()
        );

        let layout = spec.layout();
        layout
            .setup(&spec.ownership())
            .await
            .map_err(|e| DeployError::ReleaseAllocationFailed(e.to_string()))?;
        let _lock = DeployLock::acquire(&layout.lock_file())?;

        let manager = ReleaseManager::for_spec(spec);
        let release = manager.begin_release().await?;
        let release_dir = layout.release_dir(&release.id);
        let cached_copy = layout.cached_copy_dir();

        let mut report = DeployReport::new(spec, DeployAction::Deploy);
        let mut source = Some(source);

        for stage in Stage::PRE_PROMOTE {
            let ctx = HookContext {
                stage,
                spec,
                release: &release,
                release_dir: &release_dir,
                cached_copy: cached_copy.path(),
            };

            let result = match stage {
                Stage::Checkout => {
                    let source = source.take().ok_or_else(|| {
                        DeployError::Internal("checkout ran twice".to_string())
                    })?;
                    self.pipeline
                        .run(&ctx, self.checkout(spec, source, &release_dir))
                        .await
                }
                Stage::BeforeMigrate => match link_shared(spec, &release_dir).await {
                    Ok(()) => self.pipeline.run(&ctx, run_callback(&ctx)).await,
                    Err(e) => Err(stage.classify(e)),
                },
                Stage::Migrate => {
                    self.pipeline
                        .run(&ctx, self.migrate(spec, &release_dir))
                        .await
                }
                _ => self.pipeline.run(&ctx, run_callback(&ctx)).await,
            };

            match result {
                Ok(outcome) => {
                    if let StageOutcome::Skipped(reason) = &outcome {
                        info!("Skipped {}: {}", stage, reason);
                    }
                    report.stages.push((stage, outcome));
                }
                Err(e) => {
                    error!(
                        "Deployment of {} aborted in {}, release {} left unpromoted: {}",
                        spec.application, stage, release.id, e
                    );
                    return Err(e);
                }
            }
        }

        let promoted = manager.promote(&release).await?;
        report.release = Some(promoted.clone());

        self.post_promote(spec, &promoted, &mut report).await;

        match manager.prune(spec.keep_releases).await {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => warn!("Pruning releases of {} failed: {}", spec.application, e),
        }

        info!(
            "Deployed {} release {} ({} post-promote failure(s))",
            spec.application,
            promoted.id,
            report.post_promote_failures.len()
        );
        Ok(report)
    }

    /// Point `current` back at the previous release and restart
    pub async fn rollback(&self, spec: &DeploymentSpec) -> Result<DeployReport, DeployError> {
        spec.validate()?;
        let layout = spec.layout();
        if !layout.root().exists().await {
            return Err(DeployError::NoPreviousRelease);
        }
        let _lock = DeployLock::acquire(&layout.lock_file())?;

        let manager = ReleaseManager::for_spec(spec);
        let reinstated = manager.rollback().await?;

        let mut report = DeployReport::new(spec, DeployAction::Rollback);
        report.release = Some(reinstated.clone());
        self.post_promote(spec, &reinstated, &mut report).await;

        info!("Rolled back {} to release {}", spec.application, reinstated.id);
        Ok(report)
    }

    /// Run the stages after the pointer switch, stopping at the first failure
    async fn post_promote(&self, spec: &DeploymentSpec, release: &Release, report: &mut DeployReport) {
        let release_dir = spec.layout().release_dir(&release.id);
        let cached_copy = spec.layout().cached_copy_dir();

        for stage in Stage::POST_PROMOTE {
            let ctx = HookContext {
                stage,
                spec,
                release,
                release_dir: &release_dir,
                cached_copy: cached_copy.path(),
            };

            let result = match stage {
                Stage::Restart => {
                    self.pipeline
                        .run(&ctx, self.restart(&spec.application))
                        .await
                }
                _ => self.pipeline.run(&ctx, run_callback(&ctx)).await,
            };

            match result {
                Ok(outcome) => report.stages.push((stage, outcome)),
                Err(e) => {
                    warn!(
                        "{} failed after release {} became active, leaving it active: {}",
                        stage, release.id, e
                    );
                    report.stages.push((stage, StageOutcome::Failed(e.to_string())));
                    report.post_promote_failures.push(StageFailure {
                        stage,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    }

    /// Default checkout: refresh the cached copy and copy it into the release
    async fn checkout(
        &self,
        spec: &DeploymentSpec,
        source: ScmSource<'_>,
        release_dir: &Dir,
    ) -> Result<StageOutcome, DeployError> {
        let source = self.resolver.normalize(source, &spec.layout()).await?;
        let cached_copy = self.resolver.checkout(&source, spec).await?;
        let cached_dir = cached_copy.dir();

        if !cached_dir.exists().await {
            return Ok(StageOutcome::Skipped(format!(
                "no {} source and no cached copy",
                cached_copy.variant
            )));
        }

        cached_dir.copy_contents_to(release_dir, &[".git", ".svn"]).await?;
        spec.ownership().apply_recursive(release_dir.path()).await?;
        Ok(StageOutcome::Ran)
    }

    /// Default migrate: build, then the migrate command, then npm install
    async fn migrate(&self, spec: &DeploymentSpec, release_dir: &Dir) -> Result<StageOutcome, DeployError> {
        let mut ran = false;
        let cached_copy = spec.layout().cached_copy_dir();
        let ownership = spec.ownership();

        match BuildEnv::from_spec(spec) {
            Some(env) => {
                let request = BuildRequest {
                    cached_copy: cached_copy.path(),
                    release: release_dir.path(),
                    env: &env,
                    environment: &spec.environment,
                    ownership: &ownership,
                };
                self.transformer.transform(&request).await?;

                if !release_dir.file(ENTRYPOINT).exists().await {
                    return Err(DeployError::BuildStepFailed(format!(
                        "build left no {} in {}",
                        ENTRYPOINT,
                        release_dir.path().display()
                    )));
                }
                ran = true;
            }
            None => info!(
                "No domains configured for {}, skipping the build",
                spec.application
            ),
        }

        if spec.migrate {
            if let Some(command) = spec.migrate_command.as_deref() {
                info!("Running migrate command for {}", spec.application);
                Cmd::new("sh")
                    .args(["-c", command])
                    .current_dir(release_dir.path())
                    .envs(&spec.environment)
                    .run()
                    .await
                    .map_err(DeployError::BuildStepFailed)?;
                ran = true;
            }
        }

        if spec.auto_npm_install_on_deploy {
            Cmd::new("npm")
                .args(["install", "--production"])
                .current_dir(release_dir.path())
                .envs(&spec.environment)
                .run()
                .await
                .map_err(DeployError::BuildStepFailed)?;
            ran = true;
        }

        if ran {
            ownership.apply_recursive(release_dir.path()).await?;
            Ok(StageOutcome::Ran)
        } else {
            Ok(StageOutcome::Skipped("no domains configured".to_string()))
        }
    }

    async fn restart(&self, application: &str) -> Result<StageOutcome, DeployError> {
        self.restarter.restart(application).await?;
        Ok(StageOutcome::Ran)
    }
}

/// Link `release/<target>` to `shared/<source>` for each configured pair
async fn link_shared(spec: &DeploymentSpec, release_dir: &Dir) -> Result<(), DeployError> {
    let shared = spec.layout().shared_dir();

    for (source, target) in &spec.symlink_before_migrate {
        let link = release_dir.path().join(target);
        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Whatever the checkout put there gives way to the shared path.
        match tokio::fs::symlink_metadata(&link).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&link).await?,
            Ok(_) => tokio::fs::remove_file(&link).await?,
            Err(_) => {}
        }
        tokio::fs::symlink(shared.path().join(source), &link).await?;
        info!("Linked {} to shared/{}", link.display(), source);
    }
    Ok(())
}
