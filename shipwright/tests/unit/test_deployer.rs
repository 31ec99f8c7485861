//! Deployment run tests

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use serial_test::serial;
use shipwright::deploy::fsm::ReleaseStatus;
use shipwright::deploy::hooks::{HookContext, HookPipeline, Stage, StageHook, StageOutcome};
use shipwright::errors::DeployError;
use shipwright::filesys::lock::DeployLock;
use shipwright::models::spec::{DeployAction, ScmConfig};

use crate::common::{git_spec, read_link_name, FakeScm, Harness};

struct Refuse;

#[async_trait]
impl StageHook for Refuse {
    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), DeployError> {
        Err(DeployError::Internal(format!("{} refused", ctx.stage)))
    }
}

fn app_files() -> FakeScm {
    FakeScm::with_files(&[("main.js", "console.log('todos')")])
}

#[tokio::test]
async fn test_deploy_leaves_one_active_release() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let spec = git_spec(tmp.path());

    let report = harness.deployer.deploy(&spec).await.unwrap();
    assert!(report.is_clean());

    let release = report.release.clone().unwrap();
    let layout = spec.layout();
    assert_eq!(read_link_name(&layout.current_link()), Some(release.id.clone()));

    let release_dir = layout.release_dir(&release.id);
    assert!(release_dir.file("main.js").exists().await);
    assert!(!release_dir.subdir(".git").exists().await);

    let entrypoint = std::fs::read_to_string(release_dir.path().join("server.js")).unwrap();
    assert!(entrypoint.starts_with("process.env.ROOT_URL  = \"http://todos.example.com\";"));
    assert!(entrypoint.contains("process.env.PORT = 80;"));

    let history = shipwright::storage::history::load(&layout).await.unwrap();
    let active: Vec<_> = history
        .releases()
        .iter()
        .filter(|r| r.status == ReleaseStatus::Active)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(*harness.restarter.restarted.lock().unwrap(), vec!["todos"]);
    assert_eq!(report.outcome(Stage::Migrate), Some(&StageOutcome::Ran));
}

#[tokio::test]
async fn test_redeploy_creates_a_new_release_with_same_content() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let spec = git_spec(tmp.path());

    let first = harness.deployer.deploy(&spec).await.unwrap().release.unwrap();
    let second = harness.deployer.deploy(&spec).await.unwrap().release.unwrap();
    assert_ne!(first.id, second.id);

    let layout = spec.layout();
    assert_eq!(read_link_name(&layout.current_link()), Some(second.id.clone()));
    assert_eq!(
        std::fs::read_to_string(layout.release_dir(&first.id).path().join("main.js")).unwrap(),
        std::fs::read_to_string(layout.current_link().join("main.js")).unwrap(),
    );

    let history = shipwright::storage::history::load(&layout).await.unwrap();
    assert_eq!(history.get(&first.id).unwrap().status, ReleaseStatus::Stale);
    assert_eq!(harness.scm.syncs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retention_keeps_newest_releases() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.keep_releases = Some(2);

    let mut ids = Vec::new();
    let mut last_pruned = Vec::new();
    for _ in 0..4 {
        let report = harness.deployer.deploy(&spec).await.unwrap();
        ids.push(report.release.unwrap().id);
        last_pruned = report.pruned;
    }

    let remaining = spec.layout().releases_dir().list_dir_names().await.unwrap();
    assert_eq!(remaining, vec![ids[2].clone(), ids[3].clone()]);
    assert_eq!(last_pruned, vec![ids[1].clone()]);
    assert_eq!(read_link_name(&spec.layout().current_link()), Some(ids[3].clone()));
}

#[tokio::test]
async fn test_unbounded_retention_without_keep_releases() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let spec = git_spec(tmp.path());

    for _ in 0..3 {
        harness.deployer.deploy(&spec).await.unwrap();
    }
    assert_eq!(spec.layout().releases_dir().list_dir_names().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_rollback_returns_to_previous_release() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());

    // Nothing deployed yet
    assert!(matches!(
        harness.deployer.rollback(&spec).await,
        Err(DeployError::NoPreviousRelease)
    ));

    let first = harness.deployer.deploy(&spec).await.unwrap().release.unwrap();
    assert!(matches!(
        harness.deployer.rollback(&spec).await,
        Err(DeployError::NoPreviousRelease)
    ));

    harness.deployer.deploy(&spec).await.unwrap();

    spec.action = DeployAction::Rollback;
    let report = harness.deployer.run(&spec).await.unwrap();
    assert_eq!(report.action, DeployAction::Rollback);
    assert_eq!(report.release.as_ref().unwrap().id, first.id);
    assert_eq!(read_link_name(&spec.layout().current_link()), Some(first.id.clone()));

    // Two deploys and the rollback each restart the service
    assert_eq!(harness.restarter.restarted.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_empty_domains_skip_the_build() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.domains.clear();

    let report = harness.deployer.deploy(&spec).await.unwrap();
    assert!(matches!(report.outcome(Stage::Migrate), Some(StageOutcome::Skipped(_))));
    assert_eq!(harness.transformer.calls.load(Ordering::SeqCst), 0);

    let current = spec.layout().current_link();
    assert!(current.join("main.js").exists());
    assert!(!current.join("server.js").exists());
}

#[tokio::test]
#[serial]
async fn test_home_is_scoped_to_checkout() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("home/deploy");
    std::fs::create_dir_all(&home).unwrap();
    std::env::set_var("HOME", "/home/agent");

    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.home = Some(home.clone());

    harness.deployer.deploy(&spec).await.unwrap();
    assert_eq!(
        harness.scm.home_during_sync.lock().unwrap().as_deref(),
        home.to_str()
    );
    assert_eq!(std::env::var("HOME").unwrap(), "/home/agent");
}

#[tokio::test]
#[serial]
async fn test_failed_checkout_restores_home_and_keeps_current() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("home/deploy");
    std::fs::create_dir_all(&home).unwrap();
    std::env::set_var("HOME", "/home/agent");

    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.home = Some(home);

    let first = harness.deployer.deploy(&spec).await.unwrap().release.unwrap();

    harness.scm.fail.store(true, Ordering::SeqCst);
    let err = harness.deployer.deploy(&spec).await.unwrap_err();
    assert!(matches!(err, DeployError::CheckoutFailed(_)));
    assert_eq!(std::env::var("HOME").unwrap(), "/home/agent");

    let layout = spec.layout();
    assert_eq!(read_link_name(&layout.current_link()), Some(first.id.clone()));

    // The failed attempt is left for inspection, never promoted
    let history = shipwright::storage::history::load(&layout).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.latest().unwrap().status, ReleaseStatus::Pending);
}

#[tokio::test]
#[serial]
async fn test_ssh_key_is_installed_in_home() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("home/deploy");
    std::fs::create_dir_all(&home).unwrap();

    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.home = Some(home.clone());
    let mut config = ScmConfig::of_type("git").with_repository("git@example.com:acme/todos.git");
    config.ssh_key = Some("-----BEGIN KEY-----".to_string().into());
    spec.scm = Some(config);

    harness.deployer.deploy(&spec).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(home.join(".ssh/id_dsa")).unwrap(),
        "-----BEGIN KEY-----\n"
    );
    assert!(home.join(".ssh/config").exists());
}

#[tokio::test]
async fn test_unsupported_variant_touches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.scm = Some(ScmConfig::of_type("other"));

    let err = harness.deployer.deploy(&spec).await.unwrap_err();
    assert!(matches!(err, DeployError::UnsupportedScmVariant(ref v) if v == "other"));
    assert!(!spec.deploy_to.exists());
    assert_eq!(harness.scm.syncs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_archive_is_staged_as_git() {
    let tmp = tempfile::tempdir().unwrap();
    let tarball = tmp.path().join("todos.tgz");
    write_tarball(&tarball, &[("todos/main.js", "bundled"), ("todos/package.json", "{}")]);

    let harness = Harness::new(FakeScm::default());
    let mut spec = git_spec(tmp.path());
    let url = url::Url::from_file_path(&tarball).unwrap();
    spec.scm = Some(ScmConfig::of_type("archive").with_repository(url.as_str()));

    let report = harness.deployer.deploy(&spec).await.unwrap();
    let release_dir = spec.layout().release_dir(&report.release.unwrap().id);

    assert_eq!(
        std::fs::read_to_string(release_dir.path().join("main.js")).unwrap(),
        "bundled"
    );
    let inits = harness.scm.inits.lock().unwrap();
    assert_eq!(inits.len(), 1);
    assert!(inits[0].ends_with("scm-staging/archive/todos"));
}

#[tokio::test]
async fn test_restart_failure_is_fail_forward() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let spec = git_spec(tmp.path());
    harness.restarter.fail.store(true, Ordering::SeqCst);

    let report = harness.deployer.deploy(&spec).await.unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.post_promote_failures.len(), 1);
    assert_eq!(report.post_promote_failures[0].stage, Stage::Restart);
    assert!(report.outcome(Stage::AfterRestart).is_none());

    let release = report.release.clone().unwrap();
    assert_eq!(read_link_name(&spec.layout().current_link()), Some(release.id));
}

#[tokio::test]
async fn test_pre_promote_hook_failure_keeps_previous_release() {
    let tmp = tempfile::tempdir().unwrap();
    let spec = git_spec(tmp.path());

    let harness = Harness::new(app_files());
    let first = harness.deployer.deploy(&spec).await.unwrap().release.unwrap();

    let refusing = Harness::new(app_files());
    let deployer = refusing
        .deployer
        .with_pipeline(HookPipeline::new().with(Stage::BeforeSymlink, Arc::new(Refuse)));

    let err = deployer.deploy(&spec).await.unwrap_err();
    assert!(matches!(err, DeployError::HookFailed { ref stage, .. } if stage == "before_symlink"));
    assert_eq!(read_link_name(&spec.layout().current_link()), Some(first.id));
    assert!(refusing.restarter.restarted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_callback_scripts_from_the_release_run() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeScm::with_files(&[
        ("main.js", "main"),
        ("deploy/after_restart.sh", "echo \"$RELEASE_ID\" > after-restart.out\n"),
    ]));
    let spec = git_spec(tmp.path());

    let report = harness.deployer.deploy(&spec).await.unwrap();
    let release = report.release.clone().unwrap();

    assert_eq!(report.outcome(Stage::AfterRestart), Some(&StageOutcome::Ran));
    assert!(matches!(report.outcome(Stage::BeforeRestart), Some(StageOutcome::Skipped(_))));
    assert_eq!(
        std::fs::read_to_string(spec.layout().current_link().join("after-restart.out")).unwrap(),
        format!("{}\n", release.id)
    );
}

#[tokio::test]
async fn test_shared_paths_are_linked_before_migrate() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeScm::with_files(&[("main.js", "main"), ("log/stale", "x")]));
    let mut spec = git_spec(tmp.path());
    spec.symlink_before_migrate
        .insert("log".to_string(), "log".to_string());

    let report = harness.deployer.deploy(&spec).await.unwrap();
    let release_dir = spec.layout().release_dir(&report.release.unwrap().id);

    let target = std::fs::read_link(release_dir.path().join("log")).unwrap();
    assert_eq!(target, spec.layout().log_dir().path());
}

#[tokio::test]
async fn test_concurrent_run_is_locked_out() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let spec = git_spec(tmp.path());

    std::fs::create_dir_all(&spec.deploy_to).unwrap();
    let _held = DeployLock::acquire(&spec.layout().lock_file()).unwrap();

    let err = harness.deployer.deploy(&spec).await.unwrap_err();
    assert!(matches!(err, DeployError::Locked(_)));
    assert!(!spec.layout().current_link().exists());
}

#[tokio::test]
async fn test_shared_link_outside_the_release_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let victim = tmp.path().join("victim");
    std::fs::create_dir_all(&victim).unwrap();
    std::fs::write(victim.join("keep"), "x").unwrap();

    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.symlink_before_migrate
        .insert("log".to_string(), victim.display().to_string());

    let err = harness.deployer.deploy(&spec).await.unwrap_err();
    assert!(matches!(err, DeployError::InvalidSpec(_)));

    spec.symlink_before_migrate.clear();
    spec.symlink_before_migrate
        .insert("log".to_string(), "../../../../victim".to_string());
    let err = harness.deployer.deploy(&spec).await.unwrap_err();
    assert!(matches!(err, DeployError::InvalidSpec(_)));

    assert!(victim.join("keep").is_file());
    assert!(!spec.deploy_to.exists());
}

#[tokio::test]
async fn test_deploy_user_owns_the_whole_release() {
    if !nix::unistd::Uid::effective().is_root() {
        return;
    }
    let nobody = nix::unistd::User::from_name("nobody").unwrap().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeScm::with_files(&[
        ("main.js", "main"),
        ("lib/deep/util.js", "util"),
    ]));
    let mut spec = git_spec(tmp.path());
    spec.user = Some("nobody".to_string());

    let report = harness.deployer.deploy(&spec).await.unwrap();
    let layout = spec.layout();
    let release_dir = layout.release_dir(&report.release.unwrap().id);

    for path in [
        release_dir.path().join("lib/deep/util.js"),
        release_dir.path().join("server.js"),
        layout.cached_copy_dir().path().join("lib/deep/util.js"),
        layout.cached_copy_dir().path().join(".git"),
    ] {
        let uid = std::fs::symlink_metadata(&path).unwrap().uid();
        assert_eq!(uid, nobody.uid.as_raw(), "{}", path.display());
    }
}

#[tokio::test]
#[serial]
async fn test_checkout_commands_get_home_in_their_environment() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("home/deploy");
    std::fs::create_dir_all(&home).unwrap();

    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.home = Some(home.clone());

    harness.deployer.deploy(&spec).await.unwrap();
    assert_eq!(harness.scm.home_in_env.lock().unwrap().as_deref(), home.to_str());

    // Without a deploy home the child inherits the agent's environment.
    spec.home = None;
    harness.deployer.deploy(&spec).await.unwrap();
    assert!(harness.scm.home_in_env.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_delete_cached_copy_starts_from_scratch() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());

    harness.deployer.deploy(&spec).await.unwrap();
    let marker = spec.layout().cached_copy_dir().path().join("leftover.txt");
    std::fs::write(&marker, "from an earlier checkout").unwrap();

    // The cached copy is updated in place by default.
    let report = harness.deployer.deploy(&spec).await.unwrap();
    assert!(marker.exists());
    let release_dir = spec.layout().release_dir(&report.release.unwrap().id);
    assert!(release_dir.file("leftover.txt").exists().await);

    spec.delete_cached_copy = true;
    let report = harness.deployer.deploy(&spec).await.unwrap();
    assert!(!marker.exists());
    let release_dir = spec.layout().release_dir(&report.release.unwrap().id);
    assert!(!release_dir.file("leftover.txt").exists().await);
    assert!(release_dir.file("main.js").exists().await);
}

#[tokio::test]
async fn test_migrate_command_runs_in_the_release() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.migrate = true;
    spec.migrate_command = Some("echo \"$MIGRATION_SET\" > migrated.txt".to_string());
    spec.environment
        .insert("MIGRATION_SET".to_string(), "all".to_string());

    harness.deployer.deploy(&spec).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(spec.layout().current_link().join("migrated.txt")).unwrap(),
        "all\n"
    );

    // A command set without the migrate flag is ignored.
    spec.migrate = false;
    spec.migrate_command = Some("exit 7".to_string());
    let second = harness.deployer.deploy(&spec).await.unwrap().release.unwrap();

    spec.migrate = true;
    let err = harness.deployer.deploy(&spec).await.unwrap_err();
    assert!(matches!(err, DeployError::BuildStepFailed(_)));
    assert_eq!(read_link_name(&spec.layout().current_link()), Some(second.id));
    assert_eq!(harness.restarter.restarted.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_npm_install_runs_when_enabled() {
    let tmp = tempfile::tempdir().unwrap();
    let bin = tmp.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let npm = bin.join("npm");
    std::fs::write(&npm, "#!/bin/sh\necho \"$@\" > npm-args.txt\n").unwrap();
    std::fs::set_permissions(&npm, std::fs::Permissions::from_mode(0o755)).unwrap();

    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.auto_npm_install_on_deploy = true;
    spec.environment
        .insert("PATH".to_string(), format!("{}:/usr/bin:/bin", bin.display()));

    harness.deployer.deploy(&spec).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(spec.layout().current_link().join("npm-args.txt")).unwrap(),
        "install --production\n"
    );

    // A failing install stops the run before the switch.
    std::fs::write(&npm, "#!/bin/sh\nexit 1\n").unwrap();
    let current = read_link_name(&spec.layout().current_link());
    let err = harness.deployer.deploy(&spec).await.unwrap_err();
    assert!(matches!(err, DeployError::BuildStepFailed(_)));
    assert_eq!(read_link_name(&spec.layout().current_link()), current);
}

#[tokio::test]
async fn test_build_without_entrypoint_fails_before_the_switch() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let spec = git_spec(tmp.path());
    let first = harness.deployer.deploy(&spec).await.unwrap().release.unwrap();

    harness.transformer.skip_entrypoint.store(true, Ordering::SeqCst);
    let err = harness.deployer.deploy(&spec).await.unwrap_err();
    assert!(matches!(err, DeployError::BuildStepFailed(ref m) if m.contains("server.js")));
    assert_eq!(read_link_name(&spec.layout().current_link()), Some(first.id));
}

#[tokio::test]
async fn test_subversion_source_is_deployed() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(app_files());
    let mut spec = git_spec(tmp.path());
    spec.scm = Some(ScmConfig::of_type("svn").with_repository("https://svn.example.com/todos/trunk"));

    let report = harness.deployer.deploy(&spec).await.unwrap();
    let layout = spec.layout();
    let release_dir = layout.release_dir(&report.release.unwrap().id);

    assert!(layout.cached_copy_dir().subdir(".svn").exists().await);
    assert!(release_dir.file("main.js").exists().await);
    assert!(release_dir.file("server.js").exists().await);
    assert!(!release_dir.subdir(".svn").exists().await);
    assert_eq!(harness.scm.syncs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_object_storage_source_is_staged_as_git() {
    let tmp = tempfile::tempdir().unwrap();
    let tarball = tmp.path().join("todos.tar.gz");
    write_tarball(&tarball, &[("bundle/main.js", "from s3")]);

    let harness = Harness::new(FakeScm::default());
    let mut spec = git_spec(tmp.path());
    let url = url::Url::from_file_path(&tarball).unwrap();
    spec.scm = Some(ScmConfig::of_type("s3").with_repository(url.as_str()));

    let report = harness.deployer.deploy(&spec).await.unwrap();
    let release_dir = spec.layout().release_dir(&report.release.unwrap().id);

    assert_eq!(
        std::fs::read_to_string(release_dir.path().join("main.js")).unwrap(),
        "from s3"
    );
    assert!(!release_dir.subdir(".git").exists().await);
    let inits = harness.scm.inits.lock().unwrap();
    assert_eq!(inits.len(), 1);
    assert!(inits[0].ends_with("scm-staging/archive/bundle"));
}

#[tokio::test]
async fn test_before_checkout_script_comes_from_the_cached_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeScm::with_files(&[
        ("main.js", "main"),
        ("deploy/before_checkout.sh", "echo \"$RELEASE_ID\" > before-checkout.out\n"),
    ]));
    let spec = git_spec(tmp.path());

    // Nothing is cached yet on the first run.
    let report = harness.deployer.deploy(&spec).await.unwrap();
    assert!(matches!(report.outcome(Stage::BeforeCheckout), Some(StageOutcome::Skipped(_))));

    let report = harness.deployer.deploy(&spec).await.unwrap();
    let release = report.release.clone().unwrap();
    assert_eq!(report.outcome(Stage::BeforeCheckout), Some(&StageOutcome::Ran));
    assert_eq!(
        std::fs::read_to_string(spec.layout().current_link().join("before-checkout.out")).unwrap(),
        format!("{}\n", release.id)
    );
}

fn write_tarball(path: &Path, files: &[(&str, &str)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}
