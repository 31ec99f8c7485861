//! Shipwright - Entry Point
//!
//! Deploys or rolls back one application described by a JSON deployment spec.
//! Invoked once per request by the configuration-management layer.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context};
use shipwright::deploy::executor::{DeployReport, Deployer};
use shipwright::filesys::file::File;
use shipwright::logs::{init_logging, LogLevel, LogOptions};
use shipwright::models::spec::{DeployAction, DeploymentSpec};
use shipwright::utils::version_info;

use tracing::{error, info, warn};

// HOME is overridden during checkout, so everything runs on one thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        let version = version_info();
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    match run(&cli_args).await {
        Ok(report) if report.is_clean() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("shipwright: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli_args: &HashMap<String, String>) -> anyhow::Result<DeployReport> {
    let spec_path = cli_args
        .get("spec")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: shipwright --spec=<path> [--action=deploy|rollback]"))?;

    // Retrieve the deployment spec
    let mut spec = File::new(&spec_path)
        .read_json::<DeploymentSpec>()
        .await
        .with_context(|| format!("unable to read deployment spec {}", spec_path.display()))?;

    if let Some(action) = cli_args.get("action") {
        spec.action = action.parse::<DeployAction>().map_err(|e| anyhow!(e))?;
    }

    let log_level = match cli_args.get("log-level") {
        Some(level) => level.parse::<LogLevel>().map_err(|e| anyhow!(e))?,
        None => LogLevel::Info,
    };

    // Initialize logging, to the shared log directory once the root exists
    let log_dir = spec.layout().log_dir();
    let log_options = LogOptions {
        log_level,
        json_format: cli_args.contains_key("json-logs"),
        log_dir: log_dir
            .exists()
            .await
            .then(|| log_dir.path().to_path_buf()),
        ..Default::default()
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let version = version_info();
    info!(
        "Shipwright {} ({}): {:?} {}",
        version.version, version.git_hash, spec.action, spec.application
    );

    let report = match Deployer::system().run(&spec).await {
        Ok(report) => report,
        Err(e) => {
            error!("{:?} of {} failed: {}", spec.action, spec.application, e);
            return Err(e).with_context(|| format!("{:?} of {} failed", spec.action, spec.application));
        }
    };

    if let Some(release) = &report.release {
        info!("Active release of {} is {}", report.application, release.id);
    }
    for (stage, outcome) in &report.stages {
        info!("  {}: {:?}", stage, outcome);
    }
    if !report.pruned.is_empty() {
        info!("Pruned releases: {}", report.pruned.join(", "));
    }
    for failure in &report.post_promote_failures {
        error!("{} failed: {}", failure.stage, failure.message);
    }
    if !report.is_clean() {
        warn!("The release is active but the service may not be running");
    }

    Ok(report)
}
