//! Stagehand - Entry Point
//!
//! Stages application builds from a build repository into a CouchDB-like
//! database, warms their views and cuts production over to them.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::Context;
use colored::Colorize;
use tracing::{error, info};

use stagehand::app::options::{AppOptions, DeploymentRequest, StorageOptions};
use stagehand::app::run::run;
use stagehand::filesys::file::File;
use stagehand::logs::{init_logging, LogOptions};
use stagehand::storage::layout::StorageLayout;
use stagehand::storage::settings::{Mode, Settings};
use stagehand::utils::version_info;

const USAGE: &str = "\
Usage: stagehand [options]

Options:
  --install=<package>   Install a build, e.g. medic:medic:3.0.0 or @medic:medic:release
  --stage=<package>     Download and warm a build without deploying it
  --complete            Deploy the build staged earlier
  --no-daemon           Process the pending deployment, then exit
  --dev                 Development mode (apps under ./temp/deployments)
  --local               Local mode (apps under ~/.stagehand/deployments)
  --settings=<path>     Settings file (default ~/.stagehand/settings.json)
  --version             Print version information
  --help                Print this help

Packages are [@]namespace:application:version, or [@]version for the
default application. A leading @ names a release channel.

COUCH_URL must point at the application database.";

#[tokio::main]
async fn main() {
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
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("stagehand {}", version.version),
        }
        return;
    }

    if cli_args.contains_key("help") {
        println!("{} {}\n", "Stagehand".bold(), version.version);
        println!("{}", USAGE);
        return;
    }

    let settings = match load_settings(&cli_args).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = match build_options(&settings, &cli_args) {
        Ok(options) => options,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    info!("Running stagehand {} in {:?} mode", version.version, options.mode.mode);
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Stagehand stopped: {e}");
        std::process::exit(1);
    }
}

async fn load_settings(cli_args: &HashMap<String, String>) -> anyhow::Result<Settings> {
    let layout = StorageLayout::default();
    let explicit = cli_args.get("settings").map(PathBuf::from);
    let file = match &explicit {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };

    let mut settings = if explicit.is_some() || file.exists().await {
        file.read_json::<Settings>()
            .await
            .with_context(|| format!("Unable to read settings file {}", file.path().display()))?
    } else {
        Settings::default()
    };

    if cli_args.contains_key("dev") {
        settings.mode = Mode::Development;
    } else if cli_args.contains_key("local") {
        settings.mode = Mode::Local;
    }

    Ok(settings.with_env(|key| env::var(key).ok()))
}

fn build_options(
    settings: &Settings,
    cli_args: &HashMap<String, String>,
) -> anyhow::Result<AppOptions> {
    let requests: Vec<DeploymentRequest> = [
        cli_args.get("install").cloned().map(DeploymentRequest::Install),
        cli_args.get("stage").cloned().map(DeploymentRequest::Stage),
        cli_args
            .contains_key("complete")
            .then_some(DeploymentRequest::Complete),
    ]
    .into_iter()
    .flatten()
    .collect();

    if requests.len() > 1 {
        anyhow::bail!("Only one of --install, --stage and --complete can be given");
    }

    let daemon = !cli_args.contains_key("no-daemon");
    AppOptions::from_settings(
        settings,
        StorageOptions::default(),
        daemon,
        requests.into_iter().next(),
    )
    .context("Invalid configuration")
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down...");
        }
    }
}
