//! ESPHome Selective Updater - Entry Point
//!
//! Runs once over the device fleet: compiles and uploads only the devices
//! that need it, resuming from the progress journal of an interrupted run.

use std::env;
use std::path::PathBuf;

use selective_updater::app::housekeeping;
use selective_updater::app::options::AppOptions;
use selective_updater::app::run::{exit_code, run, Collaborators, EXIT_ERROR};
use selective_updater::logs::{init_logging, LogLevel, LogOptions};
use selective_updater::models::mode::OperatingMode;
use selective_updater::shutdown::Shutdown;
use selective_updater::storage::layout::StorageLayout;
use selective_updater::storage::settings::Settings;
use selective_updater::storage::state::HousekeepingState;
use selective_updater::utils::{parse_cli_args, version_info};

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli_args = parse_cli_args(env::args().skip(1));

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let defaults = StorageLayout::default();
    let layout = StorageLayout::new(
        cli_args
            .get("config-dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| defaults.config_dir.clone()),
        cli_args
            .get("data-dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| defaults.data_dir.clone()),
    );

    // Retrieve the settings file
    let options_file = match cli_args.get("options") {
        Some(path) => selective_updater::filesys::file::File::new(path),
        None => layout.options_file(),
    };
    let mut settings = Settings::load_or_default(&options_file).await;
    let mut cli_errors = Vec::new();
    if let Some(mode) = cli_args.get("mode") {
        match mode.parse::<OperatingMode>() {
            Ok(mode) => settings.mode = mode,
            Err(e) => cli_errors.push(e),
        }
    }
    if let Some(level) = cli_args.get("log-level") {
        match level.parse::<LogLevel>() {
            Ok(level) => settings.log_level = level,
            Err(e) => cli_errors.push(e),
        }
    }
    if cli_args.contains_key("dry-run") {
        settings.dry_run = true;
    }

    // Housekeeping decides whether the log is truncated before it is opened
    let state_file = layout.state_file();
    let state = HousekeepingState::load_or_default(&state_file).await;
    let (plan, next_state) = housekeeping::plan(&settings, &state, &version.version);
    let log_file = layout.log_file();
    if plan.clears_log() {
        if let Err(e) = log_file.truncate().await {
            eprintln!("Failed to clear log file {}: {e}", log_file.path().display());
        }
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level,
        log_file: Some(log_file.path().to_path_buf()),
        ..Default::default()
    };
    let log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    info!("Options read from {}", options_file.path().display());
    plan.report();
    if let Err(e) = layout.setup().await {
        warn!("Unable to prepare storage directories: {}", e);
    }
    if let Err(e) = next_state.save(&state_file).await {
        warn!("Unable to save housekeeping state: {}", e);
    }

    for e in &cli_errors {
        error!("{}", e);
    }
    let code = if cli_errors.is_empty() {
        match AppOptions::from_settings(&settings, layout) {
            Ok(mut options) => {
                options.reset_progress = plan.resets_progress();

                let (trigger, shutdown) = Shutdown::new();
                tokio::spawn(async move {
                    await_shutdown_signal().await;
                    trigger.trigger();
                });

                let collaborators = Collaborators::production(&options, shutdown.clone());
                let result = run(&version.version, options, collaborators, shutdown).await;
                if let Err(e) = &result {
                    error!("Run failed: {e}");
                }
                exit_code(&result)
            }
            Err(e) => {
                error!("Invalid configuration: {e}");
                EXIT_ERROR
            }
        }
    } else {
        EXIT_ERROR
    };

    info!("Exiting with status {}", code);
    drop(log_guard);
    std::process::exit(code);
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                warn!("Unable to install signal handlers, falling back to Ctrl+C");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl+C received, stopping after the current step...");
                    return;
                }
                std::future::pending::<()>().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, stopping after the current step...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, stopping after the current step...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping after the current step...");
        } else {
            std::future::pending::<()>().await;
        }
    }
}
