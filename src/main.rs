//! AppShots - App Store screenshot capture for iOS simulators
//!
//! Main entry point for the command-line tool.
//!
//! # Execution Flow
//!
//! 1. Parse arguments and initialize logging (logs/appshots.<date> + stderr)
//! 2. Create the tokio runtime
//! 3. Load `appshots.yaml` and layer run settings (file + `APPSHOTS_SETTINGS__*`)
//! 4. Validate the plan; any plan error aborts before a simulator is touched
//! 5. Run the capture orchestrator; Ctrl-C cancels in-flight screens
//! 6. Print the report and write `report.yaml` next to the screenshots
//!
//! The process exits non-zero when any pair did not end Captured.

mod cli;

use anyhow::{Context, Result, bail};
use appshots::config::ConfigManager;
use appshots::models::{AppShotsConfig, DeviceProfile, RawScreen, RunSettings, validate_screens};
use appshots::report::RunReport;
use appshots::services::{CaptureOrchestrator, OutputLayout, SimctlConnector, clean_simulators};
use appshots::{APP_NAME, VERSION};
use clap::Parser;
use cli::{Cli, Commands};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let _guard =
        appshots::logging::setup_logging_with_console(&cli.log_dir, "appshots", cli.debug, true)?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("appshots-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let manager = ConfigManager::new(&cli.config);

    let result = match cli.command {
        Commands::Capture {
            devices,
            screens,
            timeout,
        } => runtime.block_on(capture(&manager, &devices, &screens, timeout)),
        Commands::Validate => validate(&manager).map(|()| ExitCode::SUCCESS),
        Commands::Clean => runtime.block_on(clean()).map(|()| ExitCode::SUCCESS),
        Commands::Init { output, force } => {
            let manager = output.map(ConfigManager::new).unwrap_or(manager);
            manager.write_template(force).map(|()| {
                println!("Wrote {}", manager.config_path());
                ExitCode::SUCCESS
            })
        }
    };

    runtime.shutdown_timeout(Duration::from_secs(5));

    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}

/// Load the project and its layered settings.
fn load(manager: &ConfigManager) -> Result<(AppShotsConfig, RunSettings)> {
    let config = manager.load()?;
    let settings = manager.run_settings(&config)?;
    Ok((config, settings))
}

fn validate(manager: &ConfigManager) -> Result<()> {
    let (config, _settings) = load(manager)?;
    let screens = validate_screens(&config.screens).context("Invalid plan")?;
    let devices = config.device_profiles();
    let mut names = std::collections::HashSet::new();
    for device in &devices {
        if !names.insert(device.name.as_str()) {
            bail!("duplicate device name '{}'", device.name);
        }
        if device.effective_resolution().is_none() {
            tracing::warn!(
                "No known resolution for device '{}' ({})",
                device.name,
                device.device_type
            );
        }
    }
    println!(
        "{}: {} screens x {} devices = {} captures",
        manager.config_path(),
        screens.len(),
        devices.len(),
        screens.len() * devices.len()
    );
    Ok(())
}

/// Keep only the named entries; an unknown name is an error.
fn select<T>(
    items: Vec<T>,
    wanted: &[String],
    name: impl Fn(&T) -> &str,
    what: &str,
) -> Result<Vec<T>> {
    if let Some(unknown) = wanted.iter().find(|w| !items.iter().any(|i| name(i) == w.as_str())) {
        bail!("unknown {} '{}'", what, unknown);
    }
    if wanted.is_empty() {
        return Ok(items);
    }
    Ok(items
        .into_iter()
        .filter(|i| wanted.iter().any(|w| w == name(i)))
        .collect())
}

async fn capture(
    manager: &ConfigManager,
    device_filter: &[String],
    screen_filter: &[String],
    timeout: Option<u64>,
) -> Result<ExitCode> {
    let (config, mut settings) = load(manager)?;
    if timeout.is_some() {
        settings.run_timeout_secs = timeout;
    }

    let devices: Vec<DeviceProfile> =
        select(config.device_profiles(), device_filter, |d| d.name.as_str(), "device")?;
    let screens: Vec<RawScreen> =
        select(config.screens.clone(), screen_filter, |s| s.name.as_str(), "screen")?;

    let layout = OutputLayout::from_config(&config.output);
    let connector = Arc::new(SimctlConnector::new(&config, &settings));
    let orchestrator = CaptureOrchestrator::new(connector, settings, layout.clone());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            tracing::warn!("Received Ctrl+C, cancelling capture");
            let _ = cancel_tx.send(true);
        }
    });

    let results = orchestrator
        .run_raw(&screens, &devices, cancel_rx)
        .await
        .context("Invalid plan")?;

    orchestrator.metrics().log_summary();

    let report = RunReport::new(results);
    print!("{}", report.render_text());
    report.write_yaml(layout.directory())?;

    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn clean() -> Result<()> {
    let removed = clean_simulators(RunSettings::default().command_timeout()).await?;
    println!("Deleted {} simulators", removed);
    Ok(())
}
