use crate::models::{AppShotsConfig, RunSettings};
use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use ::config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::fs;

/// Default project file name.
pub const CONFIG_FILE_NAME: &str = "appshots.yaml";

/// Environment variables `APPSHOTS_SETTINGS__<KEY>` override `settings.<key>`.
pub const SETTINGS_ENV_PREFIX: &str = "APPSHOTS_SETTINGS";

/// Starter project written by `appshots init`.
pub const TEMPLATE: &str = r#"# AppShots project file
app:
  bundle_id: com.example.app
  # app_path: build/Build/Products/Debug-iphonesimulator/Example.app

runtime: com.apple.CoreSimulator.SimRuntime.iOS-26-1

devices:
  - name: iPhone 16 Pro Max
    type: iPhone 16 Pro Max
  - name: iPad Pro 13
    type: iPad Pro 13-inch (M4)

screens:
  - name: 01-dashboard
    defaults:
      hasCompletedOnboarding: true
    navigation: []

  - name: 02-settings
    defaults:
      hasCompletedOnboarding: true
    navigation:
      - tap_tab: Settings
        expect: Notifications
    wait_seconds: 1.0

output:
  directory: ./screenshots
  organize_by: device
  format: png

settings:
  max_attempts: 3
  max_parallel_devices: 2
"#;

/// Configuration manager for the project file.
///
/// The project file carries the app, devices, screens and output settings. Run tunables
/// ([`RunSettings`]) are layered on top: built-in defaults, then the `settings:` section,
/// then `APPSHOTS_SETTINGS__*` environment variables.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a ConfigManager for the given project file.
    ///
    /// # Arguments
    /// * `config_path` - Path to the project file (e.g., "appshots.yaml")
    pub fn new<P: AsRef<Utf8Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Load the project file.
    ///
    /// Unlike run settings there is nothing sensible to default to, so a missing file is
    /// an error.
    pub fn load(&self) -> Result<AppShotsConfig> {
        let file_contents = fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read config: {}", self.config_path))?;

        let config: AppShotsConfig = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse config: {}", self.config_path))?;

        ensure!(
            !config.app.bundle_id.trim().is_empty(),
            "app.bundle_id must not be empty in {}",
            self.config_path
        );

        tracing::info!(
            "Loaded config from {} ({} devices, {} screens)",
            self.config_path,
            config.devices.len(),
            config.screens.len()
        );
        Ok(config)
    }

    /// Save the project file, creating its directory if needed.
    pub fn save(&self, config: &AppShotsConfig) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(config).context("Failed to serialize config to YAML")?;

        self.write(&yaml_string)?;
        tracing::info!("Saved config to {}", self.config_path);
        Ok(())
    }

    /// Write the starter project. Refuses to replace an existing file unless `overwrite`.
    pub fn write_template(&self, overwrite: bool) -> Result<()> {
        ensure!(
            overwrite || !self.exists(),
            "{} already exists (use --force to overwrite)",
            self.config_path
        );
        self.write(TEMPLATE)?;
        tracing::info!("Wrote starter config to {}", self.config_path);
        Ok(())
    }

    fn write(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent))?;
        }
        fs::write(&self.config_path, contents)
            .with_context(|| format!("Failed to write config: {}", self.config_path))
    }

    /// Layered run settings for `config`, reading overrides from the process environment.
    pub fn run_settings(&self, config: &AppShotsConfig) -> Result<RunSettings> {
        layered_settings(config, None)
    }
}

/// Build [`RunSettings`] from defaults, the `settings:` section and the environment.
///
/// `env` replaces the process environment when given.
pub fn layered_settings(
    config: &AppShotsConfig,
    env: Option<HashMap<String, String>>,
) -> Result<RunSettings> {
    let mut builder = Config::builder();

    if let Some(section) = &config.settings {
        let yaml = serde_yaml_ng::to_string(section)
            .context("Failed to serialize settings section")?;
        builder = builder.add_source(File::from_str(&yaml, FileFormat::Yaml));
    }

    builder = builder.add_source(
        Environment::with_prefix(SETTINGS_ENV_PREFIX)
            .prefix_separator("__")
            .try_parsing(true)
            .source(env),
    );

    let settings: RunSettings = builder
        .build()
        .context("Failed to layer run settings")?
        .try_deserialize()
        .context("Invalid run settings")?;

    validate_settings(&settings)?;
    tracing::debug!("Run settings: {:?}", settings);
    Ok(settings)
}

fn validate_settings(settings: &RunSettings) -> Result<()> {
    ensure!(settings.max_attempts >= 1, "settings.max_attempts must be at least 1");
    ensure!(
        settings.max_parallel_devices >= 1,
        "settings.max_parallel_devices must be at least 1"
    );
    ensure!(
        settings.tree_command.contains("{udid}"),
        "settings.tree_command must contain '{{udid}}'"
    );
    Ok(())
}
