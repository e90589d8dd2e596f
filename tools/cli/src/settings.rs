//! Settings loading from the settings file and `BWSYNC_` environment.

use anyhow::{Context, Result};
use config::{Config, Environment, File, Map};
use std::path::Path;

use bwsync_common::{RawSettings, Settings};

/// Prefix of environment overrides, e.g. `BWSYNC_SYNC__FILE_RETENTION`.
const ENV_PREFIX: &str = "BWSYNC";

/// Load and validate settings.
///
/// The settings file is optional; environment variables override it.
pub fn load(path: &Path) -> Result<Settings> {
    let working_dir = std::env::current_dir().context("Failed to determine working directory")?;
    load_from(path, None, &working_dir)
}

/// Load settings with an explicit environment (all of the process
/// environment when `None`) and base directory for relative paths.
pub fn load_from(
    path: &Path,
    env: Option<Map<String, String>>,
    working_dir: &Path,
) -> Result<Settings> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        )
        .build()
        .with_context(|| format!("Failed to read settings from {}", path.display()))?
        .try_deserialize()
        .context("Malformed settings")?;

    raw.validate(working_dir).context("Invalid settings")
}
