//! Service settings: raw deserialized form and the validated, immutable
//! structures handed to the sync core.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::{Error, Result, SensitiveString};

/// Server used when no valid API URL is configured.
pub const DEFAULT_SERVER_URL: &str = "https://vault.bitwarden.com";

/// Schedule used when the configured one is missing or invalid.
pub const DEFAULT_CRON_SCHEDULE: &str = "0 0 * * *";

/// Minimum length of a custom export encryption key.
pub const MIN_CUSTOM_KEY_LENGTH: usize = 8;

/// Default time limit for a single client command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Settings as read from the settings file and environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    pub bitwarden: RawBitwardenSettings,
    pub sync: RawSyncSettings,
    pub client: RawClientSettings,
}

/// `bitwarden` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawBitwardenSettings {
    pub api_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<SensitiveString>,
    pub vault_password: Option<SensitiveString>,
}

/// `sync` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSyncSettings {
    pub cron_schedule: Option<String>,
    pub run_on_startup: bool,
    pub include_organisation_items: bool,
    pub encrypt_using_custom_key: bool,
    pub encryption_key: Option<SensitiveString>,
    pub file_retention: Option<i64>,
    pub data_directory: Option<PathBuf>,
    pub schedule_timezone: ScheduleZone,
}

/// `client` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawClientSettings {
    pub install_directory: Option<PathBuf>,
    pub executable: Option<PathBuf>,
    pub command_timeout_secs: Option<u64>,
}

/// Timezone in which cron expressions are evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleZone {
    /// The host's local timezone.
    #[default]
    Local,
    /// Coordinated universal time.
    Utc,
}

/// Credentials and server for the vault client.
#[derive(Debug, Clone)]
pub struct VaultCredentials {
    pub client_id: String,
    pub client_secret: SensitiveString,
    pub vault_password: SensitiveString,
    pub server_url: Url,
}

/// How and when vault exports are produced and retained.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Cron expression as configured (validated later by the schedule driver).
    pub cron_schedule: String,
    pub schedule_zone: ScheduleZone,
    pub run_on_startup: bool,
    pub include_organisations: bool,
    /// Custom export key; `None` means the account key is used.
    pub encryption_key: Option<SensitiveString>,
    /// Number of export directories to keep; `None` keeps everything.
    pub retention: Option<usize>,
    /// Absolute, existing directory receiving export runs.
    pub data_directory: PathBuf,
}

/// Where the vault client lives and how long its commands may run.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub install_directory: PathBuf,
    /// Pre-installed client; provisioning is skipped when set.
    pub executable: Option<PathBuf>,
    pub command_timeout: Duration,
}

/// Fully validated settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: VaultCredentials,
    pub policy: SyncPolicy,
    pub client: ClientSettings,
}

impl RawSettings {
    /// Validate into immutable settings.
    ///
    /// Relative paths are resolved against `working_dir`, and the data
    /// directory is created when it does not exist yet.
    ///
    /// # Errors
    /// - Missing client id, client secret or vault password
    /// - Data directory cannot be created
    pub fn validate(self, working_dir: &Path) -> Result<Settings> {
        let credentials = validate_credentials(self.bitwarden)?;
        let policy = validate_sync(self.sync, working_dir)?;
        let client = validate_client(self.client, working_dir);

        Ok(Settings {
            credentials,
            policy,
            client,
        })
    }
}

fn validate_credentials(raw: RawBitwardenSettings) -> Result<VaultCredentials> {
    let client_id = raw
        .client_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::Config("bitwarden.client_id is required".to_string()))?;
    let client_secret = raw
        .client_secret
        .filter(|secret| !secret.is_blank())
        .ok_or_else(|| Error::Config("bitwarden.client_secret is required".to_string()))?;
    let vault_password = raw
        .vault_password
        .filter(|password| !password.is_blank())
        .ok_or_else(|| Error::Config("bitwarden.vault_password is required".to_string()))?;

    Ok(VaultCredentials {
        client_id,
        client_secret,
        vault_password,
        server_url: parse_server_url(raw.api_url.as_deref()),
    })
}

/// Parse the configured server URL, falling back to the default server.
pub fn parse_server_url(value: Option<&str>) -> Url {
    let default = || Url::parse(DEFAULT_SERVER_URL).expect("default server URL is valid");

    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return default();
    };

    match Url::parse(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => url,
        _ => {
            warn!(
                "Invalid API URL '{}' in configuration, using default server {}",
                value, DEFAULT_SERVER_URL
            );
            default()
        }
    }
}

fn validate_sync(raw: RawSyncSettings, working_dir: &Path) -> Result<SyncPolicy> {
    let retention = match raw.file_retention {
        Some(value) if value <= 0 => {
            warn!(
                "File retention should be absent or larger than 0 (current value: {}), keeping all exports",
                value
            );
            None
        }
        Some(value) => Some(usize::try_from(value).map_err(|_| {
            Error::Config(format!("sync.file_retention {} is out of range", value))
        })?),
        None => None,
    };

    let key = raw.encryption_key.filter(|key| !key.is_blank());
    let encryption_key = match (raw.encrypt_using_custom_key, key) {
        (false, Some(_)) => {
            warn!(
                "Custom key encryption is disabled, but an encryption key is defined; the key is ignored"
            );
            None
        }
        (false, None) => None,
        (true, None) => {
            warn!(
                "Custom key encryption is enabled, but no encryption key was supplied; using account key encryption"
            );
            None
        }
        (true, Some(key)) => {
            if key.char_count() < MIN_CUSTOM_KEY_LENGTH {
                warn!(
                    "Custom encryption key is shorter than {} characters; exports will use the account key instead",
                    MIN_CUSTOM_KEY_LENGTH
                );
            }
            Some(key)
        }
    };

    let cron_schedule = raw
        .cron_schedule
        .map(|expr| expr.trim().to_string())
        .filter(|expr| !expr.is_empty())
        .unwrap_or_else(|| DEFAULT_CRON_SCHEDULE.to_string());

    let data_directory = absolutize(
        raw.data_directory
            .unwrap_or_else(|| PathBuf::from("data")),
        working_dir,
    );
    std::fs::create_dir_all(&data_directory).map_err(|e| {
        Error::Config(format!(
            "data directory {} cannot be created: {}",
            data_directory.display(),
            e
        ))
    })?;
    if !data_directory.is_dir() {
        return Err(Error::Config(format!(
            "data directory {} is not a directory",
            data_directory.display()
        )));
    }

    Ok(SyncPolicy {
        cron_schedule,
        schedule_zone: raw.schedule_timezone,
        run_on_startup: raw.run_on_startup,
        include_organisations: raw.include_organisation_items,
        encryption_key,
        retention,
        data_directory,
    })
}

fn validate_client(raw: RawClientSettings, working_dir: &Path) -> ClientSettings {
    ClientSettings {
        install_directory: absolutize(
            raw.install_directory
                .unwrap_or_else(|| PathBuf::from("client")),
            working_dir,
        ),
        executable: raw.executable.map(|path| absolutize(path, working_dir)),
        command_timeout: raw
            .command_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
    }
}

fn absolutize(path: PathBuf, working_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        working_dir.join(path)
    }
}
