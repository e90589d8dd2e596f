//! Vault client provisioning.
//!
//! Makes sure the pinned client release is installed in the install
//! directory, downloading and unpacking the platform archive when the
//! executable is missing or a different version.

use reqwest::{Client, StatusCode};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bwsync_common::{Error, Result};

use crate::retry::RetryPolicy;

/// Client release installed by the provisioner.
pub const CLIENT_VERSION: &str = "2024.2.0";

const RELEASE_BASE_URL: &str = "https://github.com/bitwarden/clients/releases/download";
const VERSION_FILE: &str = "version";
const DOWNLOAD_SUFFIX: &str = ".download";

/// Time limit for establishing a connection to the release server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Time limit for a whole archive download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(100);

/// Platforms with a published client build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
}

impl Platform {
    /// Platform of the running process.
    ///
    /// # Errors
    /// - `PlatformNotSupported` on any other operating system
    pub fn current() -> Result<Self> {
        match std::env::consts::OS {
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            "macos" => Ok(Platform::MacOs),
            other => Err(Error::PlatformNotSupported(other.to_string())),
        }
    }

    /// Name of the client executable.
    pub fn executable_name(self) -> &'static str {
        match self {
            Platform::Windows => "bw.exe",
            Platform::Linux | Platform::MacOs => "bw",
        }
    }

    /// Release archive URL for a client version.
    pub fn download_url(self, version: &str) -> String {
        let os = match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
        };
        format!("{RELEASE_BASE_URL}/cli-v{version}/bw-{os}-{version}.zip")
    }
}

/// Installs and locates the vault client executable.
pub struct ClientProvisioner {
    install_dir: PathBuf,
    platform: Platform,
    version: String,
    http: Client,
    retry: RetryPolicy,
    download_timeout: Duration,
}

impl ClientProvisioner {
    /// Create a provisioner for the current platform.
    ///
    /// # Errors
    /// - `PlatformNotSupported` on an unsupported operating system
    /// - HTTP client construction failed
    pub fn new(install_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_platform(install_dir, Platform::current()?)
    }

    /// Create a provisioner for an explicit platform.
    pub fn with_platform(install_dir: impl Into<PathBuf>, platform: Platform) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("bwsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            install_dir: install_dir.into(),
            platform,
            version: CLIENT_VERSION.to_string(),
            http,
            retry: RetryPolicy::new(3),
            download_timeout: DOWNLOAD_TIMEOUT,
        })
    }

    /// Replace the retry policy for downloads.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the time limit for one archive download.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Path the executable is installed at.
    pub fn executable_path(&self) -> PathBuf {
        self.install_dir.join(self.platform.executable_name())
    }

    /// Whether the pinned version is already installed.
    pub async fn is_current(&self) -> bool {
        if !tokio::fs::try_exists(self.executable_path()).await.unwrap_or(false) {
            debug!("Client executable not found");
            return false;
        }

        match installed_version(&self.install_dir).await {
            Some(version) if version == self.version => true,
            Some(version) => {
                info!(
                    "Installed client version {} differs from required {}",
                    version, self.version
                );
                false
            }
            None => {
                warn!("Client version file missing or unreadable");
                false
            }
        }
    }

    /// Ensure the client is installed and return the executable path.
    ///
    /// # Errors
    /// - `Download` when the archive cannot be fetched or lacks the executable
    /// - `Network` when transport errors persist after retries
    /// - `Cancelled` when `cancel` fires during the download
    pub async fn ensure_available(&self, cancel: &CancellationToken) -> Result<PathBuf> {
        let executable = self.executable_path();
        info!("Checking for vault client in {}", self.install_dir.display());

        if self.is_current().await {
            info!("Up-to-date client {} found, skipping download", self.version);
        } else {
            tokio::fs::create_dir_all(&self.install_dir).await?;
            let url = self.platform.download_url(&self.version);
            info!("Downloading vault client {} from {}", self.version, url);

            let archive = tokio::select! {
                result = self.fetch(&url) => result?,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };

            let install_dir = self.install_dir.clone();
            let entry = self.platform.executable_name();
            let version = self.version.clone();
            tokio::task::spawn_blocking(move || {
                install_archive(&archive, entry, &install_dir, &version)
            })
            .await
            .map_err(|e| Error::Download(format!("Install task failed: {}", e)))??;

            info!("Vault client {} installed", self.version);
        }

        set_executable_permissions(&executable).await?;
        Ok(executable)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.retry.run(|| self.download(url)).await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let transport_error = |e: reqwest::Error| {
            if e.is_timeout() {
                Error::Timeout {
                    command: format!("GET {}", url),
                    after: self.download_timeout,
                }
            } else {
                Error::Network(format!("Failed to download client: {}", e))
            }
        };

        let response = self
            .http
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("Client download rejected with HTTP {}", status);
            return Err(if is_transient_status(status) {
                Error::Network(message)
            } else {
                Error::Download(message)
            });
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }
}

/// Server-side conditions that usually clear up on their own.
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Read the version recorded by the last install.
pub async fn installed_version(install_dir: &Path) -> Option<String> {
    tokio::fs::read_to_string(install_dir.join(VERSION_FILE))
        .await
        .ok()
        .map(|version| version.trim().to_string())
        .filter(|version| !version.is_empty())
}

/// Unpack `entry` from a zip archive into `install_dir` and record `version`.
///
/// The executable is written next to its final location and renamed into
/// place, so a concurrent reader never sees a partial file.
pub fn install_archive(
    archive: &[u8],
    entry: &str,
    install_dir: &Path,
    version: &str,
) -> Result<()> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| Error::Download(format!("Corrupt client archive: {}", e)))?;
    let mut file = zip
        .by_name(entry)
        .map_err(|_| Error::Download(format!("'{}' not found in client archive", entry)))?;

    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| Error::Download(format!("Failed to extract '{}': {}", entry, e)))?;

    let target = install_dir.join(entry);
    let staging = install_dir.join(format!("{entry}{DOWNLOAD_SUFFIX}"));
    std::fs::write(&staging, &contents)?;
    std::fs::rename(&staging, &target)?;
    std::fs::write(install_dir.join(VERSION_FILE), version)?;
    Ok(())
}

#[cfg(unix)]
async fn set_executable_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    debug!("Ensuring permissions on {}", path.display());
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
