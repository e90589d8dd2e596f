//! Vault client session management.
//!
//! A session wraps the external client for the duration of one sync run:
//! login and unlock produce a session token, exports consume it, and close
//! logs out and discards it. Credentials only ever travel through the
//! environment map of the single invocation that needs them.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bwsync_common::settings::MIN_CUSTOM_KEY_LENGTH;
use bwsync_common::{Error, Result, SensitiveString, VaultCredentials};

use crate::organisation::{
    parse_organisations, sanitize_file_name, OrganisationItem, EXPORT_FILE_SUFFIX,
};
use crate::runner::{CommandRunner, Invocation};

/// File name of the personal vault export.
pub const PERSONAL_EXPORT_FILE: &str = "personal_vault.encrypted.json";

/// Environment variable carrying the API client id.
pub const CLIENT_ID_ENV: &str = "BW_CLIENTID";
/// Environment variable carrying the API client secret.
pub const CLIENT_SECRET_ENV: &str = "BW_CLIENTSECRET";
/// Environment variable carrying the master password.
pub const PASSWORD_ENV: &str = "BW_PASSWORD";

/// How a non-zero exit code is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnFailure {
    /// Return `Error::ExternalCommand`.
    Raise,
    /// Return the stderr text as if the command had succeeded.
    Ignore,
}

/// Session lifecycle.
enum SessionState {
    Closed,
    Unlocked { token: SensitiveString },
}

/// Outcome of exporting one organisation vault.
#[derive(Debug)]
pub struct OrganisationExport {
    pub organisation: OrganisationItem,
    /// Path of the written file, or why the export failed.
    pub result: Result<PathBuf>,
}

/// One subprocess-backed vault client session.
///
/// States: `Closed --unlock--> Unlocked --close--> Closed`.
pub struct VaultSession<R: CommandRunner + ?Sized> {
    runner: Arc<R>,
    credentials: Arc<VaultCredentials>,
    state: SessionState,
}

impl<R: CommandRunner + ?Sized> VaultSession<R> {
    /// Open a session, logging out any stale client session first.
    ///
    /// The initial logout is best-effort: failures are logged and ignored.
    pub async fn open(
        runner: Arc<R>,
        credentials: Arc<VaultCredentials>,
        cancel: &CancellationToken,
    ) -> Self {
        let session = Self {
            runner,
            credentials,
            state: SessionState::Closed,
        };

        match session
            .execute(Invocation::new(["logout"]), cancel, OnFailure::Ignore)
            .await
        {
            Ok(_) => debug!("Cleared any previous client session"),
            Err(e) => warn!("Initial logout failed: {}", e),
        }

        session
    }

    /// Whether the session currently holds a token.
    pub fn is_unlocked(&self) -> bool {
        matches!(self.state, SessionState::Unlocked { .. })
    }

    /// Log in with the API key and unlock the vault.
    ///
    /// # Errors
    /// - `AlreadyUnlocked` when called twice without `close`; the current
    ///   token is left untouched
    /// - `ExternalCommand` when server configuration, login or unlock fails
    /// - `Unlock` when the client output carries no session token
    pub async fn unlock(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.is_unlocked() {
            return Err(Error::AlreadyUnlocked);
        }

        let server = self.credentials.server_url.as_str().to_string();
        debug!("Configuring client server {}", server);
        self.execute(
            Invocation::new(["config", "server"]).arg(server),
            cancel,
            OnFailure::Raise,
        )
        .await?;

        info!("Logging in with API key");
        let login = Invocation::new(["login", "--apikey"])
            .env(CLIENT_ID_ENV, SensitiveString::new(self.credentials.client_id.clone()))
            .env(CLIENT_SECRET_ENV, self.credentials.client_secret.clone());
        self.execute(login, cancel, OnFailure::Raise).await?;

        info!("Unlocking vault");
        let unlock = Invocation::new(["unlock", "--passwordenv", PASSWORD_ENV])
            .env(PASSWORD_ENV, self.credentials.vault_password.clone());
        let output = self.execute(unlock, cancel, OnFailure::Raise).await?;

        let token = parse_session_token(&output)?;
        self.state = SessionState::Unlocked { token };
        info!("Vault unlocked");
        Ok(())
    }

    /// Export the personal vault into `target_dir`.
    ///
    /// A custom key of at least eight characters is passed as the export
    /// password; otherwise the account encryption key is used.
    ///
    /// # Errors
    /// - `NotUnlocked` without a prior successful `unlock`
    /// - `Export` wrapping the client failure
    pub async fn export_personal_vault(
        &self,
        target_dir: &Path,
        encryption_key: Option<&SensitiveString>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let token = self.token()?;
        let password = select_export_password(encryption_key);
        let output = target_dir.join(PERSONAL_EXPORT_FILE);

        info!("Exporting personal vault");
        self.execute(
            export_invocation(token, password, None, &output),
            cancel,
            OnFailure::Raise,
        )
        .await
        .map_err(|e| Error::export("personal vault", e))?;

        Ok(output)
    }

    /// Export every organisation vault into `target_dir`.
    ///
    /// Each organisation is attempted independently; individual failures are
    /// collected in the returned list rather than aborting the rest.
    ///
    /// # Errors
    /// - `NotUnlocked` without a prior successful `unlock`
    /// - Listing organisations failed or returned unreadable output
    pub async fn export_organisations(
        &self,
        target_dir: &Path,
        encryption_key: Option<&SensitiveString>,
        cancel: &CancellationToken,
    ) -> Result<Vec<OrganisationExport>> {
        let token = self.token()?;
        let organisations = self.list_organisations(cancel).await?;
        info!(
            "Found {} organisation{} for export",
            organisations.len(),
            if organisations.len() == 1 { "" } else { "s" }
        );

        let password = select_export_password(encryption_key);
        let mut used_names = HashSet::new();
        let mut exports = Vec::with_capacity(organisations.len());

        for organisation in organisations {
            let mut file_name = organisation.export_file_name();
            if !used_names.insert(file_name.clone()) {
                file_name = format!(
                    "{}_{}{}",
                    sanitize_file_name(organisation.display_name()),
                    sanitize_file_name(&organisation.id),
                    EXPORT_FILE_SUFFIX
                );
                used_names.insert(file_name.clone());
            }
            let output = target_dir.join(file_name);

            info!(
                "Exporting organisation {} ({})",
                organisation.display_name(),
                organisation.id
            );
            let result = self
                .execute(
                    export_invocation(token, password, Some(&organisation.id), &output),
                    cancel,
                    OnFailure::Raise,
                )
                .await
                .map(|_| output)
                .map_err(|e| {
                    Error::export(format!("organisation {}", organisation.display_name()), e)
                });

            if let Err(e) = &result {
                warn!("{}, continuing with remaining organisations", e);
            }
            exports.push(OrganisationExport {
                organisation,
                result,
            });
        }

        Ok(exports)
    }

    /// List the organisations the account belongs to.
    pub async fn list_organisations(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<OrganisationItem>> {
        let token = self.token()?;
        let invocation = Invocation::new(["list", "organizations", "--session"])
            .arg(token.expose());
        let output = self.execute(invocation, cancel, OnFailure::Raise).await?;
        parse_organisations(&output)
    }

    /// Log out and discard the session token.
    ///
    /// Safe to call repeatedly and after a failed unlock. The logout is not
    /// bound to the run's cancellation token so it still happens during
    /// shutdown; a non-zero exit (e.g. already logged out) is ignored.
    pub async fn close(&mut self) -> Result<()> {
        let was_unlocked = self.is_unlocked();
        self.state = SessionState::Closed;

        let cleanup = CancellationToken::new();
        self.execute(Invocation::new(["logout"]), &cleanup, OnFailure::Ignore)
            .await?;
        if was_unlocked {
            info!("Vault session closed");
        }
        Ok(())
    }

    fn token(&self) -> Result<&SensitiveString> {
        match &self.state {
            SessionState::Unlocked { token } => Ok(token),
            SessionState::Closed => Err(Error::NotUnlocked),
        }
    }

    async fn execute(
        &self,
        invocation: Invocation,
        cancel: &CancellationToken,
        on_failure: OnFailure,
    ) -> Result<String> {
        debug!("Running client command: {}", invocation.redacted());
        let output = self.runner.run(&invocation, cancel).await?;

        if output.is_success() {
            return Ok(output.stdout);
        }

        match on_failure {
            OnFailure::Ignore => {
                debug!(
                    "Ignoring failure of '{}': {}",
                    invocation.redacted(),
                    output.stderr
                );
                Ok(output.stderr)
            }
            OnFailure::Raise => Err(Error::ExternalCommand {
                command: invocation.redacted(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            }),
        }
    }
}

impl<R: CommandRunner + ?Sized> Drop for VaultSession<R> {
    fn drop(&mut self) {
        if self.is_unlocked() {
            warn!("Vault session dropped while unlocked; the client may still be logged in");
        }
    }
}

/// Extract the session token from `unlock` output.
///
/// # Errors
/// - `Unlock` when no `BW_SESSION="<token>"` assignment is present
pub fn parse_session_token(output: &str) -> Result<SensitiveString> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r#"BW_SESSION="(?P<token>[^"]+)""#).expect("session token pattern is valid")
    });

    pattern
        .captures(output)
        .and_then(|captures| captures.name("token"))
        .map(|token| SensitiveString::new(token.as_str()))
        .ok_or_else(|| Error::Unlock("no session token in client output".to_string()))
}

/// Choose the export password: the custom key when long enough, otherwise
/// `None` for the account key.
pub fn select_export_password(key: Option<&SensitiveString>) -> Option<&SensitiveString> {
    match key.filter(|key| !key.is_blank()) {
        Some(key) if key.char_count() >= MIN_CUSTOM_KEY_LENGTH => {
            info!("Using custom encryption key for export");
            Some(key)
        }
        Some(_) => {
            warn!("Custom encryption key is too short, using account encryption key for export");
            None
        }
        None => {
            info!("Using account encryption key for export");
            None
        }
    }
}

fn export_invocation(
    token: &SensitiveString,
    password: Option<&SensitiveString>,
    organisation_id: Option<&str>,
    output: &Path,
) -> Invocation {
    let mut invocation = Invocation::new(["export", "--format", "encrypted_json", "--session"])
        .arg(token.expose());
    if let Some(password) = password {
        invocation = invocation.arg("--password").arg(password.expose());
    }
    if let Some(id) = organisation_id {
        invocation = invocation.arg("--organizationid").arg(id);
    }
    invocation
        .arg("--output")
        .arg(output.to_string_lossy().into_owned())
}
