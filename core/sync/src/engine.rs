//! Sync engine: one complete export run.
//!
//! A run opens a vault session, unlocks it, writes the personal and
//! organisation exports into a fresh timestamped directory, always closes
//! the session, then applies retention.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bwsync_client::{CommandRunner, OrganisationExport, VaultSession};
use bwsync_common::{Error, Result, SyncPolicy, VaultCredentials};

use crate::retention::{self, PruneReport};

/// `strftime` pattern naming each run directory.
pub const RUN_DIRECTORY_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Directory name for a run started at `at`.
pub fn run_directory_name(at: DateTime<Utc>) -> String {
    at.format(RUN_DIRECTORY_FORMAT).to_string()
}

/// Whether retention ran after the exports.
#[derive(Debug)]
pub enum PruneStatus {
    /// Not attempted because the personal export did not succeed.
    Skipped,
    Completed(PruneReport),
    Failed(Error),
}

/// Everything that happened during one run.
#[derive(Debug)]
pub struct SyncOutcome {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Directory created for this run, if it still exists.
    pub run_directory: Option<PathBuf>,
    /// `None` when the run stopped before the personal export.
    pub personal: Option<Result<PathBuf>>,
    pub organisations: Vec<OrganisationExport>,
    /// Organisations could not be listed.
    pub organisation_listing: Option<Error>,
    /// Error that stopped the run early (unlock, directory creation, cancel).
    pub failure: Option<Error>,
    /// Logout at the end of the run failed.
    pub close_error: Option<Error>,
    pub pruning: PruneStatus,
}

impl SyncOutcome {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            run_directory: None,
            personal: None,
            organisations: Vec::new(),
            organisation_listing: None,
            failure: None,
            close_error: None,
            pruning: PruneStatus::Skipped,
        }
    }

    /// Whether the personal export succeeded.
    pub fn personal_succeeded(&self) -> bool {
        matches!(self.personal, Some(Ok(_)))
    }

    /// Number of export files written.
    pub fn exports_written(&self) -> usize {
        usize::from(self.personal_succeeded())
            + self
                .organisations
                .iter()
                .filter(|export| export.result.is_ok())
                .count()
    }

    /// Number of exports attempted.
    pub fn exports_attempted(&self) -> usize {
        usize::from(self.personal.is_some()) + self.organisations.len()
    }

    /// Every attempted export succeeded and nothing stopped the run.
    ///
    /// Logout and retention failures are reported but do not fail the run.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
            && self.organisation_listing.is_none()
            && self.personal_succeeded()
            && self.organisations.iter().all(|export| export.result.is_ok())
    }

    fn log_summary(&self) {
        if let Some(e) = &self.failure {
            error!("Sync failed after {:.1?}: {}", self.duration, e);
            return;
        }

        let deleted = match &self.pruning {
            PruneStatus::Completed(report) => report.deleted_count(),
            _ => 0,
        };
        if self.is_success() {
            info!(
                "Sync completed in {:.1?}: {} export(s) written, {} old run(s) removed",
                self.duration,
                self.exports_written(),
                deleted
            );
        } else {
            warn!(
                "Sync finished with errors in {:.1?}: {} of {} export(s) written",
                self.duration,
                self.exports_written(),
                self.exports_attempted()
            );
        }
    }
}

/// Runs exports against a vault client.
pub struct SyncEngine<R: CommandRunner + ?Sized> {
    runner: Arc<R>,
    credentials: Arc<VaultCredentials>,
    policy: Arc<SyncPolicy>,
}

impl<R: CommandRunner + ?Sized> SyncEngine<R> {
    /// Create a new sync engine.
    pub fn new(
        runner: Arc<R>,
        credentials: Arc<VaultCredentials>,
        policy: Arc<SyncPolicy>,
    ) -> Self {
        Self {
            runner,
            credentials,
            policy,
        }
    }

    /// Get the sync policy.
    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Perform one run, naming its directory after `now`.
    ///
    /// Never returns an error: every failure is recorded in the outcome. The
    /// session is logged out on every path once it was opened.
    pub async fn run_once(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> SyncOutcome {
        let started = Instant::now();
        let mut outcome = SyncOutcome::new(now);
        info!("Starting vault sync");

        let mut session =
            VaultSession::open(self.runner.clone(), self.credentials.clone(), cancel).await;

        if let Err(e) = self.export_all(&mut session, now, cancel, &mut outcome).await {
            outcome.failure = Some(e);
        }

        if let Err(e) = session.close().await {
            warn!("Failed to close vault session: {}", e);
            outcome.close_error = Some(e);
        }

        if !outcome.is_success() {
            self.discard_empty_run_directory(&mut outcome).await;
        }

        if outcome.personal_succeeded() {
            outcome.pruning =
                match retention::prune(&self.policy.data_directory, self.policy.retention).await {
                    Ok(report) => PruneStatus::Completed(report),
                    Err(e) => {
                        warn!("Retention failed: {}", e);
                        PruneStatus::Failed(e)
                    }
                };
        } else {
            debug!("Personal export missing, skipping retention");
        }

        outcome.duration = started.elapsed();
        outcome.log_summary();
        outcome
    }

    async fn export_all(
        &self,
        session: &mut VaultSession<R>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        session.unlock(cancel).await?;

        let run_directory = self.policy.data_directory.join(run_directory_name(now));
        tokio::fs::create_dir_all(&run_directory).await?;
        debug!("Writing exports to {}", run_directory.display());
        outcome.run_directory = Some(run_directory.clone());

        let key = self.policy.encryption_key.as_ref();
        let personal = session
            .export_personal_vault(&run_directory, key, cancel)
            .await;
        if let Err(e) = &personal {
            error!("{}", e);
        }
        outcome.personal = Some(personal);
        ensure_not_cancelled(cancel)?;

        if self.policy.include_organisations {
            match session
                .export_organisations(&run_directory, key, cancel)
                .await
            {
                Ok(exports) => outcome.organisations = exports,
                Err(e) => {
                    warn!("Failed to list organisations: {}", e);
                    outcome.organisation_listing = Some(e);
                }
            }
            ensure_not_cancelled(cancel)?;
        }

        Ok(())
    }

    async fn discard_empty_run_directory(&self, outcome: &mut SyncOutcome) {
        let Some(dir) = outcome.run_directory.as_ref() else {
            return;
        };
        let is_empty = match tokio::fs::read_dir(dir).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
            Err(_) => false,
        };
        if is_empty {
            match tokio::fs::remove_dir(dir).await {
                Ok(()) => {
                    debug!("Removed empty run directory {}", dir.display());
                    outcome.run_directory = None;
                }
                Err(e) => warn!("Failed to remove empty run directory {}: {}", dir.display(), e),
            }
        }
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bwsync_client::testing::ScriptedRunner;
    use bwsync_client::{CommandOutput, Invocation};
    use bwsync_common::settings::parse_server_url;
    use bwsync_common::{ScheduleZone, SensitiveString};
    use chrono::TimeZone;
    use std::path::Path;
    use tempfile::TempDir;

    const ORGANISATIONS: &str = r#"[
        {"object":"organization","id":"org-1","name":"Acme","status":2,"type":0,"enabled":true},
        {"object":"organization","id":"org-2","name":"Globex","status":2,"type":0,"enabled":true}
    ]"#;

    fn credentials() -> Arc<VaultCredentials> {
        Arc::new(VaultCredentials {
            client_id: "user.0f4a".to_string(),
            client_secret: SensitiveString::from("client-secret"),
            vault_password: SensitiveString::from("hunter22"),
            server_url: parse_server_url(None),
        })
    }

    fn policy(
        data_directory: &Path,
        include_organisations: bool,
        retention: Option<usize>,
    ) -> Arc<SyncPolicy> {
        Arc::new(SyncPolicy {
            cron_schedule: "0 0 * * *".to_string(),
            schedule_zone: ScheduleZone::Utc,
            run_on_startup: false,
            include_organisations,
            encryption_key: None,
            retention,
            data_directory: data_directory.to_path_buf(),
        })
    }

    fn output_path(invocation: &Invocation) -> Option<PathBuf> {
        let args = invocation.args();
        args.iter()
            .position(|arg| arg == "--output")
            .and_then(|idx| args.get(idx + 1))
            .map(PathBuf::from)
    }

    /// Behaves like a healthy client; `fail` names subcommands that exit 1.
    fn client(fail: &'static [&'static str]) -> ScriptedRunner {
        ScriptedRunner::new(move |invocation| {
            let subcommand = invocation.subcommand();
            if fail.contains(&subcommand) {
                return CommandOutput::failure(1, format!("{subcommand} failed"));
            }
            match subcommand {
                "unlock" => CommandOutput::success("$ export BW_SESSION=\"session-token\"\n"),
                "list" => CommandOutput::success(ORGANISATIONS),
                "export" => {
                    if let Some(path) = output_path(invocation) {
                        std::fs::write(path, b"{\"encrypted\":true}").unwrap();
                    }
                    CommandOutput::success("Saved")
                }
                _ => CommandOutput::success(""),
            }
        })
    }

    fn started_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_run_directory_name() {
        assert_eq!(run_directory_name(started_at()), "2024-06-01T12-00-00");
    }

    #[tokio::test]
    async fn test_successful_run() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(client(&[]));
        let engine = SyncEngine::new(
            runner.clone(),
            credentials(),
            policy(temp.path(), true, None),
        );

        let outcome = engine.run_once(started_at(), &CancellationToken::new()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.exports_written(), 3);
        let run_dir = temp.path().join("2024-06-01T12-00-00");
        assert_eq!(outcome.run_directory.as_deref(), Some(run_dir.as_path()));
        assert!(run_dir.join("personal_vault.encrypted.json").exists());
        assert!(run_dir.join("Acme.encrypted.json").exists());
        assert!(run_dir.join("Globex.encrypted.json").exists());
        assert_eq!(
            runner.subcommands(),
            ["logout", "config", "login", "unlock", "export", "list", "export", "export", "logout"]
        );
        assert!(matches!(outcome.pruning, PruneStatus::Completed(ref r) if r.deleted_count() == 0));
    }

    #[tokio::test]
    async fn test_organisations_skipped_when_disabled() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(client(&[]));
        let engine = SyncEngine::new(
            runner.clone(),
            credentials(),
            policy(temp.path(), false, None),
        );

        let outcome = engine.run_once(started_at(), &CancellationToken::new()).await;

        assert!(outcome.is_success());
        assert!(outcome.organisations.is_empty());
        assert!(!runner.subcommands().contains(&"list".to_string()));
    }

    #[tokio::test]
    async fn test_unlock_failure_aborts_and_logs_out() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(client(&["login"]));
        let engine = SyncEngine::new(
            runner.clone(),
            credentials(),
            policy(temp.path(), true, Some(1)),
        );

        let outcome = engine.run_once(started_at(), &CancellationToken::new()).await;

        assert!(!outcome.is_success());
        assert!(matches!(outcome.failure, Some(Error::ExternalCommand { .. })));
        assert!(outcome.personal.is_none());
        assert!(matches!(outcome.pruning, PruneStatus::Skipped));
        assert_eq!(runner.subcommands(), ["logout", "config", "login", "logout"]);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_personal_failure_skips_retention() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("2024-01-01T00-00-00")).unwrap();
        std::fs::create_dir(temp.path().join("2024-01-02T00-00-00")).unwrap();
        let runner = Arc::new(ScriptedRunner::new(|invocation| match invocation.subcommand() {
            "unlock" => CommandOutput::success("BW_SESSION=\"session-token\""),
            "export" => CommandOutput::failure(1, "Invalid master password."),
            _ => CommandOutput::success(""),
        }));
        let engine = SyncEngine::new(
            runner.clone(),
            credentials(),
            policy(temp.path(), false, Some(1)),
        );

        let outcome = engine.run_once(started_at(), &CancellationToken::new()).await;

        assert!(!outcome.is_success());
        assert!(outcome.failure.is_none());
        assert!(matches!(outcome.personal, Some(Err(Error::Export { .. }))));
        assert!(matches!(outcome.pruning, PruneStatus::Skipped));
        // Empty run directory is discarded, older runs stay.
        assert!(outcome.run_directory.is_none());
        assert!(!temp.path().join("2024-06-01T12-00-00").exists());
        assert!(temp.path().join("2024-01-01T00-00-00").exists());
        assert!(temp.path().join("2024-01-02T00-00-00").exists());
        assert_eq!(runner.subcommands().last().map(String::as_str), Some("logout"));
    }

    #[tokio::test]
    async fn test_organisation_failure_is_isolated() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|invocation| {
            let args = invocation.args();
            match invocation.subcommand() {
                "unlock" => CommandOutput::success("BW_SESSION=\"session-token\""),
                "list" => CommandOutput::success(ORGANISATIONS),
                "export" if args.iter().any(|arg| arg == "org-1") => {
                    CommandOutput::failure(1, "Not authorized")
                }
                "export" => {
                    if let Some(path) = output_path(invocation) {
                        std::fs::write(path, b"{}").unwrap();
                    }
                    CommandOutput::success("")
                }
                _ => CommandOutput::success(""),
            }
        }));
        let engine = SyncEngine::new(runner, credentials(), policy(temp.path(), true, None));

        let outcome = engine.run_once(started_at(), &CancellationToken::new()).await;

        assert!(!outcome.is_success());
        assert!(outcome.personal_succeeded());
        assert_eq!(outcome.organisations.len(), 2);
        assert!(outcome.organisations[0].result.is_err());
        assert!(outcome.organisations[1].result.is_ok());
        assert_eq!(outcome.exports_written(), 2);
        assert!(matches!(outcome.pruning, PruneStatus::Completed(_)));
        assert!(outcome.run_directory.is_some());
    }

    #[tokio::test]
    async fn test_listing_failure_still_prunes() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("2024-01-01T00-00-00")).unwrap();
        let runner = Arc::new(client(&["list"]));
        let engine = SyncEngine::new(runner, credentials(), policy(temp.path(), true, Some(1)));

        let outcome = engine.run_once(started_at(), &CancellationToken::new()).await;

        assert!(!outcome.is_success());
        assert!(outcome.organisation_listing.is_some());
        assert!(matches!(outcome.pruning, PruneStatus::Completed(ref r) if r.deleted_count() == 1));
        assert!(!temp.path().join("2024-01-01T00-00-00").exists());
        assert!(temp.path().join("2024-06-01T12-00-00").exists());
    }

    #[tokio::test]
    async fn test_retention_after_success() {
        let temp = TempDir::new().unwrap();
        for name in ["2024-01-01T00-00-00", "2024-01-02T00-00-00", "2024-01-03T00-00-00"] {
            std::fs::create_dir(temp.path().join(name)).unwrap();
        }
        let engine = SyncEngine::new(
            Arc::new(client(&[])),
            credentials(),
            policy(temp.path(), false, Some(2)),
        );

        let outcome = engine.run_once(started_at(), &CancellationToken::new()).await;

        assert!(outcome.is_success());
        let PruneStatus::Completed(report) = &outcome.pruning else {
            panic!("retention did not run");
        };
        assert_eq!(report.deleted_count(), 2);
        assert!(temp.path().join("2024-06-01T12-00-00").exists());
        assert!(temp.path().join("2024-01-03T00-00-00").exists());
        assert!(!temp.path().join("2024-01-02T00-00-00").exists());
        assert!(!temp.path().join("2024-01-01T00-00-00").exists());
    }

    #[tokio::test]
    async fn test_cancelled_run_still_logs_out() {
        let temp = TempDir::new().unwrap();
        let runner = Arc::new(client(&[]));
        let engine = SyncEngine::new(
            runner.clone(),
            credentials(),
            policy(temp.path(), true, None),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = engine.run_once(started_at(), &cancel).await;

        assert!(outcome.failure.as_ref().is_some_and(Error::is_cancelled));
        assert!(outcome.close_error.is_none());
        assert_eq!(runner.subcommands().last().map(String::as_str), Some("logout"));
        assert!(!runner.subcommands().contains(&"export".to_string()));
    }
}
