//! bwsync vault client integration.
//!
//! This module drives the external vault client executable:
//! - Subprocess invocation with per-command environment, timeout and cancellation
//! - Session state machine for login, unlock, export and logout
//! - Organisation listing and export file naming
//! - Provisioning of the pinned client release
//! - Download retry with jittered exponential backoff

pub mod organisation;
pub mod provision;
pub mod retry;
pub mod runner;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use organisation::{parse_organisations, sanitize_file_name, OrganisationItem};
pub use provision::{ClientProvisioner, Platform, CLIENT_VERSION};
pub use retry::{is_transient, RetryPolicy};
pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner};
pub use session::{
    parse_session_token, select_export_password, OrganisationExport, VaultSession,
    PERSONAL_EXPORT_FILE,
};
