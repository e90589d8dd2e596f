//! Common utilities and types shared across bwsync modules.
//!
//! This module provides the error taxonomy, secret-handling types and the
//! validated service settings consumed by the client and sync crates.

pub mod error;
pub mod settings;
pub mod types;

pub use error::{Error, Result};
pub use settings::{
    ClientSettings, RawSettings, ScheduleZone, Settings, SyncPolicy, VaultCredentials,
};
pub use types::SensitiveString;
