//! Organisation listing model and export file naming.

use serde::{Deserialize, Serialize};

use bwsync_common::Result;

/// Suffix shared by every export file.
pub const EXPORT_FILE_SUFFIX: &str = ".encrypted.json";

/// One entry of `list organizations` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationItem {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl OrganisationItem {
    /// Name used in logs: the organisation name, or its id when unnamed.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => &self.id,
        }
    }

    /// Export file name derived from the organisation name.
    pub fn export_file_name(&self) -> String {
        format!("{}{}", sanitize_file_name(self.display_name()), EXPORT_FILE_SUFFIX)
    }
}

/// Parse the JSON array printed by `list organizations`.
pub fn parse_organisations(output: &str) -> Result<Vec<OrganisationItem>> {
    Ok(serde_json::from_str(output.trim())?)
}

/// Replace characters that are invalid in file names with `_`.
///
/// The rule is the same on every platform, so exports copied between
/// systems keep their names.
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match sanitized.as_str() {
        "" | "." | ".." => "_".repeat(sanitized.len().max(1)),
        _ => sanitized,
    }
}
