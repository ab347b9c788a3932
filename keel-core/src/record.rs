//! Record kinds with an `expires_at` column.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A persisted entity that becomes logically dead once `expires_at < now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Session,
    EmailVerification,
    PasswordReset,
    CsrfToken,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Session,
        RecordKind::EmailVerification,
        RecordKind::PasswordReset,
        RecordKind::CsrfToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Session => "session",
            RecordKind::EmailVerification => "email_verification",
            RecordKind::PasswordReset => "password_reset",
            RecordKind::CsrfToken => "csrf_token",
        }
    }

    /// Backing table. Fixed strings only, never interpolated from input.
    pub fn table_name(&self) -> &'static str {
        match self {
            RecordKind::Session => "sessions",
            RecordKind::EmailVerification => "email_verification_tokens",
            RecordKind::PasswordReset => "password_reset_tokens",
            RecordKind::CsrfToken => "csrf_tokens",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized || kind.table_name() == normalized)
            .ok_or_else(|| format!("unknown record kind: {s}"))
    }
}
