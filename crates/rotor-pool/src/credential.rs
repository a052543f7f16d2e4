//! Credential model.

use serde::{Deserialize, Serialize};

/// Which upstream product family issued the credential. They share the
/// OAuth client but present different user agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    #[default]
    GeminiCli,
    Antigravity,
}

impl Family {
    pub fn user_agent(self) -> &'static str {
        match self {
            Family::GeminiCli => "GeminiCLI/0.1.5 (Windows; AMD64)",
            Family::Antigravity => "Antigravity/1.0 (Windows; AMD64)",
        }
    }
}

/// The persisted shape: one JSON document per credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Access-token expiry, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub family: Family,
    #[serde(default)]
    pub banned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banned_at: Option<i64>,
}

impl CredentialRecord {
    pub fn new(refresh_token: impl Into<String>, family: Family) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            access_token: None,
            expiry: None,
            project_id: None,
            family,
            banned: false,
            ban_reason: None,
            banned_at: None,
        }
    }
}

/// In-memory state for one pool entry.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Opaque identifier, usually the source filename stem.
    pub name: String,
    pub record: CredentialRecord,
    pub consecutive_errors: u32,
    pub calls_since_rotation: u32,
    pub last_used: Option<i64>,
}

/// Refresh this long before the recorded expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

impl Credential {
    pub fn new(name: impl Into<String>, record: CredentialRecord) -> Self {
        Self {
            name: name.into(),
            record,
            consecutive_errors: 0,
            calls_since_rotation: 0,
            last_used: None,
        }
    }

    pub fn token_valid(&self, now: i64) -> bool {
        self.record.access_token.is_some()
            && self
                .record
                .expiry
                .map(|expiry| now + EXPIRY_MARGIN_SECS < expiry)
                .unwrap_or(false)
    }

    pub fn ban(&mut self, reason: impl Into<String>, now: i64) {
        self.record.banned = true;
        self.record.ban_reason = Some(reason.into());
        self.record.banned_at = Some(now);
    }

    pub fn unban(&mut self) {
        self.record.banned = false;
        self.record.ban_reason = None;
        self.record.banned_at = None;
        self.consecutive_errors = 0;
    }
}
