//! Authenticated session model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An access token plus the account it belongs to and its validity window
///
/// Owned by the credential manager; discarded wholesale on logout or expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Identity provider account identifier
    pub account_id: String,
    /// Sign-in name of the account
    pub username: String,
    /// Bearer token for the drive API
    pub access_token: String,
    /// When the token was issued (or acquired)
    pub issued_at: DateTime<Utc>,
    /// When the token stops being accepted
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Time left before the token expires (negative once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Whether the token has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether less than `margin` is left on the token at `now`
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.remaining(now) < margin
    }

    /// Public account details for display
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            account_id: self.account_id.clone(),
            username: self.username.clone(),
        }
    }
}

/// Account details shown to callers (never carries the token)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub account_id: String,
    pub username: String,
}
