//! Authentication
//!
//! This module provides:
//! - The `CredentialProvider` trait over the identity provider
//! - An OAuth2 authorization-code + PKCE provider for Microsoft accounts
//! - The `CredentialManager`, which owns the session lifecycle
//! - A scripted provider for tests

mod manager;
mod oauth;
mod scripted;

pub use manager::{CredentialManager, DEFAULT_MAX_RETRIES};
pub use oauth::OAuthProvider;
pub use scripted::ScriptedProvider;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors from the identity provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The provider cannot run in this environment
    #[error("Authentication unavailable: {0}")]
    Unavailable(String),

    /// The identity provider could not be reached
    #[error("Network error during authentication: {0}")]
    Network(String),

    /// No account is signed in
    #[error("No signed-in account")]
    NoAccount,

    /// The interactive sign-in did not complete
    #[error("Sign-in failed: {0}")]
    Interaction(String),

    /// A token could not be issued or refreshed
    #[error("Token acquisition failed: {0}")]
    Token(String),
}

/// Account known to the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAccount {
    pub id: String,
    pub username: String,
}

/// Access token issued for an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub account: AuthAccount,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Operations consumed from the identity provider
///
/// Implementations own their token cache; the credential manager only keeps
/// the session derived from the last token it was handed.
pub trait CredentialProvider: Send + Sync {
    /// Prepare the provider (load caches, check the environment)
    fn initialize(&self) -> Result<(), AuthError>;

    /// Run the interactive sign-in
    fn login_interactive(&self) -> Result<AuthToken, AuthError>;

    /// Get a token without user interaction
    ///
    /// With `force_refresh` the cached access token is ignored and a new one
    /// is requested.
    fn acquire_token_silent(
        &self,
        account: &AuthAccount,
        force_refresh: bool,
    ) -> Result<AuthToken, AuthError>;

    /// Complete a sign-in that finished outside `login_interactive`
    fn handle_redirect_completion(&self) -> Result<Option<AuthToken>, AuthError>;

    /// Sign out and drop cached tokens
    fn logout(&self, account: Option<&AuthAccount>) -> Result<(), AuthError>;

    /// Accounts with cached credentials
    fn accounts(&self) -> Vec<AuthAccount>;
}
