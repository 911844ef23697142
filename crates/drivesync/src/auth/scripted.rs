//! Scripted credential provider
//!
//! Issues tokens locally for a fixed account. Failures can be scripted per
//! operation and calls are counted, so the credential manager can be driven
//! without an identity provider.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use super::{AuthAccount, AuthError, AuthToken, CredentialProvider};
use crate::runtime::lock;

#[derive(Default)]
struct Counts {
    initialize: usize,
    login: usize,
    silent: usize,
    forced: usize,
}

struct Script {
    account: AuthAccount,
    token_lifetime: Duration,
    signed_in: bool,
    issued: u64,
    init_error: Option<AuthError>,
    login_error: Option<AuthError>,
    /// Error for silent acquisition, with the number of calls left to fail
    silent_error: Option<(AuthError, Option<usize>)>,
    pending_redirect: bool,
    counts: Counts,
}

/// Credential provider with scripted behavior
pub struct ScriptedProvider {
    script: Mutex<Script>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                account: AuthAccount {
                    id: "acc-1".to_string(),
                    username: "user@example.com".to_string(),
                },
                token_lifetime: Duration::from_secs(3600),
                signed_in: false,
                issued: 0,
                init_error: None,
                login_error: None,
                silent_error: None,
                pending_redirect: false,
                counts: Counts::default(),
            }),
            latency: None,
        }
    }

    /// Delay `initialize` and silent acquisition
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_token_lifetime(self, lifetime: Duration) -> Self {
        self.set_token_lifetime(lifetime);
        self
    }

    /// Start with the account already signed in, as after a restart
    pub fn with_signed_in_account(self) -> Self {
        lock(&self.script).signed_in = true;
        self
    }

    pub fn set_token_lifetime(&self, lifetime: Duration) {
        lock(&self.script).token_lifetime = lifetime;
    }

    /// Complete a sign-in on the next `handle_redirect_completion`
    pub fn set_pending_redirect(&self) {
        lock(&self.script).pending_redirect = true;
    }

    pub fn fail_initialize(&self, error: AuthError) {
        lock(&self.script).init_error = Some(error);
    }

    pub fn fail_login(&self, error: AuthError) {
        lock(&self.script).login_error = Some(error);
    }

    /// Fail every silent acquisition
    pub fn fail_silent(&self, error: AuthError) {
        lock(&self.script).silent_error = Some((error, None));
    }

    /// Fail the next `times` silent acquisitions
    pub fn fail_silent_times(&self, times: usize, error: AuthError) {
        lock(&self.script).silent_error = Some((error, Some(times)));
    }

    /// Clear every scripted failure
    pub fn recover(&self) {
        let mut script = lock(&self.script);
        script.init_error = None;
        script.login_error = None;
        script.silent_error = None;
    }

    pub fn initialize_calls(&self) -> usize {
        lock(&self.script).counts.initialize
    }

    pub fn login_calls(&self) -> usize {
        lock(&self.script).counts.login
    }

    pub fn silent_calls(&self) -> usize {
        lock(&self.script).counts.silent
    }

    /// Silent calls that asked for a forced refresh
    pub fn forced_refreshes(&self) -> usize {
        lock(&self.script).counts.forced
    }

    pub fn reset_counts(&self) {
        lock(&self.script).counts = Counts::default();
    }

    fn issue(script: &mut Script) -> AuthToken {
        script.issued += 1;
        let lifetime = chrono::Duration::from_std(script.token_lifetime)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        AuthToken {
            account: script.account.clone(),
            access_token: format!("token-{}", script.issued),
            expires_at: Utc::now() + lifetime,
        }
    }

    fn pause(&self) {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for ScriptedProvider {
    fn initialize(&self) -> Result<(), AuthError> {
        lock(&self.script).counts.initialize += 1;
        self.pause();
        match lock(&self.script).init_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn login_interactive(&self) -> Result<AuthToken, AuthError> {
        let mut script = lock(&self.script);
        script.counts.login += 1;
        if let Some(error) = script.login_error.clone() {
            return Err(error);
        }
        script.signed_in = true;
        Ok(Self::issue(&mut script))
    }

    fn acquire_token_silent(
        &self,
        account: &AuthAccount,
        force_refresh: bool,
    ) -> Result<AuthToken, AuthError> {
        {
            let mut script = lock(&self.script);
            script.counts.silent += 1;
            if force_refresh {
                script.counts.forced += 1;
            }
        }
        self.pause();

        let mut script = lock(&self.script);
        if let Some((error, remaining)) = script.silent_error.clone() {
            script.silent_error = match remaining {
                Some(n) if n > 1 => Some((error.clone(), Some(n - 1))),
                Some(_) => None,
                None => Some((error.clone(), None)),
            };
            if remaining != Some(0) {
                return Err(error);
            }
        }

        if !script.signed_in || account.id != script.account.id {
            return Err(AuthError::NoAccount);
        }
        Ok(Self::issue(&mut script))
    }

    fn handle_redirect_completion(&self) -> Result<Option<AuthToken>, AuthError> {
        let mut script = lock(&self.script);
        if !script.pending_redirect {
            return Ok(None);
        }
        script.pending_redirect = false;
        script.signed_in = true;
        Ok(Some(Self::issue(&mut script)))
    }

    fn logout(&self, _account: Option<&AuthAccount>) -> Result<(), AuthError> {
        lock(&self.script).signed_in = false;
        Ok(())
    }

    fn accounts(&self) -> Vec<AuthAccount> {
        let script = lock(&self.script);
        if script.signed_in {
            vec![script.account.clone()]
        } else {
            Vec::new()
        }
    }
}
