//! Credential session lifecycle
//!
//! The manager owns the single authenticated session. It restores a prior
//! session at startup, renews the token silently before it expires and
//! persists the session so a restart within its TTL stays signed in.
//!
//! Concurrent callers of `initialize` and `acquire_token_silently` share one
//! in-flight execution.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};

use super::{AuthAccount, AuthError, AuthToken, CredentialProvider};
use crate::config::EngineConfig;
use crate::drive::{DriveError, TokenSource};
use crate::models::Session;
use crate::runtime::{BackgroundTask, Coalescer, RetryPolicy, lock};
use crate::storage::SessionStore;

/// Default number of silent acquisition attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Floor for the renewal delay of short-lived tokens
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(30);

/// Outcome of initialization
#[derive(Debug, Clone, PartialEq, Eq)]
enum InitState {
    Pending,
    Ready,
    Unavailable(String),
}

struct Inner {
    provider: Arc<dyn CredentialProvider>,
    store: SessionStore,
    token_retry: RetryPolicy,
    renewal_margin: Duration,
    session_ttl: chrono::Duration,
    init: Mutex<InitState>,
    account: Mutex<Option<AuthAccount>>,
    session: Mutex<Option<Session>>,
    renewal: Mutex<Option<BackgroundTask>>,
    init_flight: Coalescer<(), Result<(), AuthError>>,
    acquire_flight: Coalescer<(), Option<Session>>,
}

/// Owns the authenticated session
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl CredentialManager {
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        store: SessionStore,
        config: &EngineConfig,
    ) -> Self {
        let session_ttl = chrono::Duration::from_std(config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                token_retry: config.token_retry.clone(),
                renewal_margin: config.renewal_margin,
                session_ttl,
                init: Mutex::new(InitState::Pending),
                account: Mutex::new(None),
                session: Mutex::new(None),
                renewal: Mutex::new(None),
                init_flight: Coalescer::new(),
                acquire_flight: Coalescer::new(),
            }),
        }
    }

    // === Initialization ===

    /// Prepare the provider and restore a prior session
    ///
    /// Idempotent once it has succeeded. A provider that cannot run in this
    /// environment leaves the manager unavailable instead of failing hard;
    /// later calls retry.
    pub fn initialize(&self) -> Result<(), AuthError> {
        if *lock(&self.inner.init) == InitState::Ready {
            return Ok(());
        }
        self.inner.init_flight.run((), || {
            if *lock(&self.inner.init) == InitState::Ready {
                return Ok(());
            }
            self.run_initialize()
        })
    }

    fn run_initialize(&self) -> Result<(), AuthError> {
        if let Err(e) = self.inner.provider.initialize() {
            error!("[AUTH] Credential provider failed to initialize: {}", e);
            let message = match &e {
                AuthError::Unavailable(msg) => msg.clone(),
                other => other.to_string(),
            };
            *lock(&self.inner.init) = InitState::Unavailable(message.clone());
            return Err(AuthError::Unavailable(message));
        }

        // A sign-in completed outside this process takes priority.
        match self.inner.provider.handle_redirect_completion() {
            Ok(Some(token)) => {
                info!("[AUTH] Completed pending sign-in for {}", token.account.username);
                self.adopt(token);
                *lock(&self.inner.init) = InitState::Ready;
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => warn!("[AUTH] Pending sign-in could not be completed: {}", e),
        }

        *lock(&self.inner.init) = InitState::Ready;

        if let Some(account) = self.restore_account() {
            debug!("[AUTH] Restoring session for {}", account.username);
            *lock(&self.inner.account) = Some(account);
            if self.acquire_coalesced(DEFAULT_MAX_RETRIES).is_none() {
                info!("[AUTH] Prior session could not be restored silently");
            }
        }

        Ok(())
    }

    /// Pick the account to restore: the persisted session's account if the
    /// provider still knows it, otherwise the provider's first account
    fn restore_account(&self) -> Option<AuthAccount> {
        let accounts = self.inner.provider.accounts();
        let persisted = match self.inner.store.load_credentials() {
            Ok(session) => session,
            Err(e) => {
                warn!("[AUTH] Failed to read persisted session: {:#}", e);
                None
            }
        };

        if let Some(session) = persisted
            && let Some(account) = accounts.iter().find(|a| a.id == session.account_id)
        {
            return Some(account.clone());
        }
        accounts.into_iter().next()
    }

    /// Whether the credential layer can run in this environment
    pub fn is_available(&self) -> bool {
        !matches!(*lock(&self.inner.init), InitState::Unavailable(_))
    }

    // === Token acquisition ===

    /// Acquire a token without user interaction
    ///
    /// Returns `None` immediately when no account is signed in. The first
    /// attempt accepts a cached token, later ones force a refresh. On success
    /// the session is persisted and a renewal is scheduled ahead of expiry; if
    /// every attempt fails the session and any scheduled renewal are cleared.
    pub fn acquire_token_silently(&self, max_retries: u32) -> Option<Session> {
        if let Err(e) = self.initialize() {
            debug!("[AUTH] Silent acquisition skipped: {}", e);
            return None;
        }
        self.acquire_coalesced(max_retries)
    }

    fn acquire_coalesced(&self, max_retries: u32) -> Option<Session> {
        self.inner
            .acquire_flight
            .run((), || self.run_acquire(max_retries))
    }

    fn run_acquire(&self, max_retries: u32) -> Option<Session> {
        let account = lock(&self.inner.account).clone()?;

        let policy = self.inner.token_retry.clone().with_max_attempts(max_retries);
        let result = policy.run(|attempt| {
            let force_refresh = attempt > 0;
            self.inner
                .provider
                .acquire_token_silent(&account, force_refresh)
                .inspect_err(|e| {
                    warn!(
                        "[AUTH] Silent token attempt {}/{} failed: {}",
                        attempt + 1,
                        max_retries.max(1),
                        e
                    )
                })
        });

        match result {
            Ok(token) => Some(self.adopt(token)),
            Err(e) => {
                error!("[AUTH] Silent token acquisition failed: {}", e);
                self.clear_session();
                None
            }
        }
    }

    /// Install a freshly issued token as the current session
    fn adopt(&self, token: AuthToken) -> Session {
        let session = Session {
            account_id: token.account.id.clone(),
            username: token.account.username.clone(),
            access_token: token.access_token,
            issued_at: Utc::now(),
            expires_at: token.expires_at,
        };

        if let Err(e) = self.inner.store.save_credentials(&session) {
            warn!("[AUTH] Failed to persist session: {:#}", e);
        }

        *lock(&self.inner.account) = Some(token.account);
        *lock(&self.inner.session) = Some(session.clone());
        self.schedule_renewal(&session);
        session
    }

    /// Renew silently `renewal_margin` before the token expires
    fn schedule_renewal(&self, session: &Session) {
        let margin = chrono::Duration::from_std(self.inner.renewal_margin)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let delay = (session.expires_at - margin - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(MIN_RENEWAL_DELAY);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = BackgroundTask::after("token-renewal", delay, move || {
            if let Some(inner) = weak.upgrade() {
                debug!("[AUTH] Renewing access token");
                let manager = CredentialManager { inner };
                if manager.acquire_coalesced(DEFAULT_MAX_RETRIES).is_none() {
                    warn!("[AUTH] Scheduled token renewal failed");
                }
            }
        });

        debug!("[AUTH] Token renewal scheduled in {}s", delay.as_secs());
        // Replacing the handle cancels any earlier renewal.
        *lock(&self.inner.renewal) = Some(task);
    }

    fn cancel_renewal(&self) {
        if let Some(mut task) = lock(&self.inner.renewal).take() {
            task.cancel();
        }
    }

    fn clear_session(&self) {
        self.cancel_renewal();
        *lock(&self.inner.session) = None;
        if let Err(e) = self.inner.store.clear_credentials() {
            warn!("[AUTH] Failed to remove persisted session: {:#}", e);
        }
    }

    /// Whether a renewal is currently scheduled
    pub fn renewal_scheduled(&self) -> bool {
        lock(&self.inner.renewal)
            .as_ref()
            .is_some_and(|task| !task.is_cancelled() && !task.is_finished())
    }

    // === Interactive flows ===

    /// Sign in interactively and establish a session
    pub fn login(&self) -> Result<Session, AuthError> {
        self.initialize()?;
        let token = self.inner.provider.login_interactive()?;
        info!("[AUTH] Signed in as {}", token.account.username);
        Ok(self.adopt(token))
    }

    /// Sign out and drop the session
    ///
    /// Local state is cleared even when the provider's sign-out fails.
    pub fn logout(&self) -> Result<(), AuthError> {
        let account = lock(&self.inner.account).take();
        self.clear_session();

        let result = self.inner.provider.logout(account.as_ref());
        if let Err(e) = &result {
            warn!("[AUTH] Provider sign-out failed: {}", e);
        }
        info!("[AUTH] Signed out");
        result
    }

    // === Session inspection ===

    /// True when the token expires within the renewal margin or cannot be
    /// acquired at all
    pub fn is_token_expiring_soon(&self) -> bool {
        let margin = chrono::Duration::from_std(self.inner.renewal_margin)
            .unwrap_or_else(|_| chrono::Duration::zero());
        match self.acquire_token_silently(1) {
            Some(session) => session.expires_within(margin, Utc::now()),
            None => true,
        }
    }

    /// The current session, if any, regardless of validity
    pub fn current_session(&self) -> Option<Session> {
        lock(&self.inner.session).clone()
    }

    /// The current session if it is within its TTL and not expired
    pub fn valid_session(&self) -> Option<Session> {
        let now = Utc::now();
        lock(&self.inner.session)
            .clone()
            .filter(|s| now - s.issued_at < self.inner.session_ttl && !s.is_expired_at(now))
    }

    /// The signed-in account, if any
    pub fn account(&self) -> Option<AuthAccount> {
        lock(&self.inner.account).clone()
    }

    /// Stop background renewal
    pub fn shutdown(&self) {
        self.cancel_renewal();
    }
}

impl TokenSource for CredentialManager {
    fn bearer_token(&self) -> Result<String, DriveError> {
        let margin = chrono::Duration::from_std(self.inner.renewal_margin)
            .unwrap_or_else(|_| chrono::Duration::zero());

        if let Some(session) = self.valid_session()
            && !session.expires_within(margin, Utc::now())
        {
            return Ok(session.access_token);
        }

        self.acquire_token_silently(DEFAULT_MAX_RETRIES)
            .map(|session| session.access_token)
            .ok_or_else(|| DriveError::Unauthorized("No valid session; sign in again".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ScriptedProvider;
    use crate::storage::{InMemoryKeyValueStore, KeyValueStore, keys};

    fn make_manager(provider: Arc<ScriptedProvider>) -> (CredentialManager, Arc<InMemoryKeyValueStore>) {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let config = EngineConfig::default().with_token_retry(RetryPolicy::immediate(3));
        let store = SessionStore::new(kv.clone(), config.session_ttl);
        (CredentialManager::new(provider, store, &config), kv)
    }

    #[test]
    fn test_silent_without_account_returns_none() {
        let provider = Arc::new(ScriptedProvider::new());
        let (manager, _kv) = make_manager(provider.clone());

        assert!(manager.acquire_token_silently(3).is_none());
        assert_eq!(provider.silent_calls(), 0);
    }

    #[test]
    fn test_login_persists_session_and_schedules_renewal() {
        let provider = Arc::new(ScriptedProvider::new());
        let (manager, kv) = make_manager(provider.clone());

        let session = manager.login().unwrap();
        assert_eq!(session.username, "user@example.com");
        assert!(kv.get(keys::CREDENTIAL_SESSION).unwrap().is_some());
        assert!(manager.renewal_scheduled());
        assert_eq!(manager.valid_session(), Some(session));
    }

    #[test]
    fn test_all_attempts_failing_clears_session_and_renewal() {
        let provider = Arc::new(ScriptedProvider::new());
        let (manager, kv) = make_manager(provider.clone());
        manager.login().unwrap();
        assert!(manager.renewal_scheduled());

        provider.fail_silent(AuthError::Token("interaction_required".to_string()));
        provider.reset_counts();

        assert!(manager.acquire_token_silently(3).is_none());
        assert_eq!(provider.silent_calls(), 3);
        assert_eq!(provider.forced_refreshes(), 2);
        assert!(!manager.renewal_scheduled());
        assert!(manager.current_session().is_none());
        assert!(kv.get(keys::CREDENTIAL_SESSION).unwrap().is_none());
    }

    #[test]
    fn test_retry_succeeds_with_forced_refresh() {
        let provider = Arc::new(ScriptedProvider::new());
        let (manager, _kv) = make_manager(provider.clone());
        manager.login().unwrap();

        provider.fail_silent_times(1, AuthError::Network("offline".to_string()));
        provider.reset_counts();

        assert!(manager.acquire_token_silently(3).is_some());
        assert_eq!(provider.silent_calls(), 2);
        assert_eq!(provider.forced_refreshes(), 1);
    }

    #[test]
    fn test_concurrent_acquisitions_share_one_attempt() {
        let provider = Arc::new(ScriptedProvider::new().with_latency(Duration::from_millis(100)));
        let (manager, _kv) = make_manager(provider.clone());
        manager.login().unwrap();
        provider.reset_counts();

        let barrier = std::sync::Barrier::new(6);
        let sessions: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        manager.acquire_token_silently(3)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(sessions.iter().all(Option::is_some));
        assert_eq!(provider.silent_calls(), 1);
    }

    #[test]
    fn test_initialize_restores_prior_session() {
        let provider = Arc::new(ScriptedProvider::new());
        let (manager, kv) = make_manager(provider.clone());
        manager.login().unwrap();

        // A new process sharing the same persisted state and provider cache
        let config = EngineConfig::default().with_token_retry(RetryPolicy::immediate(3));
        let restarted = CredentialManager::new(
            provider.clone(),
            SessionStore::new(kv.clone(), config.session_ttl),
            &config,
        );
        restarted.initialize().unwrap();
        assert_eq!(restarted.account().map(|a| a.id), Some("acc-1".to_string()));
        assert!(restarted.valid_session().is_some());
    }

    #[test]
    fn test_initialize_is_coalesced_and_idempotent() {
        let provider = Arc::new(ScriptedProvider::new().with_latency(Duration::from_millis(50)));
        let (manager, _kv) = make_manager(provider.clone());

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| manager.initialize().unwrap());
            }
        });
        manager.initialize().unwrap();
        assert_eq!(provider.initialize_calls(), 1);
    }

    #[test]
    fn test_unavailable_provider_degrades() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_initialize(AuthError::Unavailable("no secure random source".to_string()));
        let (manager, _kv) = make_manager(provider);

        assert!(matches!(manager.initialize(), Err(AuthError::Unavailable(_))));
        assert!(!manager.is_available());
        assert!(manager.acquire_token_silently(3).is_none());
        assert!(manager.is_token_expiring_soon());
    }

    #[test]
    fn test_logout_clears_everything() {
        let provider = Arc::new(ScriptedProvider::new());
        let (manager, kv) = make_manager(provider.clone());
        manager.login().unwrap();

        manager.logout().unwrap();
        assert!(manager.current_session().is_none());
        assert!(manager.account().is_none());
        assert!(!manager.renewal_scheduled());
        assert!(kv.get(keys::CREDENTIAL_SESSION).unwrap().is_none());
        assert!(provider.accounts().is_empty());
    }

    #[test]
    fn test_expiring_soon() {
        let provider = Arc::new(ScriptedProvider::new().with_token_lifetime(Duration::from_secs(120)));
        let (manager, _kv) = make_manager(provider.clone());
        manager.login().unwrap();
        assert!(manager.is_token_expiring_soon());

        provider.set_token_lifetime(Duration::from_secs(3600));
        manager.login().unwrap();
        assert!(!manager.is_token_expiring_soon());
    }

    #[test]
    fn test_bearer_token_requires_session() {
        let provider = Arc::new(ScriptedProvider::new());
        let (manager, _kv) = make_manager(provider);
        assert!(matches!(
            manager.bearer_token(),
            Err(DriveError::Unauthorized(_))
        ));

        let session = manager.login().unwrap();
        assert_eq!(manager.bearer_token().unwrap(), session.access_token);
    }
}
