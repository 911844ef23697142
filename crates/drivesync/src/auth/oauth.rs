//! Microsoft identity platform OAuth2
//!
//! Implements the authorization code flow with PKCE for a public client.
//! A local HTTP listener receives the redirect; tokens are cached in the
//! drivesync config directory and refreshed with the refresh-token grant.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{AuthAccount, AuthError, AuthToken, CredentialProvider};
use crate::config::DriveCredentials;
use crate::runtime::lock;

/// Token cache filename in the drivesync config directory
const TOKEN_CACHE_FILE: &str = "drive-tokens.json";

/// Cached tokens for the signed-in account
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    account: AuthAccount,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: i64,
}

/// Token response from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Error body from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Signed-in user profile from Graph
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    id: String,
    user_principal_name: Option<String>,
    mail: Option<String>,
}

/// OAuth2 public-client provider for Microsoft accounts
pub struct OAuthProvider {
    client_id: String,
    tenant: String,
    cache_path: PathBuf,
    login_timeout: Duration,
    cached: Mutex<Option<StoredToken>>,
}

impl OAuthProvider {
    const AUTHORITY: &'static str = "https://login.microsoftonline.com";
    const PROFILE_URL: &'static str = "https://graph.microsoft.com/v1.0/me";

    /// Drive read/write plus a refresh token
    const SCOPES: &'static str = "offline_access User.Read Files.ReadWrite";

    /// Port range to try for the local redirect listener
    const PORT_RANGE_START: u16 = 8080;
    const PORT_RANGE_END: u16 = 8090;

    /// Tokens this close to expiry are refreshed instead of reused
    const EXPIRY_BUFFER_SECS: i64 = 300;

    /// Create a provider caching tokens in the default config location
    pub fn new(credentials: &DriveCredentials) -> Result<Self, AuthError> {
        let cache_path = config::config_path(TOKEN_CACHE_FILE).ok_or_else(|| {
            AuthError::Unavailable("Could not determine config directory".to_string())
        })?;
        Ok(Self::with_cache_path(credentials, cache_path))
    }

    /// Create a provider caching tokens at `cache_path`
    pub fn with_cache_path(credentials: &DriveCredentials, cache_path: PathBuf) -> Self {
        Self {
            client_id: credentials.client_id.clone(),
            tenant: credentials.tenant.clone(),
            cache_path,
            login_timeout: Duration::from_secs(5 * 60),
            cached: Mutex::new(None),
        }
    }

    /// How long the interactive sign-in waits for the browser redirect
    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    fn authorize_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/authorize", Self::AUTHORITY, self.tenant)
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", Self::AUTHORITY, self.tenant)
    }

    /// Perform the authorization code flow
    fn authorization_code_auth(&self) -> Result<StoredToken, AuthError> {
        // Step 1: Start local server to receive the redirect
        let (listener, port) = self.start_local_server()?;
        let redirect_uri = format!("http://localhost:{}", port);

        // Step 2: Build the authorization URL with a PKCE challenge
        let verifier = random_token(32)?;
        let state = random_token(16)?;
        let auth_url = format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&response_mode=query&scope={}&code_challenge={}&code_challenge_method=S256&state={}&prompt=select_account",
            self.authorize_url(),
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&redirect_uri),
            urlencoding::encode(Self::SCOPES),
            pkce_challenge(&verifier),
            state,
        );

        println!("\n=== Drive Sign-in Required ===");
        println!("Opening browser for authentication...");
        println!("If the browser doesn't open, visit: {}", auth_url);

        if let Err(e) = open::that(&auth_url) {
            warn!("[AUTH] Failed to open browser: {}", e);
        }

        // Step 3: Wait for the redirect carrying the authorization code
        info!("[AUTH] Waiting for authorization on port {}", port);
        let code = self.wait_for_callback(listener, &state)?;

        // Step 4: Exchange the code for tokens
        debug!("[AUTH] Exchanging authorization code for tokens");
        let result = ureq::post(&self.token_url())
            .config()
            .http_status_as_error(false)
            .build()
            .send_form([
                ("client_id", self.client_id.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("code_verifier", verifier.as_str()),
                ("scope", Self::SCOPES),
            ]);
        let token = read_token_response(result)?;

        let account = self.fetch_profile(&token.access_token)?;
        info!("[AUTH] Signed in as {}", account.username);
        Ok(stored_token(account, token, None))
    }

    /// Start a local TCP server on an available port
    fn start_local_server(&self) -> Result<(TcpListener, u16), AuthError> {
        for port in Self::PORT_RANGE_START..=Self::PORT_RANGE_END {
            if let Ok(listener) = TcpListener::bind(format!("127.0.0.1:{}", port)) {
                return Ok((listener, port));
            }
        }
        Err(AuthError::Interaction(format!(
            "Could not bind to any port in range {}-{}",
            Self::PORT_RANGE_START,
            Self::PORT_RANGE_END
        )))
    }

    /// Wait for the redirect and extract the authorization code
    fn wait_for_callback(&self, listener: TcpListener, state: &str) -> Result<String, AuthError> {
        let mut stream = self.accept_with_timeout(&listener)?;

        let mut reader = BufReader::new(&stream);
        let mut request_line = String::new();
        reader
            .read_line(&mut request_line)
            .map_err(|e| AuthError::Interaction(format!("Failed to read redirect: {}", e)))?;

        // Format: GET /?code=AUTH_CODE&state=... HTTP/1.1
        let callback = parse_callback(&request_line);

        let (status, body) = if callback.code.is_some() && callback.error.is_none() {
            ("200 OK", "Authentication successful! You can close this window.")
        } else {
            ("400 Bad Request", "Authentication failed. Please try again.")
        };
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n<html><body><h1>{}</h1></body></html>",
            status, body
        );
        stream.write_all(response.as_bytes()).ok();

        if let Some(err) = callback.error {
            return Err(AuthError::Interaction(format!("OAuth error: {}", err)));
        }
        if callback.state.as_deref() != Some(state) {
            return Err(AuthError::Interaction("State mismatch in redirect".to_string()));
        }
        callback
            .code
            .ok_or_else(|| AuthError::Interaction("No authorization code received".to_string()))
    }

    fn accept_with_timeout(&self, listener: &TcpListener) -> Result<TcpStream, AuthError> {
        let io_error = |e: std::io::Error| AuthError::Interaction(format!("Redirect listener failed: {}", e));
        listener.set_nonblocking(true).map_err(io_error)?;

        let deadline = Instant::now() + self.login_timeout;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).map_err(io_error)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(AuthError::Interaction("Timed out waiting for sign-in".to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(io_error(e)),
            }
        }
    }

    /// Refresh an access token using a refresh token
    fn refresh_access_token(&self, cached: &StoredToken) -> Result<StoredToken, AuthError> {
        let refresh_token = cached
            .refresh_token
            .as_deref()
            .ok_or_else(|| AuthError::Token("No refresh token cached".to_string()))?;

        let result = ureq::post(&self.token_url())
            .config()
            .http_status_as_error(false)
            .build()
            .send_form([
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", Self::SCOPES),
            ]);
        let token = read_token_response(result)?;

        // Preserve the refresh token if not returned
        Ok(stored_token(
            cached.account.clone(),
            token,
            cached.refresh_token.clone(),
        ))
    }

    fn fetch_profile(&self, access_token: &str) -> Result<AuthAccount, AuthError> {
        let mut response = ureq::get(Self::PROFILE_URL)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()
            .map_err(|e| match e {
                ureq::Error::StatusCode(status) => {
                    AuthError::Token(format!("Profile lookup failed with HTTP {}", status))
                }
                other => AuthError::Network(other.to_string()),
            })?;

        let profile: Profile = response
            .body_mut()
            .read_json()
            .map_err(|e| AuthError::Token(format!("Failed to parse profile: {}", e)))?;

        let username = profile
            .user_principal_name
            .or(profile.mail)
            .unwrap_or_else(|| profile.id.clone());
        Ok(AuthAccount {
            id: profile.id,
            username,
        })
    }

    /// Load the cached token from disk
    fn load_token(&self) -> Option<StoredToken> {
        if !self.cache_path.exists() {
            return None;
        }
        match config::load_json_file(&self.cache_path) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("[AUTH] Ignoring unreadable token cache: {:#}", e);
                None
            }
        }
    }

    /// Save the token to memory and disk
    fn save_token(&self, token: &StoredToken) -> Result<(), AuthError> {
        config::save_json_file(&self.cache_path, token)
            .map_err(|e| AuthError::Token(format!("Failed to save token cache: {:#}", e)))?;
        *lock(&self.cached) = Some(token.clone());
        Ok(())
    }
}

impl CredentialProvider for OAuthProvider {
    fn initialize(&self) -> Result<(), AuthError> {
        if self.client_id.is_empty() {
            return Err(AuthError::Unavailable("No OAuth client id configured".to_string()));
        }

        // PKCE needs a secure random source.
        let mut sample = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut sample)
            .map_err(|e| AuthError::Unavailable(format!("No secure random source: {}", e)))?;

        *lock(&self.cached) = self.load_token();
        Ok(())
    }

    fn login_interactive(&self) -> Result<AuthToken, AuthError> {
        let stored = self.authorization_code_auth()?;
        self.save_token(&stored)?;
        Ok(auth_token(&stored))
    }

    fn acquire_token_silent(
        &self,
        account: &AuthAccount,
        force_refresh: bool,
    ) -> Result<AuthToken, AuthError> {
        let cached = lock(&self.cached).clone();
        let cached = match cached {
            Some(token) if token.account.id == account.id => token,
            _ => return Err(AuthError::NoAccount),
        };

        let now = Utc::now().timestamp();
        if !force_refresh && cached.expires_at > now + Self::EXPIRY_BUFFER_SECS {
            return Ok(auth_token(&cached));
        }

        debug!("[AUTH] Refreshing access token for {}", account.username);
        let refreshed = self.refresh_access_token(&cached)?;
        self.save_token(&refreshed)?;
        Ok(auth_token(&refreshed))
    }

    fn handle_redirect_completion(&self) -> Result<Option<AuthToken>, AuthError> {
        // The loopback redirect is consumed inside `login_interactive`.
        Ok(None)
    }

    fn logout(&self, _account: Option<&AuthAccount>) -> Result<(), AuthError> {
        *lock(&self.cached) = None;
        config::remove_file(&self.cache_path)
            .map_err(|e| AuthError::Token(format!("Failed to remove token cache: {:#}", e)))
    }

    fn accounts(&self) -> Vec<AuthAccount> {
        lock(&self.cached)
            .as_ref()
            .map(|token| vec![token.account.clone()])
            .unwrap_or_default()
    }
}

/// Parsed query of the redirect request
#[derive(Debug, Default, PartialEq)]
struct Callback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

fn parse_callback(request_line: &str) -> Callback {
    let Some(target) = request_line.split_whitespace().nth(1) else {
        return Callback::default();
    };
    let Ok(url) = url::Url::parse(&format!("http://localhost{}", target)) else {
        return Callback::default();
    };

    let mut callback = Callback::default();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => callback.code = Some(value.into_owned()),
            "state" => callback.state = Some(value.into_owned()),
            "error" => callback.error = Some(value.into_owned()),
            _ => {}
        }
    }
    callback
}

fn read_token_response(
    result: Result<ureq::http::Response<ureq::Body>, ureq::Error>,
) -> Result<TokenResponse, AuthError> {
    let mut response = result.map_err(|e| AuthError::Network(e.to_string()))?;
    let status = response.status();

    if status.is_success() {
        return response
            .body_mut()
            .read_json()
            .map_err(|e| AuthError::Token(format!("Failed to parse token response: {}", e)));
    }

    let message = match response.body_mut().read_json::<TokenErrorResponse>() {
        Ok(err) => match err.error_description {
            Some(description) => format!("{}: {}", err.error, description),
            None => err.error,
        },
        Err(_) => format!("HTTP {}", status.as_u16()),
    };
    Err(AuthError::Token(message))
}

fn stored_token(
    account: AuthAccount,
    token: TokenResponse,
    previous_refresh: Option<String>,
) -> StoredToken {
    let lifetime = token.expires_in.unwrap_or(3600) as i64;
    StoredToken {
        account,
        access_token: token.access_token,
        refresh_token: token.refresh_token.or(previous_refresh),
        expires_at: Utc::now().timestamp() + lifetime,
    }
}

fn auth_token(stored: &StoredToken) -> AuthToken {
    AuthToken {
        account: stored.account.clone(),
        access_token: stored.access_token.clone(),
        expires_at: DateTime::from_timestamp(stored.expires_at, 0).unwrap_or_else(Utc::now),
    }
}

/// Random URL-safe token from `bytes` bytes of OS randomness
fn random_token(bytes: usize) -> Result<String, AuthError> {
    let mut buf = vec![0u8; bytes];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| AuthError::Unavailable(format!("No secure random source: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// S256 code challenge for a PKCE verifier
fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn credentials() -> DriveCredentials {
        DriveCredentials {
            client_id: "client-123".to_string(),
            tenant: "common".to_string(),
        }
    }

    fn account() -> AuthAccount {
        AuthAccount {
            id: "acc-1".to_string(),
            username: "user@example.com".to_string(),
        }
    }

    #[test]
    fn test_pkce_challenge_matches_rfc_example() {
        // RFC 7636 appendix B
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mJ0kzUqkd8U9wLpZhVvLSAc7H9IYPbI"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_random_tokens_are_url_safe() {
        let token = random_token(32).unwrap();
        assert_eq!(token.len(), 43);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, random_token(32).unwrap());
    }

    #[test]
    fn test_parse_callback() {
        let callback = parse_callback("GET /?code=abc%2F123&state=xyz HTTP/1.1\r\n");
        assert_eq!(callback.code.as_deref(), Some("abc/123"));
        assert_eq!(callback.state.as_deref(), Some("xyz"));
        assert!(callback.error.is_none());

        let denied = parse_callback("GET /?error=access_denied&state=xyz HTTP/1.1\r\n");
        assert_eq!(denied.error.as_deref(), Some("access_denied"));

        assert_eq!(parse_callback("garbage"), Callback::default());
    }

    #[test]
    fn test_endpoints_use_tenant() {
        let provider = OAuthProvider::with_cache_path(&credentials(), PathBuf::from("/tmp/unused.json"));
        assert_eq!(
            provider.token_url(),
            "https://login.microsoftonline.com/common/oauth2/v2.0/token"
        );
    }

    #[test]
    fn test_cached_token_is_reused_until_near_expiry() {
        let dir = tempdir().unwrap();
        let provider = OAuthProvider::with_cache_path(&credentials(), dir.path().join("tokens.json"));
        provider
            .save_token(&StoredToken {
                account: account(),
                access_token: "cached".to_string(),
                refresh_token: None,
                expires_at: Utc::now().timestamp() + 3600,
            })
            .unwrap();

        provider.initialize().unwrap();
        assert_eq!(provider.accounts(), vec![account()]);

        let token = provider.acquire_token_silent(&account(), false).unwrap();
        assert_eq!(token.access_token, "cached");

        // Forcing a refresh without a refresh token fails without network.
        assert!(matches!(
            provider.acquire_token_silent(&account(), true),
            Err(AuthError::Token(_))
        ));
    }

    #[test]
    fn test_unknown_account_is_no_account() {
        let dir = tempdir().unwrap();
        let provider = OAuthProvider::with_cache_path(&credentials(), dir.path().join("tokens.json"));
        provider.initialize().unwrap();
        assert_eq!(
            provider.acquire_token_silent(&account(), false),
            Err(AuthError::NoAccount)
        );
    }

    #[test]
    fn test_logout_removes_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let provider = OAuthProvider::with_cache_path(&credentials(), path.clone());
        provider
            .save_token(&StoredToken {
                account: account(),
                access_token: "cached".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_at: Utc::now().timestamp() + 3600,
            })
            .unwrap();

        provider.logout(None).unwrap();
        assert!(!path.exists());
        assert!(provider.accounts().is_empty());
    }

    #[test]
    fn test_missing_client_id_is_unavailable() {
        let provider = OAuthProvider::with_cache_path(
            &DriveCredentials {
                client_id: String::new(),
                tenant: "common".to_string(),
            },
            PathBuf::from("/tmp/unused.json"),
        );
        assert!(matches!(provider.initialize(), Err(AuthError::Unavailable(_))));
    }
}
