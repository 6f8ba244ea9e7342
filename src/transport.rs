//! HTTP transport: single chokepoint for outbound requests.
//!
//! Attaches the bearer credential, normalizes every response into a
//! `Result<T, ClientError>`, and recovers from a 401 exactly once by
//! delegating to the injected [`TokenRefresher`].

use crate::error::{ClientError, Result};
use crate::storage::{CookieStore, CredentialStore, MemoryStore, TokenVault};
use crate::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

pub(crate) const LOGIN_PATH: &str = "/auth/login";
pub(crate) const REGISTER_PATH: &str = "/auth/register";
pub(crate) const REFRESH_PATH: &str = "/auth/refresh";
pub(crate) const ME_PATH: &str = "/auth/me";
pub(crate) const LOGOUT_PATH: &str = "/auth/logout";

/// Endpoints that issue or exchange credentials. A 401 from one of these
/// must never trigger the refresh-and-replay path (recursion guard).
const AUTH_PATHS: [&str; 3] = [LOGIN_PATH, REGISTER_PATH, REFRESH_PATH];

fn is_auth_path(path: &str) -> bool {
    AUTH_PATHS.contains(&path)
}

/// Capability to obtain a fresh access token, injected into the transport
/// after construction. Implemented by the session layer; held weakly so the
/// transport never keeps the session alive on its own.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Attempt to refresh the credential. Returns true when a new access
    /// token has been installed on the transport.
    async fn refresh_credentials(&self) -> bool;
}

/// The network operations the session layer consumes.
#[async_trait]
pub trait AuthApi: Send + Sync + 'static {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse>;
    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse>;
    async fn refresh(&self, request: &RefreshRequest) -> Result<RefreshResponse>;
    async fn current_user(&self) -> Result<User>;
    async fn logout(&self) -> Result<Ack>;

    /// Replace the in-memory credential, writing through to durable storage
    /// on set and deleting the stored access token on clear.
    fn set_credential(&self, token: Option<String>);

    /// Currently cached credential, if any.
    fn credential(&self) -> Option<String>;
}

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// Base URL of the Campus API, e.g. `http://localhost:8080`.
    pub base_url: String,

    /// Request timeout in seconds. Default: 30 seconds.
    pub timeout_secs: u64,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: 30,
        }
    }
}

/// Minimal shape of an API failure body. Only the message is relied upon.
#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// HTTP client for the Campus API with automatic credential handling
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    vault: TokenVault,
    credential: RwLock<Option<String>>,
    refresher: RwLock<Option<Weak<dyn TokenRefresher>>>,
}

impl ApiClient {
    /// Create a new client. The cookie jar backing the cookie replica of the
    /// token vault is shared with the underlying reqwest client; `local` is
    /// the persistent key/value replica.
    pub fn new(config: ApiClientConfig, local: Arc<dyn CredentialStore>) -> Result<Arc<Self>> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let origin = url::Url::parse(&base_url)
            .map_err(|e| ClientError::Configuration(format!("invalid base URL: {e}")))?;

        let jar = Arc::new(reqwest::cookie::Jar::default());
        let cookie_store = Arc::new(CookieStore::new(jar.clone(), origin));
        let vault = TokenVault::new(cookie_store, local);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .cookie_provider(jar)
            .build()?;

        Ok(Arc::new(Self {
            http,
            base_url,
            vault,
            credential: RwLock::new(None),
            refresher: RwLock::new(None),
        }))
    }

    /// Convenience constructor with an in-memory persistent replica.
    pub fn in_memory(config: ApiClientConfig) -> Result<Arc<Self>> {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    /// The token vault shared between this client and the session layer.
    pub fn vault(&self) -> &TokenVault {
        &self.vault
    }

    /// Install the refresh capability. Called once by the session layer.
    pub fn set_refresher(&self, refresher: Weak<dyn TokenRefresher>) {
        *self.refresher.write() = Some(refresher);
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(Method::GET, path, None::<&()>).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(Method::DELETE, path, None::<&()>).await
    }

    /// Universal request path: attach bearer, send, recover from a 401 at
    /// most once for non-auth endpoints, normalize the response.
    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self.execute(method.clone(), path, body).await?;

        if response.status() == StatusCode::UNAUTHORIZED && !is_auth_path(path) {
            if self.try_refresh().await {
                debug!(path, "replaying request with refreshed credential");
                let replay = self.execute(method, path, body).await?;
                // A second 401 surfaces as a normal error; never a second refresh.
                return Self::parse(replay).await;
            }
            // Refresh unavailable or failed: surface the original 401.
        }

        Self::parse(response).await
    }

    async fn execute<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);

        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(token) = self.bearer() {
            request = request.bearer_auth(token);
        }

        Ok(request.send().await?)
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ClientError::InvalidResponse(e.to_string()));
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.message.or(body.error))
            .unwrap_or_else(|| format!("request failed with status {status}"));

        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Cached credential, falling back to durable storage for the window
    /// between client construction and the first session operation.
    fn bearer(&self) -> Option<String> {
        if let Some(token) = self.credential.read().clone() {
            return Some(token);
        }
        let access = self.vault.access_token()?;
        *self.credential.write() = Some(access.clone());
        Some(access)
    }

    async fn try_refresh(&self) -> bool {
        let refresher = { self.refresher.read().clone() };
        let Some(refresher) = refresher.and_then(|weak| weak.upgrade()) else {
            return false;
        };
        refresher.refresh_credentials().await
    }
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse> {
        self.send(Method::POST, LOGIN_PATH, Some(request)).await
    }

    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse> {
        self.send(Method::POST, REGISTER_PATH, Some(request)).await
    }

    async fn refresh(&self, request: &RefreshRequest) -> Result<RefreshResponse> {
        self.send(Method::POST, REFRESH_PATH, Some(request)).await
    }

    async fn current_user(&self) -> Result<User> {
        self.send(Method::GET, ME_PATH, None::<&()>).await
    }

    async fn logout(&self) -> Result<Ack> {
        self.send(Method::POST, LOGOUT_PATH, None::<&()>).await
    }

    fn set_credential(&self, token: Option<String>) {
        *self.credential.write() = token.clone();
        match token {
            Some(token) => self.vault.store_access(&token),
            None => self.vault.remove_access(),
        }
    }

    fn credential(&self) -> Option<String> {
        self.credential.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_paths_are_excluded_from_retry() {
        assert!(is_auth_path(LOGIN_PATH));
        assert!(is_auth_path(REGISTER_PATH));
        assert!(is_auth_path(REFRESH_PATH));
        assert!(!is_auth_path(ME_PATH));
        assert!(!is_auth_path("/courses"));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = ApiClient::in_memory(ApiClientConfig::new("http://localhost:8080/")).unwrap();
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_bearer_falls_back_to_durable_storage() {
        let client = ApiClient::in_memory(ApiClientConfig::new("http://localhost:8080")).unwrap();

        assert!(client.bearer().is_none());

        client.vault().store("a1", "r1");
        assert_eq!(client.bearer().unwrap(), "a1");

        // Now cached in memory as well
        assert_eq!(client.credential().unwrap(), "a1");
    }

    #[test]
    fn test_set_credential_writes_through() {
        let client = ApiClient::in_memory(ApiClientConfig::new("http://localhost:8080")).unwrap();

        client.set_credential(Some("a1".to_string()));
        assert_eq!(client.vault().access_token().unwrap(), "a1");

        client.set_credential(None);
        assert!(client.vault().access_token().is_none());
    }
}
