//! Durable credential storage: two replicas of one logical token pair.
//!
//! Tokens are persisted redundantly in a cookie jar (shared with the HTTP
//! client) and a persistent key/value store. The cookie copy is preferred on
//! read; a store-only value is backfilled into the cookie. Writes and clears
//! always touch both replicas.

use crate::error::{ClientError, Result};
use papaya::HashMap;
use parking_lot::Mutex;
use reqwest::cookie::CookieStore as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use url::Url;

/// Key under which the access token lives in both replicas.
pub const ACCESS_TOKEN_KEY: &str = "campus_access_token";
/// Key under which the refresh token lives in both replicas.
pub const REFRESH_TOKEN_KEY: &str = "campus_refresh_token";

/// A single durable key/value facility holding credential strings.
///
/// Operations are infallible by contract: a replica that cannot persist logs
/// and degrades rather than failing the session operation that wrote it.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory store backed by a Papaya HashMap.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.pin().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.pin().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.pin().remove(key);
    }
}

/// JSON-file-backed store, giving a native process cross-run durability.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<std::collections::HashMap<String, String>>,
}

impl FileStore {
    /// Open (or create) a store at `path`. A missing file starts empty; a
    /// file that exists but cannot be read or parsed is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| ClientError::Storage(format!("unreadable token file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Default::default(),
            Err(e) => return Err(ClientError::Storage(format!("cannot read token file: {e}"))),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &std::collections::HashMap<String, String>) {
        let raw = match serde_json::to_string(entries) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to serialize token file");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, raw) {
            warn!(path = %self.path.display(), error = %e, "failed to persist token file");
        }
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock();
        entries.remove(key);
        self.persist(&entries);
    }
}

/// Cookie-jar replica. The jar is the same one the reqwest client uses, so
/// stored tokens also ride along as cookies on same-origin requests.
pub struct CookieStore {
    jar: Arc<reqwest::cookie::Jar>,
    origin: Url,
}

impl CookieStore {
    pub fn new(jar: Arc<reqwest::cookie::Jar>, origin: Url) -> Self {
        Self { jar, origin }
    }
}

impl CredentialStore for CookieStore {
    fn get(&self, key: &str) -> Option<String> {
        let header = self.jar.cookies(&self.origin)?;
        let header = header.to_str().ok()?;
        header.split("; ").find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            (name == key && !value.is_empty()).then(|| value.to_string())
        })
    }

    fn set(&self, key: &str, value: &str) {
        let mut cookie = format!("{key}={value}; Path=/; SameSite=Strict");
        if self.origin.scheme() == "https" {
            cookie.push_str("; Secure");
        }
        self.jar.add_cookie_str(&cookie, &self.origin);
    }

    fn remove(&self, key: &str) {
        self.jar
            .add_cookie_str(&format!("{key}=; Path=/; Max-Age=0"), &self.origin);
    }
}

/// Change notification published by the vault. Carries the new access token
/// value so listeners can distinguish their own writes from external ones.
#[derive(Debug, Clone)]
pub enum VaultEvent {
    AccessChanged(Option<String>),
}

/// Token pair as read from durable storage.
#[derive(Debug, Clone, Default)]
pub struct StoredTokens {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

/// The two durable replicas treated as one logical value.
#[derive(Clone)]
pub struct TokenVault {
    cookie: Arc<dyn CredentialStore>,
    local: Arc<dyn CredentialStore>,
    events: broadcast::Sender<VaultEvent>,
}

impl TokenVault {
    pub fn new(cookie: Arc<dyn CredentialStore>, local: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            cookie,
            local,
            events,
        }
    }

    /// Subscribe to access-token change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    /// Read both tokens, cookie replica preferred, backfilling the cookie
    /// from the local store when only the latter has a value.
    pub fn load(&self) -> StoredTokens {
        StoredTokens {
            access: self.read_with_backfill(ACCESS_TOKEN_KEY),
            refresh: self.read_with_backfill(REFRESH_TOKEN_KEY),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_with_backfill(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_with_backfill(REFRESH_TOKEN_KEY)
    }

    /// Write a full token pair to both replicas.
    pub fn store(&self, access: &str, refresh: &str) {
        self.write_both(ACCESS_TOKEN_KEY, access);
        self.write_both(REFRESH_TOKEN_KEY, refresh);
        let _ = self
            .events
            .send(VaultEvent::AccessChanged(Some(access.to_string())));
    }

    /// Write only the access token; the refresh token is stable across a
    /// silent refresh and is left untouched.
    pub fn store_access(&self, access: &str) {
        self.write_both(ACCESS_TOKEN_KEY, access);
        let _ = self
            .events
            .send(VaultEvent::AccessChanged(Some(access.to_string())));
    }

    /// Remove only the access token from both replicas.
    pub fn remove_access(&self) {
        self.cookie.remove(ACCESS_TOKEN_KEY);
        self.local.remove(ACCESS_TOKEN_KEY);
        let _ = self.events.send(VaultEvent::AccessChanged(None));
    }

    /// Remove both tokens from both replicas.
    pub fn clear(&self) {
        self.cookie.remove(ACCESS_TOKEN_KEY);
        self.local.remove(ACCESS_TOKEN_KEY);
        self.cookie.remove(REFRESH_TOKEN_KEY);
        self.local.remove(REFRESH_TOKEN_KEY);
        let _ = self.events.send(VaultEvent::AccessChanged(None));
    }

    fn read_with_backfill(&self, key: &str) -> Option<String> {
        if let Some(value) = self.cookie.get(key) {
            return Some(value);
        }
        let value = self.local.get(key)?;
        self.cookie.set(key, &value);
        Some(value)
    }

    fn write_both(&self, key: &str, value: &str) {
        self.cookie.set(key, value);
        self.local.set(key, value);
    }
}
