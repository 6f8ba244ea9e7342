//! Session store and lifecycle manager.
//!
//! Single source of truth for the authenticated identity. Owns the token
//! pair, the proactive renewal timer, and reconciliation with external
//! storage changes (another handle on the same vault logging in or out).

use crate::error::Result;
use crate::storage::{TokenVault, VaultEvent};
use crate::transport::{ApiClient, AuthApi, TokenRefresher};
use crate::types::*;
use async_singleflight::Group;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Key for deduplicating concurrent refresh-token exchanges. There is one
/// session per manager, so a single key suffices.
const REFRESH_FLIGHT_KEY: &str = "session-refresh";

/// Configuration for session lifecycle timing
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Renew the access token this many seconds before it expires.
    /// Default: 300 seconds.
    pub refresh_lead_secs: u64,

    /// Floor for the renewal delay, guarding a near-expired token against a
    /// zero or negative delay that would storm the refresh endpoint.
    /// Default: 30 seconds.
    pub min_renewal_delay_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_lead_secs: 300,
            min_renewal_delay_secs: 30,
        }
    }
}

fn renewal_delay(expires_in_secs: u64, config: &SessionConfig) -> Duration {
    let secs = expires_in_secs
        .saturating_sub(config.refresh_lead_secs)
        .max(config.min_renewal_delay_secs);
    Duration::from_secs(secs)
}

struct SessionState {
    user: Option<User>,
    loading: bool,
}

/// Session store and lifecycle manager.
///
/// Generic over [`AuthApi`] so the lifecycle logic can be exercised against
/// a stub transport; production code uses [`SessionManager<ApiClient>`] via
/// [`SessionManager::with_client`].
pub struct SessionManager<A: AuthApi> {
    api: Arc<A>,
    vault: TokenVault,
    config: SessionConfig,
    state: RwLock<SessionState>,
    renewal: Mutex<Option<JoinHandle<()>>>,
    /// Deduplicates concurrent refresh-token exchanges (timer, 401 recovery,
    /// and explicit rechecks can overlap).
    /// Error type is String because singleflight requires a shared error type.
    refresh_flight: Group<u64, String>,
    weak_self: Weak<Self>,
}

impl<A: AuthApi> SessionManager<A> {
    pub fn new(api: Arc<A>, vault: TokenVault, config: SessionConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            api,
            vault,
            config,
            state: RwLock::new(SessionState {
                user: None,
                loading: true,
            }),
            renewal: Mutex::new(None),
            refresh_flight: Group::new(),
            weak_self: weak.clone(),
        })
    }

    /// The authenticated identity, if any.
    pub fn current_user(&self) -> Option<User> {
        self.state.read().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().user.is_some()
    }

    /// True until the first `initialize` completes, on any path.
    pub fn is_loading(&self) -> bool {
        self.state.read().loading
    }

    /// Whether a renewal timer is currently outstanding.
    pub fn renewal_pending(&self) -> bool {
        self.renewal
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Restore the session from durable storage at application start.
    ///
    /// Performs exactly one `loading` true-to-false transition regardless of
    /// the path taken (restored, refreshed, or unauthenticated).
    pub async fn initialize(&self) {
        self.refresh_auth().await;
        self.state.write().loading = false;
    }

    /// Re-run the startup reconciliation: read the vault (cookie preferred,
    /// local-store backfill), validate the token expiry locally, and either
    /// restore the session, silently refresh, or tear down.
    pub async fn refresh_auth(&self) {
        let stored = self.vault.load();

        let Some(access) = stored.access else {
            if self.state.read().user.is_some() || self.api.credential().is_some() {
                self.teardown();
            }
            return;
        };

        let now = unix_now();
        match token_expiry(&access) {
            Ok(exp) if exp > now => {
                self.api.set_credential(Some(access));
                match self.api.current_user().await {
                    Ok(user) => {
                        self.state.write().user = Some(user);
                        self.schedule_renewal((exp - now) as u64);
                    }
                    Err(e) => {
                        debug!(error = %e, "profile fetch with stored token failed, attempting refresh");
                        self.silent_refresh().await;
                    }
                }
            }
            Ok(_) => {
                debug!("stored access token expired, attempting silent refresh");
                self.silent_refresh().await;
            }
            Err(e) => {
                warn!(error = %e, "stored access token unreadable");
                if stored.refresh.is_some() {
                    self.silent_refresh().await;
                } else {
                    self.teardown();
                }
            }
        }
    }

    /// Authenticate with email and password. On failure the prior session
    /// state is left untouched.
    pub async fn login(&self, email: &str, password: &str) -> Result<User> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let auth = self.api.login(&request).await?;
        info!(email = %auth.user.email, "login succeeded");
        Ok(self.install_session(auth))
    }

    /// Create an account. Structurally identical to `login`: the server
    /// issues a fresh token pair on success.
    pub async fn register(&self, request: &RegisterRequest) -> Result<User> {
        let auth = self.api.register(request).await?;
        info!(email = %auth.user.email, "registration succeeded");
        Ok(self.install_session(auth))
    }

    /// Log out. Server-side invalidation is best-effort; local teardown is
    /// unconditional and idempotent.
    pub async fn logout(&self) {
        match self.api.logout().await {
            Ok(ack) => debug!(message = %ack.message, "server-side logout acknowledged"),
            Err(e) => warn!(error = %e, "server-side logout failed, clearing local session anyway"),
        }
        self.teardown();
    }

    /// Subscribe to vault change notifications and reconcile on each one,
    /// sharing the startup code path. An external clear tears this session
    /// down; an external new token is adopted and rechecked.
    pub fn start_watching(&self) {
        let mut rx = self.vault.subscribe();
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(session) = weak.upgrade() else { break };
                        session.handle_vault_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "vault event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_vault_event(&self, event: VaultEvent) {
        match event {
            VaultEvent::AccessChanged(None) => {
                // Ignore echoes of our own teardown.
                if self.api.credential().is_some() || self.state.read().user.is_some() {
                    info!("access token cleared externally, tearing down session");
                    self.teardown();
                }
            }
            VaultEvent::AccessChanged(Some(token)) => {
                // Ignore echoes of our own writes.
                if self.api.credential().as_deref() != Some(token.as_str()) {
                    info!("access token changed externally, rechecking session");
                    self.api.set_credential(Some(token));
                    self.refresh_auth().await;
                }
            }
        }
    }

    fn install_session(&self, auth: AuthResponse) -> User {
        // Credential first so the vault write below is recognized as our own.
        self.api.set_credential(Some(auth.access_token.clone()));
        self.vault.store(&auth.access_token, &auth.refresh_token);
        self.state.write().user = Some(auth.user.clone());
        self.schedule_renewal(auth.expires_in);
        auth.user
    }

    /// Unconditional teardown: cancel the renewal timer, clear the transport
    /// credential and both durable replicas, and drop the user. Idempotent.
    fn teardown(&self) {
        if let Some(handle) = self.renewal.lock().take() {
            handle.abort();
        }
        self.api.set_credential(None);
        self.vault.clear();
        self.state.write().user = None;
    }

    /// Arm the renewal timer, cancelling any previous one (at most one
    /// outstanding timer per session).
    fn schedule_renewal(&self, expires_in_secs: u64) {
        let delay = renewal_delay(expires_in_secs, &self.config);
        debug!(delay_secs = delay.as_secs(), "scheduling token renewal");

        // Cancel the previous timer before arming the new one, so there is
        // never an instant with two live timers.
        if let Some(previous) = self.renewal.lock().take() {
            previous.abort();
        }

        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = weak.upgrade() else { return };
            if !session.silent_refresh().await {
                debug!("scheduled renewal could not refresh, session cleared");
            }
        });

        *self.renewal.lock() = Some(handle);
    }

    /// Exchange the refresh token for a new access token, fetch the profile
    /// again (role or permission changes since the last check), and re-arm
    /// the timer. Any failure resolves to full teardown; there is no
    /// partial-credential state.
    async fn silent_refresh(&self) -> bool {
        let expires_in = match self.exchange_refresh_token().await {
            Ok(expires_in) => expires_in,
            Err(e) => {
                warn!(error = %e, "silent refresh failed");
                self.teardown();
                return false;
            }
        };

        match self.api.current_user().await {
            Ok(user) => {
                self.state.write().user = Some(user);
                self.schedule_renewal(expires_in);
                true
            }
            Err(e) => {
                warn!(error = %e, "profile fetch after refresh failed");
                self.teardown();
                false
            }
        }
    }

    /// The deduplicated exchange. Concurrent callers (timer fire, a 401
    /// recovery, an explicit recheck) share one network call.
    async fn exchange_refresh_token(&self) -> Result<u64> {
        let (expires_in, err, _shared) = self
            .refresh_flight
            .work(REFRESH_FLIGHT_KEY, async {
                let Some(refresh_token) = self.vault.refresh_token() else {
                    return Err("no refresh token in storage".to_string());
                };

                let request = RefreshRequest { refresh_token };
                match self.api.refresh(&request).await {
                    Ok(refreshed) => {
                        // Access token only; the refresh token is stable.
                        self.api.set_credential(Some(refreshed.access_token));
                        Ok(refreshed.expires_in)
                    }
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;

        match (expires_in, err) {
            (Some(expires_in), None) => Ok(expires_in),
            (None, Some(message)) => Err(crate::error::ClientError::Authentication(message)),
            _ => Err(crate::error::ClientError::Authentication(
                "refresh produced no result".to_string(),
            )),
        }
    }
}

impl SessionManager<ApiClient> {
    /// Wire a manager to a concrete [`ApiClient`]: share its token vault and
    /// install this session as the client's refresh capability.
    pub fn with_client(client: Arc<ApiClient>, config: SessionConfig) -> Arc<Self> {
        let vault = client.vault().clone();
        let manager = SessionManager::new(client.clone(), vault, config);
        let weak = Arc::downgrade(&manager);
        let weak: Weak<dyn TokenRefresher> = weak;
        client.set_refresher(weak);
        manager
    }
}

#[async_trait]
impl<A: AuthApi> TokenRefresher for SessionManager<A> {
    async fn refresh_credentials(&self) -> bool {
        match self.exchange_refresh_token().await {
            Ok(expires_in) => {
                self.schedule_renewal(expires_in);
                true
            }
            Err(e) => {
                warn!(error = %e, "credential refresh failed");
                self.teardown();
                false
            }
        }
    }
}

impl<A: AuthApi> Drop for SessionManager<A> {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.lock().take() {
            handle.abort();
        }
    }
}
