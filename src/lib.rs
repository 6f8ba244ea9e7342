//! Campus Rust Client
//!
//! A Rust client library for the Campus learning platform API, with
//! automatic bearer authentication, dual durable token storage (cookie jar
//! plus persistent key/value store), proactive silent refresh, and
//! one-shot 401 recovery.

pub mod error;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;

pub use error::{ClientError, Result};
pub use session::{SessionConfig, SessionManager};
pub use storage::{
    CookieStore, CredentialStore, FileStore, MemoryStore, StoredTokens, TokenVault, VaultEvent,
    ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
pub use transport::{ApiClient, ApiClientConfig, AuthApi, TokenRefresher};
pub use types::{
    token_expiry, Ack, AuthResponse, LoginRequest, RefreshRequest, RefreshResponse,
    RegisterRequest, Role, User,
};
