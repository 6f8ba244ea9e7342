//! End-to-end tests of the transport and session layers against an
//! in-process stub of the Campus auth API.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose;
use base64::Engine;
use campus_rs_client::{
    ApiClient, ApiClientConfig, AuthApi, ClientError, RefreshRequest, RegisterRequest,
    SessionConfig, SessionManager,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const EMAIL: &str = "a@b.com";
const PASSWORD: &str = "Secret123!";

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn unsigned_jwt(exp: i64) -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = general_purpose::URL_SAFE_NO_PAD
        .encode(json!({ "sub": "u1", "exp": exp }).to_string());
    format!("{header}.{payload}.sig")
}

#[derive(Default)]
struct StubState {
    current_token: Mutex<Option<String>>,
    login_calls: AtomicUsize,
    register_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    refresh_fails: AtomicBool,
}

impl StubState {
    fn issue_token(&self) -> String {
        let token = unsigned_jwt(unix_now() + 3600);
        *self.current_token.lock().unwrap() = Some(token.clone());
        token
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let Some(token) = value.strip_prefix("Bearer ") else {
            return false;
        };
        self.current_token.lock().unwrap().as_deref() == Some(token)
    }
}

fn user_json() -> Value {
    json!({
        "id": "u1",
        "email": EMAIL,
        "role": "STUDENT",
        "isActive": true,
        "isVerified": true
    })
}

async fn login_handler(
    State(state): State<Arc<StubState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.login_calls.fetch_add(1, Ordering::SeqCst);
    if body["email"] == EMAIL && body["password"] == PASSWORD {
        let token = state.issue_token();
        (
            StatusCode::OK,
            Json(json!({
                "user": user_json(),
                "accessToken": token,
                "refreshToken": "r1",
                "expiresIn": 3600
            })),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Invalid email or password" })),
        )
    }
}

async fn register_handler(
    State(state): State<Arc<StubState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.register_calls.fetch_add(1, Ordering::SeqCst);
    if body["email"].is_string() && body["password"].is_string() {
        let token = state.issue_token();
        (
            StatusCode::OK,
            Json(json!({
                "user": {
                    "id": "u2",
                    "email": body["email"],
                    "role": "STUDENT",
                    "isActive": true,
                    "isVerified": false
                },
                "accessToken": token,
                "refreshToken": "r1",
                "expiresIn": 3600
            })),
        )
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "Email and password are required" })),
        )
    }
}

async fn refresh_handler(
    State(state): State<Arc<StubState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if state.refresh_fails.load(Ordering::SeqCst) || body["refreshToken"] != "r1" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Refresh token expired" })),
        );
    }
    let token = state.issue_token();
    (
        StatusCode::OK,
        Json(json!({ "accessToken": token, "expiresIn": 3600 })),
    )
}

async fn me_handler(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if state.authorized(&headers) {
        (StatusCode::OK, Json(user_json()))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Unauthorized" })),
        )
    }
}

async fn logout_handler() -> Json<Value> {
    Json(json!({ "message": "Logged out" }))
}

async fn courses_handler(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if state.authorized(&headers) {
        (
            StatusCode::OK,
            Json(json!([{ "id": "c1", "title": "Intro to Rust" }])),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Unauthorized" })),
        )
    }
}

/// Endpoint that rejects every credential, for exercising the retry bound.
async fn locked_handler() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "Unauthorized" })),
    )
}

async fn spawn_stub() -> (Arc<StubState>, String) {
    let state = Arc::new(StubState::default());
    let app = Router::new()
        .route("/auth/login", post(login_handler))
        .route("/auth/register", post(register_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/me", get(me_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/courses", get(courses_handler))
        .route("/locked", get(locked_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, format!("http://{addr}"))
}

fn connect(base_url: &str) -> (Arc<ApiClient>, Arc<SessionManager<ApiClient>>) {
    let client = ApiClient::in_memory(ApiClientConfig::new(base_url)).unwrap();
    let session = SessionManager::with_client(client.clone(), SessionConfig::default());
    (client, session)
}

#[tokio::test]
async fn fresh_login_flow() {
    let (_state, base_url) = spawn_stub().await;
    let (client, session) = connect(&base_url);

    let user = session.login(EMAIL, PASSWORD).await.unwrap();

    assert_eq!(user.email, EMAIL);
    assert_eq!(session.current_user().unwrap().email, EMAIL);
    assert_eq!(client.vault().refresh_token().unwrap(), "r1");
    assert_eq!(
        client.vault().access_token().unwrap(),
        client.credential().unwrap()
    );
    assert!(session.renewal_pending());

    let courses: Value = client.get("/courses").await.unwrap();
    assert_eq!(courses[0]["title"], "Intro to Rust");
}

#[tokio::test]
async fn registration_installs_session() {
    let (state, base_url) = spawn_stub().await;
    let (client, session) = connect(&base_url);

    let user = session
        .register(&RegisterRequest {
            email: "new@b.com".to_string(),
            password: PASSWORD.to_string(),
            first_name: Some("New".to_string()),
            last_name: None,
        })
        .await
        .unwrap();

    assert_eq!(user.email, "new@b.com");
    assert_eq!(session.current_user().unwrap().email, "new@b.com");
    assert_eq!(client.vault().refresh_token().unwrap(), "r1");
    assert!(client.vault().access_token().is_some());
    assert!(session.renewal_pending());
    assert_eq!(state.register_calls.load(Ordering::SeqCst), 1);

    // The freshly issued token pair is immediately usable
    let courses: Value = client.get("/courses").await.unwrap();
    assert_eq!(courses[0]["id"], "c1");
}

#[tokio::test]
async fn invalid_login_surfaces_server_message() {
    let (_state, base_url) = spawn_stub().await;
    let (_client, session) = connect(&base_url);

    let err = session.login(EMAIL, "wrong").await.unwrap_err();

    match err {
        ClientError::Api { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "Invalid email or password");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn stale_credential_is_refreshed_and_replayed() {
    let (state, base_url) = spawn_stub().await;
    let (client, session) = connect(&base_url);

    session.login(EMAIL, PASSWORD).await.unwrap();

    // Server-side rotation invalidates the client's cached token
    *state.current_token.lock().unwrap() = Some("rotated-elsewhere".to_string());

    let courses: Value = client.get("/courses").await.unwrap();
    assert_eq!(courses[0]["id"], "c1");
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_401_surfaces_without_second_refresh() {
    let (state, base_url) = spawn_stub().await;
    let (client, session) = connect(&base_url);

    session.login(EMAIL, PASSWORD).await.unwrap();

    // The locked endpoint 401s even after a successful refresh
    let err = client.get::<Value>("/locked").await.unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_endpoint_401_does_not_recurse() {
    let (state, base_url) = spawn_stub().await;
    let (client, session) = connect(&base_url);

    session.login(EMAIL, PASSWORD).await.unwrap();
    state.refresh_fails.store(true, Ordering::SeqCst);

    let err = client
        .refresh(&RefreshRequest {
            refresh_token: "r1".to_string(),
        })
        .await
        .unwrap_err();

    assert!(err.is_unauthorized());
    // Only the direct call hit the endpoint; no refresh-and-replay cycle
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_token_restore_refreshes_without_authenticate() {
    let (state, base_url) = spawn_stub().await;
    let (client, session) = connect(&base_url);

    client.vault().store(&unsigned_jwt(unix_now() - 60), "r1");
    session.initialize().await;

    assert_eq!(session.current_user().unwrap().email, EMAIL);
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.login_calls.load(Ordering::SeqCst), 0);
    assert!(!session.is_loading());
}

#[tokio::test]
async fn refresh_failure_on_restore_cascades_to_teardown() {
    let (state, base_url) = spawn_stub().await;
    let (client, session) = connect(&base_url);

    state.refresh_fails.store(true, Ordering::SeqCst);
    client.vault().store(&unsigned_jwt(unix_now() - 60), "r1");
    session.initialize().await;

    assert!(session.current_user().is_none());
    assert!(client.vault().access_token().is_none());
    assert!(client.vault().refresh_token().is_none());
    assert!(!session.is_loading());
}

#[tokio::test]
async fn logout_clears_stores_and_blocks_further_calls() {
    let (state, base_url) = spawn_stub().await;
    let (client, session) = connect(&base_url);

    session.login(EMAIL, PASSWORD).await.unwrap();
    session.logout().await;

    assert!(client.vault().access_token().is_none());
    assert!(client.vault().refresh_token().is_none());
    assert!(!session.renewal_pending());

    // No credential and no refresh token: the 401 surfaces directly
    let refreshes_before = state.refresh_calls.load(Ordering::SeqCst);
    let err = client.get::<Value>("/courses").await.unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(state.refresh_calls.load(Ordering::SeqCst), refreshes_before);
}

#[tokio::test]
async fn transport_failure_is_a_structured_error() {
    // Bind and immediately drop a listener to get a dead port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ApiClient::in_memory(ApiClientConfig::new(format!("http://{addr}"))).unwrap();
    let err = client.get::<Value>("/courses").await.unwrap_err();

    assert!(matches!(err, ClientError::HttpRequest(_)));
}
