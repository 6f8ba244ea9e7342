//! Basic login and session lifecycle example
//!
//! Usage:
//!   cargo run --example login_flow

use campus_rs_client::{ApiClient, ApiClientConfig, FileStore, SessionConfig, SessionManager};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Configuration
    let endpoint =
        std::env::var("CAMPUS_ENDPOINT").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let email = std::env::var("CAMPUS_EMAIL").unwrap_or_else(|_| "student@example.com".to_string());
    let password = std::env::var("CAMPUS_PASSWORD").unwrap_or_else(|_| "Secret123!".to_string());

    println!("=== Campus Rust Client Example ===");
    println!("Endpoint: {}", endpoint);
    println!("Email:    {}", email);
    println!();

    // Tokens persist across runs in a local JSON file
    let store = Arc::new(FileStore::open("campus-tokens.json")?);
    let client = ApiClient::new(ApiClientConfig::new(endpoint), store)?;
    let session = SessionManager::with_client(client.clone(), SessionConfig::default());
    session.start_watching();
    println!("✓ Client created");

    // Restore a previous session from durable storage, if one exists
    session.initialize().await;

    if let Some(user) = session.current_user() {
        println!("✓ Session restored from storage");
        println!("  Logged in as: {} ({:?})", user.email, user.role);
    } else {
        println!("No stored session, logging in...");
        let user = session.login(&email, &password).await?;
        println!("✓ Login succeeded");
        println!("  Logged in as: {} ({:?})", user.email, user.role);
    }
    println!();

    // Any endpoint can now be called through the same chokepoint; a stale
    // token is refreshed and the request replayed automatically.
    match client.get::<serde_json::Value>("/courses").await {
        Ok(courses) => println!("Course catalog: {courses}"),
        Err(e) => println!("! Could not fetch catalog: {e}"),
    }
    println!();

    println!("Renewal timer pending: {}", session.renewal_pending());
    println!("Logging out...");
    session.logout().await;
    println!("✓ Logged out (both token stores cleared)");

    Ok(())
}
