//! OAuth storage and state integration tests.
//!
//! Exercises the persisted OAuth state through the public storage API with
//! both the file-backed and in-memory token stores.

use std::sync::Arc;

use chrono::{Duration, Utc};
use mcpfleet::auth::{AuthStorage, ClientInformation, FileTokenStore, MemoryTokenStore, OAuthTokens, TokenStore};
use mcpfleet::ErrorKind;
use tempfile::TempDir;

const SERVER: &str = "https://mcp.example.com/mcp";

fn file_storage(dir: &TempDir) -> AuthStorage {
    AuthStorage::new(Arc::new(FileTokenStore::new(dir.path())), SERVER)
}

fn full_tokens() -> OAuthTokens {
    OAuthTokens {
        access_token: "at-123".into(),
        token_type: "Bearer".into(),
        expires_in: Some(3600),
        refresh_token: Some("rt-456".into()),
        scope: Some("read write".into()),
        obtained_at: Some(1_700_000_000),
    }
}

// ============================================================================
// Tokens
// ============================================================================

#[test]
fn test_tokens_round_trip_through_files() {
    let dir = TempDir::new().unwrap();
    let storage = file_storage(&dir);
    assert!(storage.tokens().unwrap().is_none());

    storage.save_tokens(&full_tokens()).unwrap();

    // A fresh storage over the same directory sees the same tokens.
    let reopened = file_storage(&dir);
    assert_eq!(reopened.tokens().unwrap(), Some(full_tokens()));
}

#[test]
fn test_corrupt_tokens_are_purged() {
    let store = Arc::new(MemoryTokenStore::new());
    let storage = AuthStorage::new(store.clone(), SERVER);
    let key = storage.key("tokens");

    store.set(&key, "{not json").unwrap();
    assert!(storage.tokens().unwrap().is_none());
    assert!(store.get(&key).unwrap().is_none());

    // Repair is idempotent.
    assert!(storage.tokens().unwrap().is_none());
}

#[test]
fn test_saving_tokens_clears_attempt_state() {
    let dir = TempDir::new().unwrap();
    let storage = file_storage(&dir);
    storage.save_code_verifier("verifier").unwrap();
    storage.save_last_auth_url("https://auth.example.com/authorize?x=1").unwrap();

    storage.save_tokens(&OAuthTokens::bearer("at")).unwrap();

    assert_eq!(storage.code_verifier().unwrap_err().kind(), ErrorKind::Auth);
    assert!(storage.last_auth_url().unwrap().is_none());
}

#[test]
fn test_servers_do_not_collide() {
    let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
    let a = AuthStorage::new(store.clone(), "https://a.example.com/mcp");
    let b = AuthStorage::new(store, "https://b.example.com/mcp");

    a.save_tokens(&OAuthTokens::bearer("token-a")).unwrap();
    assert!(b.tokens().unwrap().is_none());
    assert_ne!(a.key("tokens"), b.key("tokens"));
    assert!(a.key("tokens").starts_with("mcpfleet_auth_"));
}

#[test]
fn test_client_information_and_clear() {
    let dir = TempDir::new().unwrap();
    let storage = file_storage(&dir);
    let info = ClientInformation { client_id: "client-1".into(), client_secret: None };

    storage.save_client_information(&info).unwrap();
    storage.save_tokens(&OAuthTokens::bearer("at")).unwrap();
    assert_eq!(storage.client_information().unwrap(), Some(info));

    storage.clear().unwrap();
    assert!(storage.client_information().unwrap().is_none());
    assert!(storage.tokens().unwrap().is_none());
}

// ============================================================================
// State nonces
// ============================================================================

#[test]
fn test_state_is_single_use() {
    let storage = AuthStorage::new(Arc::new(MemoryTokenStore::new()), SERVER);
    let state = storage.issue_state(Some("/settings".into())).unwrap();

    let record = storage.consume_state(&state).unwrap();
    assert_eq!(record.return_url.as_deref(), Some("/settings"));
    assert!(record.expires_at > Utc::now());

    assert_eq!(storage.consume_state(&state).unwrap_err().kind(), ErrorKind::Auth);
}

#[test]
fn test_expired_state_fails_closed() {
    let store = Arc::new(MemoryTokenStore::new());
    let storage = AuthStorage::new(store.clone(), SERVER);

    let expired = serde_json::json!({ "expiresAt": Utc::now() - Duration::seconds(1) });
    store.set(&storage.key("state_stale"), &expired.to_string()).unwrap();

    let err = storage.consume_state("stale").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(err.to_string().contains("expired"));
    assert!(store.get(&storage.key("state_stale")).unwrap().is_none());
}

#[test]
fn test_unknown_state_fails_closed() {
    let storage = AuthStorage::new(Arc::new(MemoryTokenStore::new()), SERVER);
    assert!(storage.consume_state("never-issued").is_err());
    assert!(storage.consume_state("").is_err());
    assert!(storage.consume_state("../../etc/passwd").is_err());
}

#[test]
fn test_missing_verifier_is_auth_error() {
    let storage = AuthStorage::new(Arc::new(MemoryTokenStore::new()), SERVER);
    let err = storage.code_verifier().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
}

// ============================================================================
// Token expiry
// ============================================================================

#[test]
fn test_token_expiry_window() {
    let now = Utc::now();
    let fresh = OAuthTokens { obtained_at: Some(now.timestamp()), expires_in: Some(3600), ..OAuthTokens::bearer("a") };
    let stale = OAuthTokens { obtained_at: Some(now.timestamp() - 3600), expires_in: Some(3600), ..OAuthTokens::bearer("a") };

    assert!(!fresh.is_expired(now));
    assert!(stale.is_expired(now));
    assert!(!OAuthTokens::bearer("no-expiry").is_expired(now));
}
