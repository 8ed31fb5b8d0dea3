//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use tokenline_core::{
    ApiClient, Config, CredentialStore, MemoryStore, SessionState, StorageKey, User,
};

pub fn test_user() -> User {
    User {
        id: "u1".to_string(),
        email: "a@b.com".to_string(),
        name: Some("Ada".to_string()),
    }
}

pub fn token_body(access: &str, refresh: &str) -> Value {
    json!({ "accessToken": access, "refreshToken": refresh, "expiresIn": 3600 })
}

pub fn config_for(base_url: &str) -> Config {
    Config {
        base_url: base_url.to_string(),
        timeout_ms: 5_000,
        ..Config::default()
    }
}

/// Client with nothing stored and a signed-out session
pub fn empty_client(base_url: &str) -> (ApiClient, Arc<MemoryStore>, SessionState) {
    let store = Arc::new(MemoryStore::new());
    let session = SessionState::new();
    let api = ApiClient::new(&config_for(base_url), store.clone(), session.clone())
        .expect("Failed to build test client");
    (api, store, session)
}

/// Client already signed in with access token `T1` and refresh token `R1`
pub async fn signed_in_client(base_url: &str) -> (ApiClient, Arc<MemoryStore>, SessionState) {
    let (api, store, session) = empty_client(base_url);
    store.set(StorageKey::AuthToken, "T1").await.unwrap();
    store.set(StorageKey::RefreshToken, "R1").await.unwrap();
    store
        .set(StorageKey::User, &serde_json::to_string(&test_user()).unwrap())
        .await
        .unwrap();
    store.set(StorageKey::IsLoggedIn, "true").await.unwrap();
    session.sign_in(test_user());
    (api, store, session)
}
