//! Integration tests for 401 recovery
//!
//! Drives the real client against a mock backend and checks:
//! - a single refresh call for any burst of expired-token requests
//! - replay with the refreshed bearer token
//! - uniform Unauthorized failure and local sign-out when refresh fails
//! - no refresh loops for requests that were already replayed

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokenline_core::auth::StoreError;
use tokenline_core::{
    ApiClient, ApiError, CredentialStore, ErrorKind, MemoryStore, SessionState, StorageKey,
};
use wiremock::matchers::{body_json, header, method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use common::{config_for, signed_in_client, token_body};

const BURST: usize = 5;

/// Replays must never go out before the new pair is in the store
struct RequiresPersistedToken {
    store: Arc<MemoryStore>,
}

impl Respond for RequiresPersistedToken {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let access = self.store.peek(StorageKey::AuthToken);
        let refresh = self.store.peek(StorageKey::RefreshToken);
        if access.as_deref() == Some("T2") && refresh.as_deref() == Some("R2") {
            ResponseTemplate::new(200).set_body_json(json!({ "persisted": true }))
        } else {
            ResponseTemplate::new(500)
        }
    }
}

/// Access token reads return the value they saw, then stall
struct SlowTokenStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl CredentialStore for SlowTokenStore {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, StoreError> {
        let value = self.inner.get(key).await?;
        if key == StorageKey::AuthToken {
            tokio::time::sleep(self.delay).await;
        }
        Ok(value)
    }

    async fn set(&self, key: StorageKey, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: StorageKey) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }
}

async fn mount_expired_token(server: &MockServer) {
    Mock::given(header("authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "jwt expired" })))
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refresh_then_replay_with_new_token() {
    let server = MockServer::start().await;
    mount_expired_token(&server).await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refreshToken": "R1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T2", "R2")))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .and(header("authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["a", "b"])))
        .expect(1)
        .mount(&server)
        .await;

    let (api, store, session) = signed_in_client(&server.uri()).await;

    let items: Vec<String> = api.get("/items").await.expect("replayed request succeeds");
    assert_eq!(items, vec!["a", "b"]);

    assert_eq!(store.peek(StorageKey::AuthToken).as_deref(), Some("T2"));
    assert_eq!(store.peek(StorageKey::RefreshToken).as_deref(), Some("R2"));
    assert!(session.is_authenticated());
    assert!(!api.refresh_coordinator().is_refreshing());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_401s_share_one_refresh() {
    let server = MockServer::start().await;
    mount_expired_token(&server).await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("T2", "R2"))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/items/\d+$"))
        .and(header("authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(BURST as u64)
        .mount(&server)
        .await;

    let (api, _store, _session) = signed_in_client(&server.uri()).await;

    let requests = (0..BURST).map(|i| {
        let api = api.clone();
        async move { api.get::<Value>(&format!("/items/{}", i)).await }
    });
    let results = join_all(requests).await;

    for result in results {
        assert_eq!(result.expect("every request succeeds"), json!({ "ok": true }));
    }
    assert_eq!(api.refresh_coordinator().queued(), 0);
    // MockServer verifies the single refresh call on drop
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_401s_fail_together_when_refresh_fails() {
    let server = MockServer::start().await;
    mount_expired_token(&server).await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({ "message": "refresh token revoked" }))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (api, store, session) = signed_in_client(&server.uri()).await;

    let requests = (0..BURST).map(|i| {
        let api = api.clone();
        async move { api.get::<Value>(&format!("/items/{}", i)).await }
    });
    let results = join_all(requests).await;

    for result in results {
        let err = result.expect_err("every request fails");
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.user_message(), ErrorKind::Unauthorized.default_message());
    }

    for key in StorageKey::ALL {
        assert!(!store.contains(key), "{} should be cleared", key.as_str());
    }
    let snapshot = session.snapshot();
    assert!(!snapshot.is_authenticated);
    assert_eq!(snapshot.user, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refresh_endpoint_error_is_not_leaked() {
    let server = MockServer::start().await;
    mount_expired_token(&server).await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "message": "refresh token revoked" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (api, _store, _session) = signed_in_client(&server.uri()).await;

    let err = api.get::<Value>("/items").await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized(_)));
    assert_ne!(err.user_message(), "refresh token revoked");
    assert!(err.detail().cause.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replayed_request_never_refreshes_twice() {
    let server = MockServer::start().await;
    mount_expired_token(&server).await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T2", "R2")))
        .expect(1)
        .mount(&server)
        .await;

    // The refreshed token is rejected too
    Mock::given(header("authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let (api, _store, _session) = signed_in_client(&server.uri()).await;

    let err = api.get::<Value>("/items").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(!api.refresh_coordinator().is_refreshing());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tokens_persisted_before_replay() {
    let server = MockServer::start().await;
    mount_expired_token(&server).await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T2", "R2")))
        .mount(&server)
        .await;

    let (api, store, _session) = signed_in_client(&server.uri()).await;

    Mock::given(header("authorization", "Bearer T2"))
        .respond_with(RequiresPersistedToken {
            store: store.clone(),
        })
        .expect(1)
        .mount(&server)
        .await;

    let body: Value = api.get("/profile").await.expect("replay sees persisted tokens");
    assert_eq!(body, json!({ "persisted": true }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_refresh_token_skips_network() {
    let server = MockServer::start().await;
    mount_expired_token(&server).await;

    Mock::given(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T2", "R2")))
        .expect(0)
        .mount(&server)
        .await;

    let (api, store, session) = signed_in_client(&server.uri()).await;
    store.remove(StorageKey::RefreshToken).await.unwrap();

    let err = api.get::<Value>("/items").await.unwrap_err();
    assert!(err.is_unauthorized());
    assert!(store.is_empty());
    assert!(!session.is_authenticated());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_other_statuses_map_without_refresh() {
    let server = MockServer::start().await;

    Mock::given(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "No such item" })))
        .mount(&server)
        .await;

    Mock::given(path("/conflict"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    Mock::given(path("/validate"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "message": "Validation failed",
            "errors": { "title": ["is required"] }
        })))
        .mount(&server)
        .await;

    Mock::given(path("/boom"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let (api, _store, _session) = signed_in_client(&server.uri()).await;

    let err = api.get::<Value>("/missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.user_message(), "No such item");

    let err = api.get::<Value>("/conflict").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.user_message(), ErrorKind::Conflict.default_message());

    let err = api
        .post::<Value, _>("/validate", &json!({ "title": "" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(err.validation_errors().unwrap()["title"], vec!["is required"]);

    let err = api.get::<Value>("/boom").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Generic);
    assert_eq!(err.status_code(), Some(503));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_trigger_does_not_cancel_refresh() {
    let server = MockServer::start().await;
    mount_expired_token(&server).await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("T2", "R2"))
                .set_delay(Duration::from_millis(400)),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(header("authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("done")))
        .mount(&server)
        .await;

    let (api, store, _session) = signed_in_client(&server.uri()).await;

    let leader = {
        let api = api.clone();
        tokio::spawn(async move { api.get::<Value>("/first").await })
    };

    // Wait until the leader has started the refresh, then queue behind it
    while !api.refresh_coordinator().is_refreshing() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let follower = {
        let api = api.clone();
        tokio::spawn(async move { api.get::<Value>("/second").await })
    };
    while api.refresh_coordinator().queued() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    leader.abort();

    let result = follower.await.expect("follower task joins");
    assert_eq!(result.expect("follower replays"), json!("done"));
    assert_eq!(store.peek(StorageKey::AuthToken).as_deref(), Some("T2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_and_network_errors() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let config = tokenline_core::Config {
        base_url: server.uri(),
        timeout_ms: 100,
        ..Default::default()
    };
    let api = tokenline_core::ApiClient::new(&config, store, Default::default()).unwrap();

    let err = api.get::<Value>("/slow").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.status_code(), None);

    // Nothing listens on the discard port
    let (offline, _store, _session) = common::empty_client("http://127.0.0.1:9");
    let err = offline.get::<Value>("/anything").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_401_during_slow_token_read_does_not_refresh_again() {
    let server = MockServer::start().await;

    Mock::given(path("/a"))
        .and(header("authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    // Rejected after `/a`, and its token read spans the first refresh settling
    Mock::given(path("/b"))
        .and(header("authorization", "Bearer T1"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(100)))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T2", "R2")))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(header("authorization", "Bearer T2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("ok")))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(SlowTokenStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(200),
    });
    store.set(StorageKey::AuthToken, "T1").await.unwrap();
    store.set(StorageKey::RefreshToken, "R1").await.unwrap();
    let api = ApiClient::new(&config_for(&server.uri()), store.clone(), SessionState::new())
        .expect("Failed to build test client");

    let (a, b) = tokio::join!(api.get::<Value>("/a"), api.get::<Value>("/b"));
    assert_eq!(a.expect("first request replays"), json!("ok"));
    assert_eq!(b.expect("second request replays"), json!("ok"));

    let refreshes = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/auth/refresh")
        .count();
    assert_eq!(refreshes, 1);
    assert_eq!(store.inner.peek(StorageKey::AuthToken).as_deref(), Some("T2"));
}
