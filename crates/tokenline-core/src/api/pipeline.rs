//! Outbound request pipeline.
//!
//! A request passes through an ordered list of [`RequestStage`]s before it is
//! handed to the transport. Stages only mutate the request descriptor.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::Credentials;

/// Paths that authenticate the caller and must never carry a bearer token
pub const AUTH_EXEMPT_PATHS: [&str; 3] = ["/auth/login", "/auth/signup", "/auth/refresh"];

pub fn is_auth_exempt(path: &str) -> bool {
    AUTH_EXEMPT_PATHS.iter().any(|exempt| path.contains(exempt))
}

/// Outbound request descriptor, resolved against the configured base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    /// Set once the request has been replayed after a refresh; a second 401
    /// is then final.
    pub retried: bool,
    /// Access token the bearer stage attached, if any
    pub sent_token: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
            sent_token: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Replace the Authorization header. Tokens that are not valid header
    /// values are dropped rather than sent mangled.
    pub fn set_bearer(&mut self, token: &str) {
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                self.headers.insert(AUTHORIZATION, value);
                self.sent_token = Some(token.to_string());
            }
            Err(e) => {
                warn!(error = %e, "Access token is not a valid header value");
                self.headers.remove(AUTHORIZATION);
                self.sent_token = None;
            }
        }
    }

    pub fn is_auth_exempt(&self) -> bool {
        is_auth_exempt(&self.path)
    }
}

#[async_trait]
pub trait RequestStage: Send + Sync {
    async fn apply(&self, request: &mut ApiRequest);
}

/// Attaches `Authorization: Bearer <access token>` to every non-auth request.
pub struct BearerAuth {
    credentials: Credentials,
}

impl BearerAuth {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl RequestStage for BearerAuth {
    async fn apply(&self, request: &mut ApiRequest) {
        if request.is_auth_exempt() {
            return;
        }

        match self.credentials.access_token().await {
            Ok(Some(token)) => request.set_bearer(&token),
            Ok(None) => debug!(path = %request.path, "No access token, sending unauthenticated"),
            // The backend answers 401 and the refresh path takes over
            Err(e) => warn!(error = %e, path = %request.path, "Failed to read access token"),
        }
    }
}

/// Ordered request stages.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn RequestStage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Arc<dyn RequestStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn push(&mut self, stage: Arc<dyn RequestStage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn run(&self, request: &mut ApiRequest) {
        for stage in &self.stages {
            stage.apply(request).await;
        }
    }
}
