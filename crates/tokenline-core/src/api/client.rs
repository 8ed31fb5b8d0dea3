//! API client for the application's REST backend.
//!
//! Every request runs through the request [`Pipeline`] (bearer credentials),
//! then the transport. A 401 on a request that has not been replayed yet is
//! handed to the [`RefreshCoordinator`]; the request is replayed once with the
//! new token. Any other failure is mapped to [`ApiError`] at this boundary.

use std::sync::Arc;

use anyhow::Result;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::pipeline::{ApiRequest, BearerAuth, Pipeline, RequestStage};
use super::ApiError;
use crate::auth::{CredentialStore, Credentials, RefreshCoordinator, SessionState};
use crate::config::Config;

/// Authenticated API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling,
/// and all clones share one refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    pipeline: Pipeline,
    credentials: Credentials,
    session: SessionState,
    refresh: RefreshCoordinator,
}

impl ApiClient {
    /// Create a client with the default pipeline (bearer credentials only)
    pub fn new(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        session: SessionState,
    ) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout()).build()?;
        let credentials = Credentials::new(store);
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let pipeline =
            Pipeline::new().with_stage(Arc::new(BearerAuth::new(credentials.clone())));

        // Same pool, but refresh calls bypass the pipeline entirely
        let refresh =
            RefreshCoordinator::new(http.clone(), &base_url, credentials.clone(), session.clone());

        Ok(Self {
            http,
            base_url,
            pipeline,
            credentials,
            session,
            refresh,
        })
    }

    /// Append a stage that runs after the bearer stage
    pub fn with_stage(mut self, stage: Arc<dyn RequestStage>) -> Self {
        self.pipeline.push(stage);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Send a request through the pipeline and return the successful response.
    pub async fn send(&self, mut request: ApiRequest) -> Result<Response, ApiError> {
        self.pipeline.run(&mut request).await;

        let response = self.dispatch(&request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::check_response(response).await;
        }

        // Replays and credential endpoints end here: a 401 from login means
        // bad credentials, and a second 401 must not loop.
        if request.retried || request.is_auth_exempt() {
            return Self::check_response(response).await;
        }

        debug!(method = %request.method, path = %request.path, "Unauthorized, recovering token");
        request.retried = true;
        let token = self
            .refresh
            .recover(request.sent_token.as_deref())
            .await?;

        request.set_bearer(&token);
        debug!(path = %request.path, "Replaying request with refreshed token");
        let response = self.dispatch(&request).await?;
        Self::check_response(response).await
    }

    /// Send and decode a JSON body. Empty bodies decode as `null`.
    pub async fn request_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(ApiError::from_transport)?;
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| ApiError::invalid_data(Some(status), e))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request_json(ApiRequest::get(path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = Self::encode(body)?;
        self.request_json(ApiRequest::post(path).with_body(body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = Self::encode(body)?;
        self.request_json(ApiRequest::put(path).with_body(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request_json(ApiRequest::delete(path)).await
    }

    fn encode<B: Serialize>(body: &B) -> Result<Value, ApiError> {
        serde_json::to_value(body).map_err(|e| ApiError::invalid_data(None, e))
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<Response, ApiError> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.url(&request.path))
            .headers(request.headers.clone());
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(|e| {
            warn!(method = %request.method, path = %request.path, error = %e, "Request failed before a response arrived");
            ApiError::from_transport(e)
        })
    }

    /// Check if response is successful, returning a typed error with the body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "Request rejected");
            Err(ApiError::from_response(status, &body))
        }
    }
}
