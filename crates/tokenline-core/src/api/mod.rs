//! REST API client module.
//!
//! This module provides the `ApiClient` for talking to the backend, the
//! request pipeline that attaches bearer credentials, and the typed
//! `ApiError` taxonomy every failure is mapped to.
//!
//! Expired access tokens are discovered reactively: a 401 triggers a
//! single shared refresh (see `auth::refresh`) and one replay.

pub mod client;
pub mod error;
pub mod pipeline;

pub use client::ApiClient;
pub use error::{create_api_error, format_error_message, ApiError, ErrorDetail, ErrorKind, ValidationErrors};
pub use pipeline::{ApiRequest, BearerAuth, Pipeline, RequestStage};
