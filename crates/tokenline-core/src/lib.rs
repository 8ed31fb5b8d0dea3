//! tokenline core - the data layer of a mobile client.
//!
//! - `api`: authenticated `ApiClient`, request pipeline, typed `ApiError`
//! - `auth`: credential store, observable session, single-flight token
//!   refresh, login/signup/logout
//! - `cache`: TTL query cache with transient retry
//! - `config`: base URL, timeout, retries, logging toggle
//! - `models`: wire and domain types

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;

pub use api::{create_api_error, format_error_message, ApiClient, ApiError, ApiRequest, ErrorKind};
pub use auth::{
    check_auth, AuthService, CredentialStore, Credentials, FileStore, KeyringStore, MemoryStore,
    RefreshCoordinator, Session, SessionState, StorageKey,
};
pub use cache::{QueryCache, RetryPolicy};
pub use config::Config;
pub use models::{TokenPair, User};
