//! Authentication module for credentials, session state and token refresh.
//!
//! This module provides:
//! - `CredentialStore`: async key-value persistence (memory, file, OS keychain)
//! - `SessionState`: observable signed-in/signed-out state and `check_auth`
//! - `RefreshCoordinator`: single-flight access token refresh
//! - `AuthService`: login, signup and logout flows

pub mod credentials;
pub mod refresh;
pub mod service;
pub mod session;
pub mod store;

pub use credentials::KeyringStore;
pub use refresh::RefreshCoordinator;
pub use service::AuthService;
pub use session::{check_auth, Session, SessionState};
pub use store::{CredentialStore, Credentials, FileStore, MemoryStore, StorageKey, StoreError};
