//! Data models shared by the client, the credential store and the session.
//!
//! - `User`: the signed-in account
//! - `TokenPair`: access/refresh credentials
//! - Request/response bodies for the `/auth/*` endpoints

pub mod auth;
pub mod user;

pub use auth::{AuthResponse, LoginRequest, RefreshRequest, SignupRequest, TokenPair};
pub use user::User;
