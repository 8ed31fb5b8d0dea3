use tracing::{error, info, warn};

use super::session::check_auth;
use crate::api::{create_api_error, ApiClient, ApiError, ApiRequest};
use crate::cache::QueryCache;
use crate::models::{AuthResponse, LoginRequest, SignupRequest, User};

const LOGIN_PATH: &str = "/auth/login";
const SIGNUP_PATH: &str = "/auth/signup";
const LOGOUT_PATH: &str = "/auth/logout";

/// Login, signup and logout flows on top of an [`ApiClient`].
///
/// Successful flows persist credentials and update the shared session; the
/// UI observes the session and routes accordingly.
#[derive(Clone)]
pub struct AuthService {
    api: ApiClient,
    cache: Option<QueryCache>,
}

impl AuthService {
    pub fn new(api: ApiClient) -> Self {
        Self { api, cache: None }
    }

    /// Clear this cache on logout
    pub fn with_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Resolve the startup session from stored credentials
    pub async fn restore(&self) -> bool {
        check_auth(self.api.credentials(), self.api.session()).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, ApiError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(create_api_error(400, "Email and password required", None, None));
        }

        let body = LoginRequest {
            email: email.trim(),
            password,
        };
        match self.api.post::<AuthResponse, _>(LOGIN_PATH, &body).await {
            Ok(auth) => Ok(self.establish(auth).await),
            Err(e) => {
                error!(error = %e, "Login failed");
                Err(e)
            }
        }
    }

    pub async fn signup(&self, email: &str, password: &str, name: Option<&str>) -> Result<User, ApiError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(create_api_error(400, "Email and password required", None, None));
        }

        let body = SignupRequest {
            email: email.trim(),
            password,
            name: name.map(str::trim).filter(|n| !n.is_empty()),
        };
        match self.api.post::<AuthResponse, _>(SIGNUP_PATH, &body).await {
            Ok(auth) => Ok(self.establish(auth).await),
            Err(e) => {
                error!(error = %e, "Signup failed");
                Err(e)
            }
        }
    }

    /// Sign out locally. The server call is best effort; local state is
    /// always cleared.
    pub async fn logout(&self) {
        if let Err(e) = self.api.send(ApiRequest::post(LOGOUT_PATH)).await {
            warn!(error = %e, "Server logout failed, clearing local session anyway");
        }

        if let Err(e) = self.api.credentials().clear().await {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        if let Some(ref cache) = self.cache {
            cache.clear();
        }
        self.api.session().sign_out();
        info!("Logged out");
    }

    async fn establish(&self, auth: AuthResponse) -> User {
        let tokens = auth.tokens();
        if let Err(e) = self.api.credentials().save_login(&tokens, &auth.user).await {
            warn!(error = %e, "Failed to store credentials");
        }
        self.api.session().sign_in(auth.user.clone());
        info!(user_id = %auth.user.id, "Authenticated");
        auth.user
    }
}
