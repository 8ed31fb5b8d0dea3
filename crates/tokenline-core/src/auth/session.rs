use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[cfg(feature = "ts")]
use ts_rs::TS;

use super::store::Credentials;
use crate::models::User;

/// Snapshot of who is signed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// True until the startup auth check has resolved
    pub is_loading: bool,
    pub is_authenticated: bool,
    pub user: Option<User>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            is_loading: true,
            is_authenticated: false,
            user: None,
        }
    }
}

/// Shared, observable session state.
///
/// Clone is cheap and every clone points at the same state. Views call
/// [`SessionState::subscribe`] and react to changes; nothing in the client
/// navigates imperatively.
#[derive(Clone)]
pub struct SessionState {
    tx: watch::Sender<Session>,
}

impl SessionState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Session::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().is_authenticated
    }

    pub fn user(&self) -> Option<User> {
        self.tx.borrow().user.clone()
    }

    /// Lowering the flag also drops the user. Prefer [`sign_in`](Self::sign_in)
    /// and [`sign_out`](Self::sign_out), which change both fields in one update.
    pub fn set_is_authenticated(&self, value: bool) {
        self.tx.send_modify(|s| {
            s.is_authenticated = value;
            if !value {
                s.user = None;
            }
        });
    }

    /// Replace the user of an authenticated session. A signed-out session
    /// never carries a user, so `Some` is ignored there.
    pub fn set_user(&self, user: Option<User>) {
        self.tx.send_if_modified(|s| {
            if user.is_some() && !s.is_authenticated {
                debug!("Ignoring user update on a signed-out session");
                return false;
            }
            s.user = user;
            true
        });
    }

    /// Authenticated with `user`, in a single update
    pub fn sign_in(&self, user: User) {
        info!(user_id = %user.id, "Session signed in");
        self.tx.send_replace(Session {
            is_loading: false,
            is_authenticated: true,
            user: Some(user),
        });
    }

    /// Unauthenticated with no user, in a single update
    pub fn sign_out(&self) {
        info!("Session signed out");
        self.tx.send_replace(Session {
            is_loading: false,
            is_authenticated: false,
            user: None,
        });
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the startup session from persisted credentials.
///
/// Reads the logged-in flag, cached user and access token concurrently. The
/// session is authenticated only when all three are present; any read failure
/// counts as signed out. Never fails.
pub async fn check_auth(credentials: &Credentials, session: &SessionState) -> bool {
    let (logged_in, user, token) = futures::join!(
        credentials.is_logged_in(),
        credentials.user(),
        credentials.access_token(),
    );

    match (logged_in, user, token) {
        (Ok(true), Ok(Some(user)), Ok(Some(_token))) => {
            debug!("Restored session from credential store");
            session.sign_in(user);
            true
        }
        (logged_in, user, token) => {
            for e in [logged_in.err(), user.err(), token.err()].into_iter().flatten() {
                warn!(error = %e, "Credential read failed during auth check");
            }
            session.sign_out();
            false
        }
    }
}
