//! Single-flight access token refresh.
//!
//! Every request that comes back 401 asks the [`RefreshCoordinator`] for a new
//! access token. The first one to arrive while the coordinator is idle leads:
//! it moves the state to `Refreshing` and issues the one refresh call. Anyone
//! arriving while a refresh is outstanding queues a waiter instead. When the
//! refresh settles, the queue is drained in arrival order with the same
//! outcome, so a burst of failed requests either all succeed with the new
//! token or all fail with the same Unauthorized error.
//!
//! The state check and the transition happen under one mutex with no `.await`
//! in between, which is what keeps it at most one refresh in flight. Every
//! settled refresh bumps a generation counter; a caller that saw an older
//! generation before reading the store takes the settled outcome instead of
//! starting another refresh.

use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::session::SessionState;
use super::store::Credentials;
use crate::api::error::{create_api_error, ApiError, Cause};
use crate::models::{RefreshRequest, TokenPair};

/// Refresh endpoint, relative to the base URL
pub const REFRESH_PATH: &str = "/auth/refresh";

type Outcome = Result<String, ApiError>;

enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<oneshot::Sender<Outcome>> },
}

struct Flight {
    state: RefreshState,
    /// Incremented each time a refresh settles
    generation: u64,
    /// Outcome of the most recent refresh
    last: Option<Outcome>,
}

/// What a caller must do after consulting the state
enum Ticket {
    /// A refresh completed after the request was sent; replay with this token
    Ready(String),
    /// A refresh settled while this caller was reading the store
    Settled(Outcome),
    /// Wait for the in-flight refresh
    Wait(oneshot::Receiver<Outcome>),
    /// Perform the refresh
    Lead,
}

struct Inner {
    /// Bare transport: no request stages, so no recursive credential attachment
    http: Client,
    refresh_url: String,
    credentials: Credentials,
    session: SessionState,
    flight: Mutex<Flight>,
}

/// Clone is cheap and all clones share one state machine.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        http: Client,
        base_url: &str,
        credentials: Credentials,
        session: SessionState,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                refresh_url: format!("{}{}", base_url.trim_end_matches('/'), REFRESH_PATH),
                credentials,
                session,
                flight: Mutex::new(Flight {
                    state: RefreshState::Idle,
                    generation: 0,
                    last: None,
                }),
            }),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.inner.flight.lock().state, RefreshState::Refreshing { .. })
    }

    /// Number of requests queued behind the in-flight refresh
    pub fn queued(&self) -> usize {
        match &self.inner.flight.lock().state {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { waiters } => waiters.len(),
        }
    }

    /// Obtain a fresh access token after a request sent with `stale_token`
    /// was rejected with 401.
    ///
    /// On failure the credential store has been cleared, the session signed
    /// out, and the error is always `ApiError::Unauthorized`.
    pub async fn recover(&self, stale_token: Option<&str>) -> Outcome {
        let seen = self.inner.flight.lock().generation;
        let current = self.inner.credentials.access_token().await.ok().flatten();

        let ticket = {
            let mut flight = self.inner.flight.lock();
            let moved = flight.generation != seen;
            let last = flight.last.clone();
            match &mut flight.state {
                RefreshState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    debug!(queued = waiters.len(), "Refresh in flight, queueing request");
                    Ticket::Wait(rx)
                }
                RefreshState::Idle => match (moved, last, current) {
                    // The store read may predate the settle; trust the outcome
                    (true, Some(Ok(token)), _) if Some(token.as_str()) != stale_token => {
                        Ticket::Ready(token)
                    }
                    (true, Some(Err(e)), _) => Ticket::Settled(Err(e)),
                    (_, _, Some(token)) if Some(token.as_str()) != stale_token => {
                        Ticket::Ready(token)
                    }
                    _ => {
                        flight.state = RefreshState::Refreshing {
                            waiters: Vec::new(),
                        };
                        Ticket::Lead
                    }
                },
            }
        };

        match ticket {
            Ticket::Ready(token) => {
                debug!("Token already rotated since request was sent, replaying");
                Ok(token)
            }
            Ticket::Settled(outcome) => {
                debug!("Refresh settled while reading credentials, sharing its outcome");
                outcome
            }
            Ticket::Wait(rx) => rx
                .await
                .unwrap_or_else(|_| Err(ApiError::unauthorized("Token refresh was abandoned"))),
            Ticket::Lead => self.lead().await,
        }
    }

    async fn lead(&self) -> Outcome {
        // Spawned so that dropping the triggering request does not cancel a
        // refresh other requests are queued on.
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run().await });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Refresh task aborted");
                let failure = ApiError::unauthorized("");
                self.inner.settle(Err(failure.clone()));
                Err(failure)
            }
        }
    }
}

impl Inner {
    async fn run(&self) -> Outcome {
        info!("Access token rejected, refreshing");

        match self.request_tokens().await {
            Ok(tokens) => {
                // Persist before anyone replays, so later requests read the new pair
                if let Err(e) = self.credentials.save_tokens(&tokens).await {
                    warn!(error = %e, "Failed to persist refreshed tokens");
                }
                info!("Token refresh succeeded");
                self.settle(Ok(tokens.access_token))
            }
            Err(cause) => {
                warn!(error = %cause, "Token refresh failed, signing out");
                if let Err(e) = self.credentials.clear().await {
                    error!(error = %e, "Failed to clear credentials after refresh failure");
                }
                self.session.sign_out();
                let cause: Cause = Arc::new(cause);
                self.settle(Err(create_api_error(401, "", None, Some(cause))))
            }
        }
    }

    async fn request_tokens(&self) -> Result<TokenPair, ApiError> {
        let refresh_token = match self.credentials.refresh_token().await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(ApiError::unauthorized("No refresh token available")),
            Err(e) => {
                warn!(error = %e, "Failed to read refresh token");
                return Err(ApiError::unauthorized("No refresh token available"));
            }
        };

        let response = self
            .http
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_response(status, &body));
        }

        response.json().await.map_err(ApiError::from_transport)
    }

    /// Return to `Idle` and hand `outcome` to every queued waiter in arrival order.
    fn settle(&self, outcome: Outcome) -> Outcome {
        let previous = {
            let mut flight = self.flight.lock();
            flight.generation += 1;
            flight.last = Some(outcome.clone());
            std::mem::replace(&mut flight.state, RefreshState::Idle)
        };
        if let RefreshState::Refreshing { waiters } = previous {
            debug!(released = waiters.len(), ok = outcome.is_ok(), "Releasing queued requests");
            for waiter in waiters {
                // A dropped receiver is a cancelled caller
                let _ = waiter.send(outcome.clone());
            }
        }
        outcome
    }
}
