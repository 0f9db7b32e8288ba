//! Single-flight token refresh.
//!
//! At most one refresh exchange runs at a time. Callers arriving while one
//! is in flight are queued and all receive the outcome of that exchange.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{AuthError, CredentialStore};
use crate::models::TokenResponse;

type Waiter = oneshot::Sender<Result<String, AuthError>>;

enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

pub struct RefreshCoordinator {
    credentials: Arc<CredentialStore>,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self {
            credentials,
            state: Mutex::new(RefreshState::Idle),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock(), RefreshState::Refreshing { .. })
    }

    /// Number of callers queued behind the in-flight refresh
    pub fn pending(&self) -> usize {
        match &*self.lock() {
            RefreshState::Refreshing { waiters } => waiters.len(),
            RefreshState::Idle => 0,
        }
    }

    /// Obtain a fresh access token.
    ///
    /// The first caller runs `exchange` with the stored refresh token; later
    /// callers wait for its result. On success the store is updated before
    /// any caller is released. On failure the store is cleared, queued callers
    /// get [`AuthError::AuthenticationFailed`] and the leading caller gets the
    /// underlying error. If the store was cleared or replaced while the
    /// exchange ran, every caller gets [`AuthError::SessionEnded`] and the
    /// store is left alone.
    pub async fn refresh<F, Fut>(&self, exchange: F) -> Result<String, AuthError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TokenResponse, AuthError>>,
    {
        let queued = {
            let mut state = self.lock();
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    debug!(queued = waiters.len(), "Refresh in flight, queueing caller");
                    Some(rx)
                }
                RefreshState::Idle => {
                    *state = RefreshState::Refreshing {
                        waiters: Vec::new(),
                    };
                    None
                }
            }
        };

        if let Some(rx) = queued {
            return rx.await.unwrap_or(Err(AuthError::AuthenticationFailed));
        }

        let in_flight = InFlight {
            coordinator: self,
            settled: false,
        };

        let (generation, refresh_token) = self.credentials.versioned_refresh_token();
        let outcome = match refresh_token {
            Some(refresh_token) => {
                debug!("Exchanging refresh token");
                exchange(refresh_token).await
            }
            None => Err(AuthError::NoRefreshToken),
        };

        in_flight.settle(generation, outcome)
    }

    /// Return to idle, handing back the queued callers.
    fn finish(&self) -> Vec<Waiter> {
        match std::mem::replace(&mut *self.lock(), RefreshState::Idle) {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => Vec::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the coordinator to idle even if the leading future is dropped
/// before the exchange completes.
struct InFlight<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl InFlight<'_> {
    /// Apply the exchange outcome to the store, then release every caller.
    ///
    /// The store is written while the coordinator is still refreshing, so no
    /// new refresh can start against stale credentials; the state lock itself
    /// is not held during the write. A store that moved past `generation`
    /// (logout, or a new login) means the outcome is stale and is dropped.
    fn settle(
        mut self,
        generation: u64,
        outcome: Result<TokenResponse, AuthError>,
    ) -> Result<String, AuthError> {
        self.settled = true;
        let coordinator = self.coordinator;

        // A persistence failure still leaves a usable in-memory session
        let applied = match &outcome {
            Ok(tokens) => coordinator.credentials.set_tokens_if(
                generation,
                &tokens.access_token,
                &tokens.refresh_token,
                tokens.expires_in,
            ),
            Err(_) => coordinator.credentials.clear_if(generation),
        }
        .unwrap_or(true);

        let waiters = coordinator.finish();

        if !applied {
            info!(waiters = waiters.len(), "Session changed during refresh, discarding result");
            for waiter in waiters {
                let _ = waiter.send(Err(AuthError::SessionEnded));
            }
            return Err(AuthError::SessionEnded);
        }

        match outcome {
            Ok(tokens) => {
                info!(waiters = waiters.len(), expires_in = tokens.expires_in, "Token refreshed");
                for waiter in waiters {
                    let _ = waiter.send(Ok(tokens.access_token.clone()));
                }
                Ok(tokens.access_token)
            }
            Err(err) => {
                warn!(error = %err, waiters = waiters.len(), "Token refresh failed");
                for waiter in waiters {
                    let _ = waiter.send(Err(AuthError::AuthenticationFailed));
                }
                Err(err)
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Dropping the senders wakes every waiter with AuthenticationFailed
        let waiters = self.coordinator.finish();
        warn!(waiters = waiters.len(), "Refresh abandoned before completion");
    }
}
