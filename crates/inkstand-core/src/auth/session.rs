//! The session facade: the only part of the auth layer the rest of the
//! application talks to.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AuthError, CredentialStore, RefreshCoordinator, DEFAULT_EXPIRY_SKEW};
use crate::api::{routes, ApiClient, ApiError, ApiRequest, AuthFailure, AuthHandler, RetryDirective};
use crate::models::{LoginCredentials, RegisterRequest, TokenResponse, UserProfile};

/// Shortest delay before a proactive refresh fires.
pub const DEFAULT_MIN_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Path of the login view.
pub const DEFAULT_LOGIN_PATH: &str = "/login";

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Refresh this long before the access token expires
    pub refresh_skew: Duration,
    pub min_refresh_delay: Duration,
    pub login_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_skew: DEFAULT_EXPIRY_SKEW,
            min_refresh_delay: DEFAULT_MIN_REFRESH_DELAY,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
        }
    }
}

/// Observable session state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionState {
    pub user: Option<UserProfile>,
    pub is_authenticated: bool,
    pub is_refreshing: bool,
    pub requires_two_factor: bool,
}

/// Session lifecycle notifications, e.g. for tearing down presence channels.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LoggedIn(UserProfile),
    Refreshed,
    TwoFactorRequired,
    LoggedOut,
    /// The user must sign in again; `return_to` is the view to come back to
    LoginRequired { return_to: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "status", content = "user", rename_all = "snake_case")]
pub enum LoginOutcome {
    Authenticated(UserProfile),
    /// Call [`Session::verify_two_factor`] with the user's one-time code
    TwoFactorRequired,
}

struct RefreshTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct Session {
    api: ApiClient,
    credentials: Arc<CredentialStore>,
    coordinator: RefreshCoordinator,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    pending_login: Mutex<Option<LoginCredentials>>,
    timer: Mutex<Option<RefreshTimer>>,
    timer_generation: AtomicU64,
    location: Mutex<Option<String>>,
    this: Weak<Session>,
}

impl Session {
    /// Build the session and register it as `api`'s 401 handler.
    ///
    /// The session talks to the server through a copy of `api` that holds the
    /// handler; requests should be sent through [`Session::api`].
    pub fn new(api: ApiClient, config: SessionConfig) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Session>| {
            let handler: Weak<dyn AuthHandler> = this.clone();
            let api = api.with_auth_handler(handler);
            let credentials = api.credentials();

            let (state, _) = watch::channel(SessionState {
                is_authenticated: credentials.is_present(),
                ..SessionState::default()
            });
            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

            Self {
                coordinator: RefreshCoordinator::new(Arc::clone(&credentials)),
                api,
                credentials,
                config,
                state,
                events,
                pending_login: Mutex::new(None),
                timer: Mutex::new(None),
                timer_generation: AtomicU64::new(0),
                location: Mutex::new(None),
                this: this.clone(),
            }
        })
    }

    /// API client whose 401 responses are recovered by this session
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_present()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.state.borrow().user.clone()
    }

    pub fn requires_two_factor(&self) -> bool {
        self.state.borrow().requires_two_factor
    }

    /// Record the view the user is on, so a forced sign-in can return there.
    pub fn set_location(&self, path: impl Into<String>) {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = Some(path.into());
    }

    /// Headers authorizing a real-time channel subscription.
    pub fn channel_auth_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(bearer) = self.api.bearer_header()? {
            headers.insert(header::AUTHORIZATION, bearer);
        }
        Ok(headers)
    }

    /// Restore the session from stored credentials.
    ///
    /// Returns `None` without touching the network when nothing is stored.
    pub async fn init_auth(&self) -> Result<Option<UserProfile>, AuthError> {
        if !self.credentials.is_present() {
            debug!("No stored credentials, starting logged out");
            self.publish();
            return Ok(None);
        }

        if self.credentials.is_expired(self.config.refresh_skew) {
            info!("Stored access token is expired or about to expire, refreshing");
            self.refresh_token().await?;
        } else {
            self.schedule_refresh();
        }
        self.publish();

        let user = self.fetch_user().await?;
        info!(email = %user.email, "Session restored");
        Ok(Some(user))
    }

    pub async fn login(
        &self,
        credentials: LoginCredentials,
        totp_code: Option<&str>,
    ) -> Result<LoginOutcome, AuthError> {
        debug!(email = %credentials.email, with_code = totp_code.is_some(), "Requesting token");

        let err = match self.api.request_token(&credentials, totp_code).await {
            Ok(tokens) => {
                self.clear_pending_login();
                let user = self.establish(tokens).await?;
                return Ok(LoginOutcome::Authenticated(user));
            }
            Err(err) => err,
        };

        match err.auth_failure() {
            AuthFailure::RequiresTwoFactor => {
                info!("Login requires a second factor");
                *self.pending_login() = Some(credentials);
                self.state.send_modify(|s| s.requires_two_factor = true);
                self.emit(SessionEvent::TwoFactorRequired);
                Ok(LoginOutcome::TwoFactorRequired)
            }
            AuthFailure::InvalidTwoFactorCode => {
                // Keep the credentials so the user can try another code
                *self.pending_login() = Some(credentials);
                Err(AuthError::InvalidTwoFactorCode)
            }
            AuthFailure::RequiresLogin => {
                self.clear_pending_login();
                Err(AuthError::InvalidCredentials)
            }
            AuthFailure::EmailNotVerified => {
                self.clear_pending_login();
                Err(AuthError::EmailNotVerified)
            }
            _ => {
                warn!(error = %err, "Login failed");
                self.clear_pending_login();
                Err(AuthError::LoginFailed(err.user_message()))
            }
        }
    }

    /// Complete a login that stopped at the second-factor step, reusing the
    /// credentials from the first attempt.
    pub async fn verify_two_factor(&self, code: &str) -> Result<LoginOutcome, AuthError> {
        let credentials = self
            .pending_login()
            .clone()
            .ok_or(AuthError::NoPendingLogin)?;
        self.login(credentials, Some(code)).await
    }

    /// Abandon a login waiting for its second factor.
    pub fn cancel_two_factor(&self) {
        self.clear_pending_login();
    }

    pub async fn register(&self, registration: &RegisterRequest) -> Result<UserProfile, AuthError> {
        debug!(email = %registration.email, "Registering account");
        let tokens = self.api.register(registration).await.map_err(|err| {
            match err.auth_failure() {
                AuthFailure::Transient | AuthFailure::Other => {
                    AuthError::LoginFailed(err.user_message())
                }
                _ => AuthError::Api(err),
            }
        })?;
        self.establish(tokens).await
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent calls share one exchange. A failed refresh ends the session.
    pub async fn refresh_token(&self) -> Result<String, AuthError> {
        let led = AtomicBool::new(false);
        self.state.send_modify(|s| s.is_refreshing = true);

        let result = self
            .coordinator
            .refresh(|refresh_token| {
                led.store(true, Ordering::Relaxed);
                let api = self.api.clone();
                async move {
                    api.refresh_tokens(&refresh_token)
                        .await
                        .map_err(AuthError::from)
                }
            })
            .await;

        match result {
            Ok(access_token) => {
                if led.load(Ordering::Relaxed) {
                    self.schedule_refresh();
                    self.emit(SessionEvent::Refreshed);
                }
                self.publish();
                Ok(access_token)
            }
            // Logged out (or signed in again) meanwhile; nothing to undo
            Err(AuthError::SessionEnded) => {
                self.publish();
                Err(AuthError::SessionEnded)
            }
            Err(err) => {
                self.force_logout();
                Err(err)
            }
        }
    }

    /// Fetch the profile of the signed-in user and publish it.
    pub async fn fetch_user(&self) -> Result<UserProfile, AuthError> {
        let user = self.api.fetch_current_user().await?;
        self.state.send_modify(|s| s.user = Some(user.clone()));
        Ok(user)
    }

    /// Sign out: notify the server (best effort), drop all session state and
    /// ask for the login view.
    pub async fn logout(&self) {
        self.cancel_refresh_timer();

        if let Some(refresh_token) = self.credentials.refresh_token() {
            if let Err(e) = self.api.revoke(&refresh_token).await {
                debug!(error = %e, "Logout notification failed, ignoring");
            }
        }

        self.end_session();
        info!("Logged out");
        self.emit(SessionEvent::LoggedOut);
        self.request_login(None);
    }

    /// Recover from a 401 on `endpoint`.
    async fn recover(&self, endpoint: &str) -> Result<RetryDirective, AuthError> {
        if routes::is_token_endpoint(endpoint) {
            warn!(endpoint, "Token endpoint rejected the request, ending session");
            self.force_logout();
            return Ok(RetryDirective::abandon());
        }

        debug!(endpoint, in_flight = self.coordinator.is_refreshing(), "Unauthorized, refreshing token");
        self.refresh_token().await?;
        Ok(RetryDirective::retry())
    }

    async fn establish(&self, tokens: TokenResponse) -> Result<UserProfile, AuthError> {
        // Storage failures are logged by the store; the in-memory session still works
        let _ = self
            .credentials
            .set_tokens(&tokens.access_token, &tokens.refresh_token, tokens.expires_in);
        self.schedule_refresh();
        self.state.send_modify(|s| s.requires_two_factor = false);
        self.publish();

        let user = self.fetch_user().await?;
        info!(email = %user.email, "Signed in");
        self.emit(SessionEvent::LoggedIn(user.clone()));
        Ok(user)
    }

    /// End the session after an unrecoverable auth failure.
    fn force_logout(&self) {
        if self.end_session() {
            warn!("Session ended, sign-in required");
            self.emit(SessionEvent::LoggedOut);
            self.request_login(self.location());
        }
    }

    /// Drop tokens, user and timers. Returns whether a session was active.
    fn end_session(&self) -> bool {
        self.cancel_refresh_timer();
        self.pending_login().take();
        let _ = self.credentials.clear();

        let is_refreshing = self.coordinator.is_refreshing();
        let mut was_active = false;
        self.state.send_modify(|s| {
            was_active = s.is_authenticated || s.user.is_some();
            *s = SessionState {
                is_refreshing,
                ..SessionState::default()
            };
        });
        was_active
    }

    fn request_login(&self, return_to: Option<String>) {
        let location = self.location();
        let at_login = location
            .as_deref()
            .map(|path| path.split(['?', '#']).next() == Some(self.config.login_path.as_str()))
            .unwrap_or(false);
        if !at_login {
            self.emit(SessionEvent::LoginRequired { return_to });
        }
    }

    fn publish(&self) {
        let is_authenticated = self.credentials.is_present();
        let is_refreshing = self.coordinator.is_refreshing();
        self.state.send_modify(|s| {
            s.is_authenticated = is_authenticated;
            s.is_refreshing = is_refreshing;
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Time until the proactive refresh should fire
    fn refresh_delay(&self) -> Duration {
        self.credentials
            .time_until_expiry()
            .saturating_sub(self.config.refresh_skew)
            .max(self.config.min_refresh_delay)
    }

    /// Replace the proactive refresh timer with one matching the current token.
    fn schedule_refresh(&self) {
        let delay = self.refresh_delay();
        let generation = self.timer_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let this = self.this.clone();

        // Held while spawning so the task cannot look for its slot too early
        let mut slot = self.timer();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = this.upgrade() else {
                return;
            };
            session.release_timer(generation);
            debug!("Proactive token refresh");
            if let Err(e) = session.refresh_token().await {
                warn!(error = %e, "Proactive token refresh failed");
            }
        });

        if let Some(previous) = slot.replace(RefreshTimer { generation, handle }) {
            previous.handle.abort();
        }
        debug!(delay_ms = delay.as_millis() as u64, "Scheduled proactive token refresh");
    }

    /// Detach a firing timer from the slot so its refresh can schedule the next one.
    fn release_timer(&self, generation: u64) {
        let mut slot = self.timer();
        if slot.as_ref().map(|t| t.generation) == Some(generation) {
            slot.take();
        }
    }

    fn cancel_refresh_timer(&self) {
        if let Some(timer) = self.timer().take() {
            timer.handle.abort();
            debug!("Cancelled proactive token refresh");
        }
    }

    fn clear_pending_login(&self) {
        self.pending_login().take();
        self.state.send_modify(|s| s.requires_two_factor = false);
    }

    fn location(&self) -> Option<String> {
        self.location.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn pending_login(&self) -> MutexGuard<'_, Option<LoginCredentials>> {
        self.pending_login.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timer(&self) -> MutexGuard<'_, Option<RefreshTimer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuthHandler for Session {
    fn handle_unauthorized<'a>(
        &'a self,
        endpoint: &'a str,
        _request: &'a ApiRequest,
    ) -> BoxFuture<'a, Result<RetryDirective, AuthError>> {
        Box::pin(self.recover(endpoint))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_refresh_timer();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("api", &self.api)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(store: Arc<CredentialStore>, config: SessionConfig) -> Arc<Session> {
        // Nothing listens here; these tests never reach the network
        let api = ApiClient::new("http://127.0.0.1:9", store).expect("client");
        Session::new(api, config)
    }

    #[test]
    fn test_initial_state_follows_store() {
        let store = Arc::new(CredentialStore::in_memory());
        let session = session_with(Arc::clone(&store), SessionConfig::default());
        assert!(!session.state().is_authenticated);

        store.set_tokens("a", "r", 3600).expect("set tokens");
        let restored = session_with(store, SessionConfig::default());
        assert!(restored.state().is_authenticated);
        assert!(restored.is_authenticated());
    }

    #[test]
    fn test_refresh_delay_respects_skew_and_minimum() {
        let store = Arc::new(CredentialStore::in_memory());
        let config = SessionConfig {
            refresh_skew: Duration::from_secs(60),
            min_refresh_delay: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        let session = session_with(Arc::clone(&store), config);

        store.set_tokens("a", "r", 3600).expect("set tokens");
        let delay = session.refresh_delay();
        assert!(delay <= Duration::from_secs(3540));
        assert!(delay > Duration::from_secs(3530));

        store.set_tokens("a", "r", 30).expect("set tokens");
        assert_eq!(session.refresh_delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_init_without_tokens_stays_logged_out() {
        let session = session_with(Arc::new(CredentialStore::in_memory()), SessionConfig::default());
        let user = session.init_auth().await.expect("init");
        assert!(user.is_none());
        assert_eq!(session.state(), SessionState::default());
    }

    #[tokio::test]
    async fn test_verify_without_pending_login() {
        let session = session_with(Arc::new(CredentialStore::in_memory()), SessionConfig::default());
        let result = session.verify_two_factor("123456").await;
        assert!(matches!(result, Err(AuthError::NoPendingLogin)));
    }

    #[tokio::test]
    async fn test_token_endpoint_401_is_not_recoverable() {
        let store = Arc::new(CredentialStore::in_memory());
        store.set_tokens("a", "r", 3600).expect("set tokens");
        let session = session_with(Arc::clone(&store), SessionConfig::default());
        session.set_location("/content/entries?page=2");
        let mut events = session.subscribe();

        let directive = session.recover(routes::TOKEN_REFRESH).await.expect("directive");

        assert!(!directive.retry);
        assert!(!store.is_present());
        assert_eq!(events.recv().await.expect("event"), SessionEvent::LoggedOut);
        assert_eq!(
            events.recv().await.expect("event"),
            SessionEvent::LoginRequired {
                return_to: Some("/content/entries?page=2".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_no_redirect_when_already_on_login_view() {
        let store = Arc::new(CredentialStore::in_memory());
        store.set_tokens("a", "r", 3600).expect("set tokens");
        let session = session_with(Arc::clone(&store), SessionConfig::default());
        session.set_location("/login?next=%2F");
        let mut events = session.subscribe();

        session.force_logout();

        assert_eq!(events.recv().await.expect("event"), SessionEvent::LoggedOut);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timer_is_replaced_not_duplicated() {
        let store = Arc::new(CredentialStore::in_memory());
        store.set_tokens("a", "r", 3600).expect("set tokens");
        let session = session_with(store, SessionConfig::default());

        session.schedule_refresh();
        let first = session.timer().as_ref().map(|t| t.generation);
        session.schedule_refresh();
        let second = session.timer().as_ref().map(|t| t.generation);

        assert!(first.is_some());
        assert_ne!(first, second);

        session.cancel_refresh_timer();
        assert!(session.timer().is_none());
    }
}
