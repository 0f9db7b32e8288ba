//! In-process mock of the CMS auth API, served on an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use inkstand_core::auth::{CredentialStore, Session, SessionConfig};
use inkstand_core::ApiClient;

pub const EMAIL: &str = "editor@example.com";
pub const PASSWORD: &str = "correct-horse";
pub const UNVERIFIED_EMAIL: &str = "unverified@example.com";
pub const TOTP_CODE: &str = "424242";
/// Logins for this account fail with a server error
pub const BROKEN_EMAIL: &str = "broken@example.com";
/// Logins for this account ask for the password to be confirmed
pub const CONFIRM_EMAIL: &str = "confirm@example.com";

#[derive(Default)]
pub struct MockState {
    pub token_calls: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub register_calls: AtomicU32,
    pub logout_calls: AtomicU32,
    pub csrf_calls: AtomicU32,
    pub me_calls: AtomicU32,
    pub content_calls: AtomicU32,

    issued: AtomicU32,
    /// Access token the protected routes accept
    pub valid_access: Mutex<Option<String>>,
    pub expires_in: AtomicU64,
    pub refresh_delay_ms: AtomicU64,
    pub refresh_fails: AtomicBool,
    pub require_totp: AtomicBool,
    pub content_always_unauthorized: AtomicBool,
    pub logout_fails: AtomicBool,

    pub login_bodies: Mutex<Vec<Value>>,
    pub xsrf_headers: Mutex<Vec<Option<String>>>,
}

impl MockState {
    pub fn calls(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> u32 {
        [
            &self.token_calls,
            &self.refresh_calls,
            &self.register_calls,
            &self.logout_calls,
            &self.csrf_calls,
            &self.me_calls,
            &self.content_calls,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    pub fn accept(&self, access_token: &str) {
        *self.valid_access.lock().expect("lock") = Some(access_token.to_string());
    }

    fn issue(&self) -> Value {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let access = format!("access-{n}");
        self.accept(&access);
        let expires_in = match self.expires_in.load(Ordering::SeqCst) {
            0 => 3600,
            secs => secs,
        };
        json!({
            "access_token": access,
            "refresh_token": format!("refresh-{n}"),
            "token_type": "bearer",
            "expires_in": expires_in,
        })
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let valid = self.valid_access.lock().expect("lock").clone();
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        matches!((valid, presented), (Some(v), Some(p)) if v == p)
    }
}

fn error(status: StatusCode, code: Option<&str>, message: &str) -> Response {
    let body = match code {
        Some(code) => json!({ "code": code, "message": message }),
        None => json!({ "message": message }),
    };
    (status, Json(body)).into_response()
}

async fn token(State(state): State<Arc<MockState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    state.login_bodies.lock().expect("lock").push(body.clone());

    let email = body.get("email").and_then(Value::as_str).unwrap_or_default();
    let password = body.get("password").and_then(Value::as_str).unwrap_or_default();

    if email == BROKEN_EMAIL {
        return error(StatusCode::INTERNAL_SERVER_ERROR, None, "Database unavailable");
    }
    if email == CONFIRM_EMAIL {
        return error(StatusCode::LOCKED, Some("PASSWORD_CONFIRMATION_REQUIRED"), "Confirm your password");
    }
    if email == UNVERIFIED_EMAIL {
        return error(StatusCode::CONFLICT, Some("EMAIL_NOT_VERIFIED"), "Email not verified");
    }
    if email != EMAIL || password != PASSWORD {
        return error(StatusCode::UNAUTHORIZED, None, "Invalid credentials");
    }
    if state.require_totp.load(Ordering::SeqCst) {
        match headers.get("x-totp-code").and_then(|v| v.to_str().ok()) {
            None => {
                return error(StatusCode::LOCKED, Some("TOTP_VERIFICATION_REQUIRED"), "Two-factor code required")
            }
            Some(code) if code != TOTP_CODE => {
                return error(StatusCode::FORBIDDEN, Some("INVALID_TOTP_CODE"), "Invalid two-factor code")
            }
            Some(_) => {}
        }
    }
    Json(state.issue()).into_response()
}

async fn refresh(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let presented = body.get("refresh_token").and_then(Value::as_str).unwrap_or_default();
    if state.refresh_fails.load(Ordering::SeqCst) || !presented.starts_with("refresh-") {
        return error(StatusCode::UNAUTHORIZED, None, "Refresh token revoked");
    }
    Json(state.issue()).into_response()
}

async fn register(State(state): State<Arc<MockState>>, Json(_body): Json<Value>) -> Response {
    state.register_calls.fetch_add(1, Ordering::SeqCst);
    Json(state.issue()).into_response()
}

async fn logout(State(state): State<Arc<MockState>>, Json(_body): Json<Value>) -> Response {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    if state.logout_fails.load(Ordering::SeqCst) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, None, "boom");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn csrf_cookie(State(state): State<Arc<MockState>>) -> Response {
    state.csrf_calls.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, "XSRF-TOKEN=csrf%3Dtoken; Path=/")],
    )
        .into_response()
}

async fn me(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.me_calls.fetch_add(1, Ordering::SeqCst);
    if !state.authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, None, "Unauthenticated");
    }
    Json(json!({ "id": 7, "email": EMAIL, "firstname": "Ed", "lastname": "Itor" })).into_response()
}

async fn content(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.content_calls.fetch_add(1, Ordering::SeqCst);
    let xsrf = headers
        .get("x-xsrf-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.xsrf_headers.lock().expect("lock").push(xsrf);

    if state.content_always_unauthorized.load(Ordering::SeqCst) || !state.authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, None, "Unauthenticated");
    }
    Json(json!({ "items": [{ "id": 1, "title": "Hello" }] })).into_response()
}

async fn plain() -> &'static str {
    "pong"
}

async fn teapot() -> Response {
    error(StatusCode::IM_A_TEAPOT, Some("TEAPOT"), "Short and stout")
}

pub struct MockCms {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockCms {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());

        let app = Router::new()
            .route("/api/auth/token", post(token))
            .route("/api/auth/token/refresh", post(refresh))
            .route("/api/auth/register", post(register))
            .route("/api/auth/logout", post(logout))
            .route("/api/auth/csrf-cookie", get(csrf_cookie))
            .route("/api/users/me", get(me))
            .route("/api/content", get(content).post(content))
            .route("/api/plain", get(plain))
            .route("/api/teapot", get(teapot))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    pub fn client(&self, store: Arc<CredentialStore>) -> ApiClient {
        ApiClient::new(&self.base_url(), store).expect("client")
    }

    pub fn session(&self, store: Arc<CredentialStore>, config: SessionConfig) -> Arc<Session> {
        Session::new(self.client(store), config)
    }
}
