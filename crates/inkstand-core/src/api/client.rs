//! HTTP transport for the CMS API.
//!
//! `ApiClient` attaches the bearer token and anti-forgery header to every
//! request, classifies responses, and hands 401s to the registered
//! [`AuthHandler`] so an expired token can be refreshed and the request
//! retried once.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{routes, ApiError};
use crate::auth::{AuthError, CredentialStore};
use crate::models::{LoginCredentials, RefreshRequest, RegisterRequest, TokenResponse, UserProfile};

/// HTTP request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// A request the transport can send, and re-send after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, or an absolute URL
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Applied after the default headers, so they win on conflict
    pub headers: HeaderMap,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, ApiError> {
        self.headers
            .insert(HeaderName::from_bytes(name.as_bytes())?, HeaderValue::from_str(value)?);
        Ok(self)
    }

    /// GET, HEAD and OPTIONS do not need the anti-forgery cookie.
    fn is_state_changing(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

/// Successful response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Json(serde_json::Value),
    Text(String),
    Empty,
}

impl ApiResponse {
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        match self {
            ApiResponse::Json(value) => serde_json::from_value(value)
                .map_err(|e| ApiError::InvalidResponse(format!("Unexpected JSON shape: {}", e))),
            ApiResponse::Text(_) => Err(ApiError::InvalidResponse(
                "Expected a JSON response but got text".to_string(),
            )),
            ApiResponse::Empty => Err(ApiError::InvalidResponse(
                "Expected a JSON response but got an empty body".to_string(),
            )),
        }
    }
}

/// Whether the transport should re-send a request that failed with 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryDirective {
    pub retry: bool,
}

impl RetryDirective {
    pub fn retry() -> Self {
        Self { retry: true }
    }

    pub fn abandon() -> Self {
        Self { retry: false }
    }
}

/// Recovery hook for requests rejected with 401.
///
/// Implemented by the session layer and injected into the transport.
pub trait AuthHandler: Send + Sync {
    fn handle_unauthorized<'a>(
        &'a self,
        endpoint: &'a str,
        request: &'a ApiRequest,
    ) -> BoxFuture<'a, Result<RetryDirective, AuthError>>;
}

/// API client for the CMS.
/// Clone is cheap - reqwest::Client and the cookie jar are shared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    cookies: Arc<Jar>,
    credentials: Arc<CredentialStore>,
    csrf: Arc<OnceCell<()>>,
    auth_handler: Option<Weak<dyn AuthHandler>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("has_token", &self.credentials.is_present())
            .field("has_auth_handler", &self.auth_handler.is_some())
            .finish()
    }
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, credentials: Arc<CredentialStore>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, credentials, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        base_url: &str,
        credentials: Arc<CredentialStore>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        let cookies = Arc::new(Jar::default());
        let client = Client::builder()
            .timeout(timeout)
            .cookie_provider(Arc::clone(&cookies))
            .build()?;

        debug!(base_url = %base_url, "Creating API client");

        Ok(Self {
            client,
            base_url,
            cookies,
            credentials,
            csrf: Arc::new(OnceCell::new()),
            auth_handler: None,
        })
    }

    /// Create a client sharing this one's connection pool, cookies and
    /// credentials, with `handler` consulted on 401 responses.
    pub fn with_auth_handler(&self, handler: Weak<dyn AuthHandler>) -> Self {
        Self {
            auth_handler: Some(handler),
            ..self.clone()
        }
    }

    pub fn credentials(&self) -> Arc<CredentialStore> {
        Arc::clone(&self.credentials)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve an endpoint against the base URL; absolute URLs pass through.
    pub fn build_url(&self, endpoint: &str) -> Result<Url, ApiError> {
        let raw = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.as_str().trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            )
        };
        Url::parse(&raw).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", raw, e)))
    }

    /// Send a request, recovering once from a 401 through the auth handler.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let err = match self.dispatch(request).await {
            Err(err) if err.is_unauthorized() => err,
            other => return other,
        };

        // Another host's 401 says nothing about our tokens
        if !self.is_own_origin(&self.build_url(&request.endpoint)?) {
            return Err(err);
        }
        let Some(handler) = self.auth_handler.as_ref().and_then(Weak::upgrade) else {
            return Err(err);
        };

        match handler.handle_unauthorized(&request.endpoint, request).await {
            Ok(directive) if directive.retry => {
                debug!(endpoint = %request.endpoint, "Retrying request after token refresh");
                // Headers are rebuilt, picking up the refreshed token
                self.dispatch(request).await
            }
            Ok(_) => Err(err),
            Err(handler_err) => {
                warn!(endpoint = %request.endpoint, error = %handler_err, "Could not recover from 401");
                Err(err)
            }
        }
    }

    /// Send a request once, without 401 recovery.
    pub async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.build_url(&request.endpoint)?;

        if request.is_state_changing() {
            self.ensure_csrf_cookie().await?;
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url.clone())
            .headers(self.default_headers(&url)?);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        builder = builder.headers(request.headers.clone());

        let response = builder.send().await?;
        debug!(method = %request.method, endpoint = %request.endpoint, status = %response.status(), "API response");
        Self::read_response(response).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.send(&ApiRequest::get(endpoint)).await?.into_json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(&ApiRequest::post(endpoint).json(body)?).await?.into_json()
    }

    // ===== Auth Endpoints =====

    /// Exchange email and password (plus an optional one-time code) for tokens
    pub async fn request_token(
        &self,
        credentials: &LoginCredentials,
        totp_code: Option<&str>,
    ) -> Result<TokenResponse, ApiError> {
        let mut request = ApiRequest::post(routes::TOKEN).json(credentials)?;
        if let Some(code) = totp_code {
            request = request.header(routes::TOTP_HEADER, code)?;
        }
        self.dispatch(&request).await?.into_json()
    }

    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        let request = ApiRequest::post(routes::TOKEN_REFRESH).json(&RefreshRequest { refresh_token })?;
        self.dispatch(&request).await?.into_json()
    }

    pub async fn register(&self, registration: &RegisterRequest) -> Result<TokenResponse, ApiError> {
        let request = ApiRequest::post(routes::REGISTER).json(registration)?;
        self.dispatch(&request).await?.into_json()
    }

    /// Tell the server to revoke a refresh token
    pub async fn revoke(&self, refresh_token: &str) -> Result<(), ApiError> {
        let request = ApiRequest::post(routes::LOGOUT).json(&RefreshRequest { refresh_token })?;
        self.dispatch(&request).await?;
        Ok(())
    }

    pub async fn fetch_current_user(&self) -> Result<UserProfile, ApiError> {
        self.get_json(routes::CURRENT_USER).await
    }

    /// Bearer header for the current access token, if any
    pub fn bearer_header(&self) -> Result<Option<HeaderValue>, ApiError> {
        match self.credentials.access_token() {
            Some(token) => Ok(Some(HeaderValue::from_str(&format!("Bearer {}", token))?)),
            None => Ok(None),
        }
    }

    /// Fetch the anti-forgery cookie once per client. Failed attempts are
    /// not cached, so the next state-changing request tries again.
    async fn ensure_csrf_cookie(&self) -> Result<(), ApiError> {
        self.csrf
            .get_or_try_init(|| async {
                let url = self.build_url(routes::CSRF_COOKIE)?;
                let response = self
                    .client
                    .get(url)
                    .header(header::ACCEPT, "application/json")
                    .send()
                    .await?;
                Self::check_response(response).await?;
                debug!("Anti-forgery cookie established");
                Ok::<(), ApiError>(())
            })
            .await?;
        Ok(())
    }

    /// Credentials only go to the API's own origin.
    fn is_own_origin(&self, url: &Url) -> bool {
        url.origin() == self.base_url.origin()
    }

    fn default_headers(&self, url: &Url) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        if !self.is_own_origin(url) {
            return Ok(headers);
        }
        if let Some(bearer) = self.bearer_header()? {
            headers.insert(header::AUTHORIZATION, bearer);
        }
        if let Some(token) = self.xsrf_token(url) {
            headers.insert(
                HeaderName::from_static(routes::XSRF_HEADER),
                HeaderValue::from_str(&token)?,
            );
        }
        Ok(headers)
    }

    fn xsrf_token(&self, url: &Url) -> Option<String> {
        let cookies = self.cookies.cookies(url)?;
        let cookies = cookies.to_str().ok()?;
        find_cookie(cookies, routes::XSRF_COOKIE).map(decode_cookie_value)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn read_response(response: reqwest::Response) -> Result<ApiResponse, ApiError> {
        let response = Self::check_response(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(ApiResponse::Empty);
        }

        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);

        let text = response.text().await?;
        if text.trim().is_empty() {
            Ok(ApiResponse::Empty)
        } else if is_json {
            serde_json::from_str(&text)
                .map(ApiResponse::Json)
                .map_err(|e| ApiError::InvalidResponse(format!("Malformed JSON body: {}", e)))
        } else {
            Ok(ApiResponse::Text(text))
        }
    }
}

/// Find a cookie value in a `Cookie` header string (`a=1; b=2`).
fn find_cookie<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Cookie values are URL-encoded by the server; undecodable values pass through.
fn decode_cookie_value(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(base, Arc::new(CredentialStore::in_memory())).expect("client")
    }

    #[test]
    fn test_build_url() {
        let api = client("https://cms.example.com/api/");
        assert_eq!(
            api.build_url("/users/me").expect("url").as_str(),
            "https://cms.example.com/api/users/me"
        );
        assert_eq!(
            api.build_url("auth/token").expect("url").as_str(),
            "https://cms.example.com/api/auth/token"
        );
        assert_eq!(
            api.build_url("https://assets.example.com/x").expect("url").as_str(),
            "https://assets.example.com/x"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = ApiClient::new("not a url", Arc::new(CredentialStore::in_memory()));
        assert!(matches!(result, Err(ApiError::InvalidUrl(_))));
    }

    #[test]
    fn test_state_changing_methods() {
        assert!(!ApiRequest::get("/x").is_state_changing());
        assert!(!ApiRequest::new(Method::HEAD, "/x").is_state_changing());
        assert!(!ApiRequest::new(Method::OPTIONS, "/x").is_state_changing());
        assert!(ApiRequest::post("/x").is_state_changing());
        assert!(ApiRequest::new(Method::DELETE, "/x").is_state_changing());
        assert!(ApiRequest::new(Method::PATCH, "/x").is_state_changing());
    }

    #[test]
    fn test_bearer_header_follows_store() {
        let store = Arc::new(CredentialStore::in_memory());
        let api = ApiClient::new("https://cms.example.com", Arc::clone(&store)).expect("client");
        assert!(api.bearer_header().expect("header").is_none());

        store.set_tokens("abc", "def", 60).expect("set tokens");
        let header = api.bearer_header().expect("header").expect("bearer present");
        assert_eq!(header.to_str().expect("ascii"), "Bearer abc");
    }

    #[test]
    fn test_credentials_stay_on_own_origin() {
        let store = Arc::new(CredentialStore::in_memory());
        store.set_tokens("abc", "def", 60).expect("set tokens");
        let api = ApiClient::new("https://cms.example.com/api", store).expect("client");

        let own = api.build_url("/users/me").expect("url");
        let headers = api.default_headers(&own).expect("headers");
        assert_eq!(headers.get(header::AUTHORIZATION).expect("bearer"), "Bearer abc");

        for foreign in ["https://assets.example.com/x", "http://cms.example.com/api/x", "https://cms.example.com:8443/api"] {
            let url = api.build_url(foreign).expect("url");
            let headers = api.default_headers(&url).expect("headers");
            assert!(headers.get(header::AUTHORIZATION).is_none(), "{foreign}");
        }
    }

    #[test]
    fn test_find_and_decode_cookie() {
        let header = "session=xyz; XSRF-TOKEN=eyJpdiI6%3D%3D; other=1";
        let raw = find_cookie(header, "XSRF-TOKEN").expect("cookie present");
        assert_eq!(raw, "eyJpdiI6%3D%3D");
        assert_eq!(decode_cookie_value(raw), "eyJpdiI6==");
        assert!(find_cookie(header, "missing").is_none());
        assert_eq!(decode_cookie_value("plain"), "plain");
    }

    #[test]
    fn test_into_json_rejects_text() {
        let response = ApiResponse::Text("<html>".to_string());
        let result: Result<serde_json::Value, _> = response.into_json();
        assert!(matches!(result, Err(ApiError::InvalidResponse(_))));
    }

    #[test]
    fn test_request_builder_sets_headers_and_body() {
        let request = ApiRequest::post("/auth/token")
            .json(&serde_json::json!({"email": "a@b.c"}))
            .expect("body")
            .header(routes::TOTP_HEADER, "123456")
            .expect("header")
            .query("page", "2");

        assert_eq!(request.headers.get("x-totp-code").expect("totp header"), "123456");
        assert_eq!(request.body, Some(serde_json::json!({"email": "a@b.c"})));
        assert_eq!(request.query, vec![("page".to_string(), "2".to_string())]);
    }
}
