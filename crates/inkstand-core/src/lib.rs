//! inkstand-core - session layer for the inkstand CMS admin client.
//!
//! Credentials live in a [`auth::CredentialStore`], every API call goes
//! through [`api::ApiClient`], and [`auth::Session`] ties the two together:
//! it logs users in, keeps tokens fresh ahead of expiry and recovers requests
//! that fail with 401 by refreshing once and retrying.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

use std::sync::Arc;

use anyhow::{Context, Result};

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse};
pub use auth::{AuthError, CredentialStore, LoginOutcome, Session, SessionEvent, SessionState};
pub use config::Config;

/// Wire up storage, transport and session from configuration.
pub fn connect(config: &Config) -> Result<Arc<Session>> {
    let credentials = Arc::new(config.open_credential_store()?);
    let api = ApiClient::with_timeout(&config.api_base_url, credentials, config.request_timeout())
        .with_context(|| format!("Failed to create API client for {}", config.api_base_url))?;
    Ok(Session::new(api, config.session_config()))
}
