use thiserror::Error;

use crate::api::ApiError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("The two-factor code is incorrect")]
    InvalidTwoFactorCode,

    #[error("Please verify your email address before signing in")]
    EmailNotVerified,

    #[error("No login is waiting for a two-factor code")]
    NoPendingLogin,

    #[error("No refresh token available")]
    NoRefreshToken,

    /// Uniform error handed to every caller queued behind a failed refresh.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The session was ended or replaced while a refresh was in flight;
    /// its result was discarded.
    #[error("Session ended during token refresh")]
    SessionEnded,

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored credentials are malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}
