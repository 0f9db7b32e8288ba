use reqwest::StatusCode;
use thiserror::Error;

/// Server error code: login needs a second factor.
pub const TOTP_VERIFICATION_REQUIRED: &str = "TOTP_VERIFICATION_REQUIRED";

/// Server error code: the supplied second factor was wrong.
pub const INVALID_TOTP_CODE: &str = "INVALID_TOTP_CODE";

/// Server error code: the account exists but its email is unverified.
pub const EMAIL_NOT_VERIFIED: &str = "EMAIL_NOT_VERIFIED";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request failed with status {status}: {message}")]
    Http {
        status: StatusCode,
        /// Machine-readable error code from the response body, if any
        code: Option<String>,
        message: String,
        /// Parsed response body (a JSON string when the body was not JSON)
        data: serde_json::Value,
    },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] reqwest::header::InvalidHeaderName),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// How the session layer should react to a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Credentials are invalid or the session expired
    RequiresLogin,
    /// Login is valid but needs a one-time code
    RequiresTwoFactor,
    /// The server wants the password re-entered before a sensitive action
    RequiresPasswordConfirmation,
    InvalidTwoFactorCode,
    EmailNotVerified,
    /// Network trouble, rate limiting or a server-side failure
    Transient,
    Other,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Build an error from a non-2xx response.
    ///
    /// JSON bodies of the form `{"code": "...", "message": "..."}` are
    /// understood; `error` is accepted as an alias for `code`.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();

        let code = parsed.as_ref().and_then(|v| {
            v.get("code")
                .or_else(|| v.get("error"))
                .and_then(|c| c.as_str())
                .map(str::to_string)
        });

        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()))
            .map(str::to_string)
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty() && parsed.is_none()).then(|| Self::truncate_body(trimmed))
            })
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string()
            });

        let data = parsed.unwrap_or_else(|| serde_json::Value::String(Self::truncate_body(body)));

        ApiError::Http {
            status,
            code,
            message,
            data,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::NetworkError(e) => e.status(),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Http { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }

    /// Classify this error for the session layer.
    pub fn auth_failure(&self) -> AuthFailure {
        let ApiError::Http { status, code, .. } = self else {
            return match self {
                ApiError::NetworkError(_) => AuthFailure::Transient,
                _ => AuthFailure::Other,
            };
        };

        match (status.as_u16(), code.as_deref()) {
            (401, _) => AuthFailure::RequiresLogin,
            (423, Some(TOTP_VERIFICATION_REQUIRED)) => AuthFailure::RequiresTwoFactor,
            (423, _) => AuthFailure::RequiresPasswordConfirmation,
            (403, Some(INVALID_TOTP_CODE)) => AuthFailure::InvalidTwoFactorCode,
            (409, Some(EMAIL_NOT_VERIFIED)) => AuthFailure::EmailNotVerified,
            (408 | 429, _) | (500..=599, _) => AuthFailure::Transient,
            _ => AuthFailure::Other,
        }
    }

    /// Message suitable for showing to a user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Http { message, .. } => message.clone(),
            ApiError::NetworkError(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            ApiError::NetworkError(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            other => other.to_string(),
        }
    }
}
