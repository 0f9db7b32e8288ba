//! Endpoint paths of the CMS API, relative to the configured base URL.

pub const TOKEN: &str = "/auth/token";
pub const TOKEN_REFRESH: &str = "/auth/token/refresh";
pub const REGISTER: &str = "/auth/register";
pub const LOGOUT: &str = "/auth/logout";
pub const CSRF_COOKIE: &str = "/auth/csrf-cookie";
pub const CURRENT_USER: &str = "/users/me";

/// Header carrying the one-time second-factor code on login.
pub const TOTP_HEADER: &str = "X-TOTP-Code";

/// Cookie set by the anti-forgery endpoint.
pub const XSRF_COOKIE: &str = "XSRF-TOKEN";

/// Header echoing the anti-forgery cookie on state-changing requests.
pub const XSRF_HEADER: &str = "x-xsrf-token";

/// Whether `endpoint` (a path or absolute URL) is one of the token-issuing
/// endpoints. A 401 from these cannot be recovered by refreshing.
pub fn is_token_endpoint(endpoint: &str) -> bool {
    let path = endpoint_path(endpoint);
    path.ends_with(TOKEN) || path.ends_with(TOKEN_REFRESH)
}

/// Path component of an endpoint without query string or trailing slash.
fn endpoint_path(endpoint: &str) -> &str {
    let without_scheme = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"));

    let path = match without_scheme {
        Some(rest) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => endpoint,
    };

    let path = path.split(['?', '#']).next().unwrap_or(path);
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}
