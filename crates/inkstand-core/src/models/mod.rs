//! Data models exchanged with the CMS authentication endpoints.
//!
//! This module contains:
//!
//! - `UserProfile`: the authenticated user returned by `GET /users/me`
//! - `TokenResponse`: the token pair issued by login, refresh and registration
//! - Request payloads: `LoginCredentials`, `RegisterRequest`, `RefreshRequest`

pub mod token;
pub mod user;

pub use token::{LoginCredentials, RefreshRequest, RegisterRequest, TokenResponse};
pub use user::UserProfile;
