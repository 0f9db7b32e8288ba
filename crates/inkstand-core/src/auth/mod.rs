//! Authentication module for managing sessions and credentials.
//!
//! This module provides:
//! - `CredentialStore`: the token pair and expiry, persisted through a
//!   `TokenStorage` backend (file, OS keychain or memory)
//! - `RefreshCoordinator`: single-flight exchange of the refresh token
//! - `Session`: login, logout, registration, two-factor step-up and
//!   proactive refresh, exposed as observable session state
//!
//! The session registers itself with the API client as its `AuthHandler`,
//! so requests rejected with 401 are retried once after a refresh.

pub mod credentials;
pub mod error;
pub mod refresh;
pub mod session;

pub use credentials::{
    CredentialSet, CredentialStore, FileStorage, KeyringStorage, MemoryStorage, TokenStorage,
    DEFAULT_EXPIRY_SKEW,
};
pub use error::{AuthError, StorageError};
pub use refresh::RefreshCoordinator;
pub use session::{LoginOutcome, Session, SessionConfig, SessionEvent, SessionState};
