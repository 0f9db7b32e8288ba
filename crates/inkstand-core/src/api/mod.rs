//! REST API transport for the CMS.
//!
//! This module provides the `ApiClient` for talking to the CMS API with
//! bearer-token authentication and anti-forgery protection, along with the
//! `ApiError` taxonomy the session layer uses to decide how to react to a
//! failed request.

pub mod client;
pub mod error;
pub mod routes;

pub use client::{ApiClient, ApiRequest, ApiResponse, AuthHandler, RetryDirective};
pub use error::{ApiError, AuthFailure};
