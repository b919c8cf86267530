//! REST API client module for the rental-management backend.
//!
//! This module provides:
//! - `AuthBackend`: the authentication endpoints the session layer consumes
//! - `ApiClient`: the reqwest implementation of those endpoints, plus
//!   bearer-authenticated JSON requests
//! - `SessionClient`: JSON requests routed through the token manager's
//!   attach-credential, retry-once-on-401 wrapper

pub mod backend;
pub mod client;
pub mod error;
pub mod session_client;

pub use backend::AuthBackend;
pub use client::ApiClient;
pub use error::ApiError;
pub use session_client::SessionClient;
