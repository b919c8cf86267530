//! Client-side session lifecycle for the rental-management app.
//!
//! Holds the bearer credential for a signed-in user, renews it before it
//! lapses, and makes sure concurrent requests that hit an expired credential
//! share a single renewal.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;

pub use api::{ApiClient, ApiError, AuthBackend, SessionClient};
pub use auth::{Credential, SessionContext, SessionObserver, SessionSnapshot, TokenManager};
pub use config::{Config, SessionTimings, StorageKind};
pub use error::{DecodeError, RefreshFailure, SessionError};
pub use models::{NewAccount, UserInfo};
