use async_trait::async_trait;

use super::ApiError;
use crate::models::{NewAccount, UserInfo};

/// The authentication endpoints the session machinery depends on.
///
/// `ApiClient` is the HTTP implementation; tests script their own.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange the current token for a fresh one.
    async fn renew(&self, token: &str) -> Result<String, ApiError>;

    /// Ask the server whether the token is still live.
    async fn introspect(&self, token: &str) -> Result<bool, ApiError>;

    async fn user_info(&self, token: &str) -> Result<UserInfo, ApiError>;

    async fn login(&self, email: &str, password: &str) -> Result<String, ApiError>;

    async fn register(&self, account: &NewAccount) -> Result<String, ApiError>;
}
