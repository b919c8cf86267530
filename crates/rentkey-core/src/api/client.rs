//! HTTP client for the rental-management API.
//!
//! This module provides the `ApiClient` struct: the authentication endpoints
//! used by the session machinery, plus bearer-authenticated JSON requests for
//! everything else.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ApiError, AuthBackend};
use crate::models::{NewAccount, UserInfo};

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const REFRESH_PATH: &str = "/auth/refresh";
const INTROSPECT_PATH: &str = "/auth/introspect";
const USER_INFO_PATH: &str = "/auth/me";

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct IntrospectResponse {
    active: bool,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// API client for the rental-management backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client rooted at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn auth_headers(token: &str) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ApiError::InvalidResponse("Token is not a valid header value".into()))?;
        headers.insert(header::AUTHORIZATION, value);
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse_json<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    /// Send a bearer-authenticated request, backing off on 429.
    async fn send_authorized<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Option<&B>,
    ) -> Result<Response, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .headers(Self::auth_headers(token)?);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    // ===== Authenticated JSON requests =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T, ApiError> {
        let response = self
            .send_authorized::<()>(Method::GET, path, token, None)
            .await?;
        Self::parse_json(response, path).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .send_authorized(Method::POST, path, token, Some(body))
            .await?;
        Self::parse_json(response, path).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .send_authorized(Method::PUT, path, token, Some(body))
            .await?;
        Self::parse_json(response, path).await
    }

    /// DELETE, ignoring any response body
    pub async fn delete(&self, path: &str, token: &str) -> Result<(), ApiError> {
        self.send_authorized::<()>(Method::DELETE, path, token, None)
            .await?;
        Ok(())
    }

    async fn post_credentials<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<String, ApiError> {
        let url = self.url(path);
        let response = self.client.post(&url).json(body).send().await?;
        let response = Self::check_response(response).await?;
        let parsed: TokenResponse = Self::parse_json(response, &url).await?;
        Ok(parsed.token)
    }
}

#[async_trait]
impl AuthBackend for ApiClient {
    async fn renew(&self, token: &str) -> Result<String, ApiError> {
        let url = self.url(REFRESH_PATH);
        debug!("Requesting credential renewal");

        // Single attempt: the token manager owns retry policy for renewals
        let response = self
            .client
            .post(&url)
            .headers(Self::auth_headers(token)?)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        let parsed: TokenResponse = Self::parse_json(response, &url).await?;
        Ok(parsed.token)
    }

    async fn introspect(&self, token: &str) -> Result<bool, ApiError> {
        let parsed: IntrospectResponse = self.get(INTROSPECT_PATH, token).await?;
        Ok(parsed.active)
    }

    async fn user_info(&self, token: &str) -> Result<UserInfo, ApiError> {
        self.get(USER_INFO_PATH, token).await
    }

    async fn login(&self, email: &str, password: &str) -> Result<String, ApiError> {
        self.post_credentials(LOGIN_PATH, &LoginRequest { email, password })
            .await
    }

    async fn register(&self, account: &NewAccount) -> Result<String, ApiError> {
        self.post_credentials(REGISTER_PATH, account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(&server.uri(), Duration::from_secs(5)).expect("client builds")
    }

    #[test]
    fn test_url_joining() {
        let api = ApiClient::new("https://rent.example.com/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url(), "https://rent.example.com/api");
        assert_eq!(api.url("/auth/me"), "https://rent.example.com/api/auth/me");
        assert_eq!(api.url("properties/3"), "https://rent.example.com/api/properties/3");
    }

    #[tokio::test]
    async fn test_renew_sends_bearer_and_parses_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(header("authorization", "Bearer old-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "new-token"})))
            .expect(1)
            .mount(&server)
            .await;

        let token = client_for(&server).renew("old-token").await.unwrap();
        assert_eq!(token, "new-token");
    }

    #[tokio::test]
    async fn test_renew_maps_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .mount(&server)
            .await;

        let err = client_for(&server).renew("old-token").await.unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn test_introspect_and_user_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/introspect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active": false})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .and(header("authorization", "Bearer t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "u-1",
                "email": "owner@example.com",
                "name": "Sam Owner",
                "role": "landlord"
            })))
            .mount(&server)
            .await;

        let api = client_for(&server);
        assert!(!api.introspect("t").await.unwrap());
        let user = api.user_info("t").await.unwrap();
        assert_eq!(user.email, "owner@example.com");
        assert_eq!(user.role.as_deref(), Some("landlord"));
    }

    #[tokio::test]
    async fn test_login_posts_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(json!({"email": "pat@example.com", "password": "hunter2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "fresh"})))
            .mount(&server)
            .await;

        let token = client_for(&server)
            .login("pat@example.com", "hunter2")
            .await
            .unwrap();
        assert_eq!(token, "fresh");
    }

    #[tokio::test]
    async fn test_invalid_json_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server).user_info("t").await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_delete_ignores_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/leases/9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).delete("/leases/9", "t").await.unwrap();
    }
}
