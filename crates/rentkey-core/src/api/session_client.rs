use serde::{de::DeserializeOwned, Serialize};

use super::ApiClient;
use crate::auth::TokenManager;
use crate::error::SessionError;

/// JSON requests for the rest of the application.
///
/// Every call attaches the current credential and goes through
/// [`TokenManager::authorized`], so a 401 triggers at most one shared refresh
/// and one retry. Collaborators should use this instead of attaching tokens
/// themselves.
#[derive(Clone)]
pub struct SessionClient {
    api: ApiClient,
    manager: TokenManager,
}

impl SessionClient {
    pub fn new(api: ApiClient, manager: TokenManager) -> Self {
        Self { api, manager }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, SessionError> {
        let api = &self.api;
        self.manager
            .authorized(|credential| async move { api.get(path, credential.token()).await })
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SessionError> {
        let api = &self.api;
        self.manager
            .authorized(|credential| async move { api.post(path, credential.token(), body).await })
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SessionError> {
        let api = &self.api;
        self.manager
            .authorized(|credential| async move { api.put(path, credential.token(), body).await })
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<(), SessionError> {
        let api = &self.api;
        self.manager
            .authorized(|credential| async move { api.delete(path, credential.token()).await })
            .await
    }
}
