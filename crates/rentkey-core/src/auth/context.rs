//! The signed-in identity as the rest of the application sees it.
//!
//! `SessionContext` composes the token manager with the user-info and
//! introspection endpoints. UI code reads identity from here (or watches it)
//! and never talks to the token manager's refresh machinery directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::introspect::Credential;
use super::manager::{SessionObserver, Subscription, TokenManager};
use crate::api::AuthBackend;
use crate::error::{RefreshFailure, SessionError};
use crate::models::{NewAccount, UserInfo};

/// Identity snapshot published to the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionSnapshot {
    /// True while the session is being established or verified
    pub loading: bool,
    pub user: Option<UserInfo>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Remaining lifetime is under the warning threshold
    pub expiring_soon: bool,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    fn pending_from(previous: &SessionSnapshot) -> Self {
        Self {
            loading: true,
            ..previous.clone()
        }
    }
}

/// The published identity.
///
/// Every sign-out bumps `sign_outs` while holding the channel's write lock.
/// A user fetch records the count it started under and is only published if
/// no sign-out happened in between.
struct Identity {
    sender: watch::Sender<SessionSnapshot>,
    sign_outs: AtomicU64,
    expiring_soon: Duration,
}

impl Identity {
    fn generation(&self) -> u64 {
        self.sign_outs.load(Ordering::SeqCst)
    }

    fn sign_out(&self) {
        self.sender.send_modify(|snapshot| {
            self.sign_outs.fetch_add(1, Ordering::SeqCst);
            *snapshot = SessionSnapshot::default();
        });
    }
}

impl SessionObserver for Identity {
    fn session_expired(&self, reason: &RefreshFailure) {
        warn!(reason = %reason, "Session expired, re-authentication required");
        self.sign_out();
    }

    fn credential_renewed(&self, credential: &Credential) {
        let now = Utc::now();
        self.sender.send_if_modified(|snapshot| {
            if snapshot.user.is_none() {
                return false;
            }
            snapshot.expires_at = credential.claims().expires_at();
            snapshot.expiring_soon = credential.is_expiring_soon(now, self.expiring_soon);
            true
        });
    }
}

struct ContextInner {
    manager: TokenManager,
    backend: Arc<dyn AuthBackend>,
    identity: Arc<Identity>,
    _subscription: Subscription,
    revalidation: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let handle = self.revalidation.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = handle.take() {
            handle.abort();
        }
    }
}

/// Clone is cheap; clones share the same identity.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<ContextInner>,
}

impl SessionContext {
    pub fn new(manager: TokenManager, backend: Arc<dyn AuthBackend>) -> Self {
        let (sender, _) = watch::channel(SessionSnapshot::default());
        let identity = Arc::new(Identity {
            sender,
            sign_outs: AtomicU64::new(0),
            expiring_soon: manager.timings().expiring_soon,
        });
        let subscription = manager.subscribe(identity.clone());

        Self {
            inner: Arc::new(ContextInner {
                manager,
                backend,
                identity,
                _subscription: subscription,
                revalidation: Mutex::new(None),
            }),
        }
    }

    pub fn manager(&self) -> &TokenManager {
        &self.inner.manager
    }

    /// Current identity snapshot
    pub fn identity(&self) -> SessionSnapshot {
        self.inner.identity.sender.borrow().clone()
    }

    /// Receiver that sees every identity change
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.identity.sender.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.identity.sender.borrow().is_authenticated()
    }

    /// Establish the session from the persisted credential.
    ///
    /// An expiring (or expired, or undecodable) credential is renewed first.
    /// Either way the server must confirm it is live before the identity is
    /// published.
    pub async fn start(&self) -> Result<SessionSnapshot, SessionError> {
        self.inner
            .identity
            .sender
            .send_modify(|snapshot| *snapshot = SessionSnapshot::pending_from(snapshot));

        let result = self.bootstrap().await;
        if let Err(ref e) = result {
            warn!(error = %e, "Could not restore session");
            self.publish_signed_out();
        }
        result
    }

    async fn bootstrap(&self) -> Result<SessionSnapshot, SessionError> {
        let manager = &self.inner.manager;
        let generation = self.inner.identity.generation();
        let Some(credential) = manager.current() else {
            debug!("No stored credential");
            self.publish_signed_out();
            return Ok(self.identity());
        };

        let now = Utc::now();
        let threshold = manager.timings().expiring_soon;
        if credential.is_expired(now) || credential.is_expiring_soon(now, threshold) {
            info!(
                ttl_secs = credential.time_to_live(now),
                "Stored credential is expiring, refreshing before use"
            );
            manager.refresh().await?;
        } else {
            manager.resume();
        }

        if !self.check_liveness().await? {
            info!("Stored credential is no longer active");
            manager.clear();
            self.publish_signed_out();
            return Ok(self.identity());
        }

        let user = self.fetch_user().await?;
        Ok(self
            .publish_user(generation, user)
            .unwrap_or_else(|| self.identity()))
    }

    /// Confirm with the server that the session is still live, refreshing the
    /// published identity. Returns false if the session has ended.
    pub async fn revalidate(&self) -> Result<bool, SessionError> {
        let generation = self.inner.identity.generation();
        if self.inner.manager.current().is_none() {
            self.publish_signed_out();
            return Ok(false);
        }

        match self.check_liveness().await {
            Ok(true) => match self.fetch_user().await {
                Ok(user) => Ok(self.publish_user(generation, user).is_some()),
                Err(e) if e.requires_reauthentication() => {
                    self.publish_signed_out();
                    Err(e)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to refresh user info");
                    Ok(true)
                }
            },
            Ok(false) => {
                warn!("Server reports session inactive, signing out");
                self.inner.manager.clear();
                self.publish_signed_out();
                Ok(false)
            }
            Err(e) if e.requires_reauthentication() => {
                self.publish_signed_out();
                Err(e)
            }
            Err(e) => {
                // Transient failure: keep the current identity until the next check
                warn!(error = %e, "Session revalidation failed");
                Err(e)
            }
        }
    }

    /// Re-validate on the configured interval in the background. Replaces
    /// any previously spawned loop.
    pub fn spawn_revalidation(&self) {
        let period = self.inner.manager.timings().revalidate_interval;
        let weak: Weak<ContextInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let context = SessionContext { inner };
                match context.revalidate().await {
                    Ok(active) => debug!(active, "Background revalidation complete"),
                    Err(e) => debug!(error = %e, "Background revalidation failed"),
                }
            }
        });

        let mut slot = self.inner.revalidation.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<SessionSnapshot, SessionError> {
        let token = self.inner.backend.login(email, password).await?;
        self.establish(token).await
    }

    pub async fn register(&self, account: &NewAccount) -> Result<SessionSnapshot, SessionError> {
        let token = self.inner.backend.register(account).await?;
        self.establish(token).await
    }

    /// Adopt a token issued elsewhere (social sign-in redirect, invite link)
    pub async fn establish(&self, token: String) -> Result<SessionSnapshot, SessionError> {
        self.inner.manager.save(token)?;
        let generation = self.inner.identity.generation();
        match self.fetch_user().await {
            Ok(user) => {
                let name = user.display_name().to_string();
                match self.publish_user(generation, user) {
                    Some(snapshot) => {
                        info!(user = %name, "Signed in");
                        Ok(snapshot)
                    }
                    None => {
                        debug!("Signed out while sign-in was completing");
                        Err(SessionError::Cancelled)
                    }
                }
            }
            Err(e) => {
                self.publish_signed_out();
                Err(e)
            }
        }
    }

    pub fn logout(&self) {
        self.inner.manager.clear();
        self.publish_signed_out();
        info!("Signed out");
    }

    async fn check_liveness(&self) -> Result<bool, SessionError> {
        let backend = &self.inner.backend;
        self.inner
            .manager
            .authorized(|credential| async move { backend.introspect(credential.token()).await })
            .await
    }

    async fn fetch_user(&self) -> Result<UserInfo, SessionError> {
        let backend = &self.inner.backend;
        self.inner
            .manager
            .authorized(|credential| async move { backend.user_info(credential.token()).await })
            .await
    }

    /// Publish `user` with the current credential's expiry, unless the
    /// session was signed out after `generation` was taken.
    fn publish_user(&self, generation: u64, user: UserInfo) -> Option<SessionSnapshot> {
        let identity = &self.inner.identity;
        let manager = &self.inner.manager;
        let mut published = None;

        identity.sender.send_if_modified(|snapshot| {
            let Some(credential) = manager.current() else {
                return false;
            };
            if identity.generation() != generation {
                return false;
            }
            *snapshot = SessionSnapshot {
                loading: false,
                user: Some(user),
                expires_at: credential.claims().expires_at(),
                expiring_soon: credential.is_expiring_soon(Utc::now(), identity.expiring_soon),
            };
            published = Some(snapshot.clone());
            true
        });

        if published.is_none() {
            debug!("Session ended while user info was loading, not publishing");
        }
        published
    }

    fn publish_signed_out(&self) {
        self.inner.identity.sign_out();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::api::ApiError;
    use crate::auth::introspect::token_expiring_in;
    use crate::auth::manager::tests::{timings, FakeBackend};
    use crate::auth::store::{CredentialStore, MemoryStorage};

    fn context_with(backend: Arc<FakeBackend>, stored: Option<String>) -> (SessionContext, MemoryStorage) {
        let storage = match stored {
            Some(token) => MemoryStorage::with_token(token),
            None => MemoryStorage::new(),
        };
        let store = CredentialStore::open(Box::new(storage.clone()));
        let manager = TokenManager::new(store, backend.clone(), timings());
        (SessionContext::new(manager, backend), storage)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_credential() {
        let backend = Arc::new(FakeBackend::new());
        let (context, _) = context_with(backend.clone(), None);

        let snapshot = context.start().await.unwrap();
        assert!(!snapshot.loading);
        assert!(!snapshot.is_authenticated());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_trusts_live_credential_without_refresh() {
        let backend = Arc::new(FakeBackend::new());
        let token = token_expiring_in("tenant", Utc::now(), 3_600);
        let (context, _) = context_with(backend.clone(), Some(token));

        let snapshot = context.start().await.unwrap();
        assert!(snapshot.is_authenticated());
        assert!(!snapshot.expiring_soon);
        assert!(snapshot.expires_at.is_some());
        assert_eq!(snapshot.user.unwrap().email, "tenant@example.com");
        assert_eq!(backend.calls(), 0);
        assert!(context.manager().next_refresh_in().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_refreshes_expiring_credential() {
        let backend = Arc::new(FakeBackend::new());
        let token = token_expiring_in("tenant", Utc::now(), 60);
        let (context, _) = context_with(backend.clone(), Some(token.clone()));

        let snapshot = context.start().await.unwrap();
        assert!(snapshot.is_authenticated());
        assert_eq!(backend.calls(), 1);
        assert_ne!(context.manager().current().unwrap().token(), token);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_inactive_credential() {
        let backend = Arc::new(FakeBackend::new());
        backend.active.store(false, Ordering::SeqCst);
        let token = token_expiring_in("tenant", Utc::now(), 3_600);
        let (context, storage) = context_with(backend.clone(), Some(token));

        let snapshot = context.start().await.unwrap();
        assert!(!snapshot.is_authenticated());
        assert!(context.manager().current().is_none());
        assert_eq!(storage.persisted(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_clears_identity() {
        let backend = Arc::new(FakeBackend::failing());
        let token = token_expiring_in("tenant", Utc::now(), 3_600);
        let (context, storage) = context_with(backend.clone(), Some(token));

        context.start().await.unwrap();
        assert!(context.is_authenticated());
        let mut changes = context.watch();
        changes.borrow_and_update();

        let err = context.manager().refresh().await.unwrap_err();
        assert!(err.requires_reauthentication());

        assert!(changes.has_changed().unwrap());
        assert!(!context.is_authenticated());
        assert_eq!(storage.persisted(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_and_logout() {
        let backend = Arc::new(FakeBackend::new());
        let (context, storage) = context_with(backend.clone(), None);

        let snapshot = context.login("tenant@example.com", "pw").await.unwrap();
        assert!(snapshot.is_authenticated());
        assert!(storage.persisted().is_some());
        assert!(context.manager().next_refresh_in().is_some());

        context.logout();
        assert!(!context.is_authenticated());
        assert_eq!(storage.persisted(), None);
        assert_eq!(context.manager().next_refresh_in(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_establishes_session() {
        let backend = Arc::new(FakeBackend::new());
        let (context, _) = context_with(backend, None);

        let account = NewAccount {
            name: "New Tenant".into(),
            email: "new@example.com".into(),
            password: "pw".into(),
        };
        let snapshot = context.register(&account).await.unwrap();
        assert!(snapshot.is_authenticated());
        assert_eq!(context.manager().current().unwrap().subject(), Some("registered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_revalidation_signs_out_inactive_session() {
        let backend = Arc::new(FakeBackend::new());
        let token = token_expiring_in("tenant", Utc::now(), 3_600);
        let (context, _) = context_with(backend.clone(), Some(token));

        context.start().await.unwrap();
        context.spawn_revalidation();
        assert!(context.is_authenticated());

        // Server revokes the session; next background check notices
        backend.active.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(601)).await;

        assert!(!context.is_authenticated());
        assert!(context.manager().current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidate_without_credential() {
        let backend = Arc::new(FakeBackend::new());
        let (context, _) = context_with(backend, None);
        assert!(!context.revalidate().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_revalidation_stays_signed_out() {
        let backend = Arc::new(FakeBackend {
            user_info_delay: Duration::from_millis(100),
            ..FakeBackend::new()
        });
        let token = token_expiring_in("tenant", Utc::now(), 3_600);
        let (context, _) = context_with(backend, Some(token));
        context.start().await.unwrap();
        assert!(context.is_authenticated());

        let revalidation = {
            let context = context.clone();
            tokio::spawn(async move { context.revalidate().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        context.logout();

        assert!(!revalidation.await.unwrap().unwrap());
        assert!(!context.is_authenticated());
        assert!(context.manager().current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_login_stays_signed_out() {
        let backend = Arc::new(FakeBackend {
            user_info_delay: Duration::from_millis(100),
            ..FakeBackend::new()
        });
        let (context, storage) = context_with(backend, None);

        let login = {
            let context = context.clone();
            tokio::spawn(async move { context.login("tenant@example.com", "pw").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        context.logout();

        assert!(matches!(login.await.unwrap(), Err(SessionError::Cancelled)));
        assert!(!context.is_authenticated());
        assert_eq!(storage.persisted(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_revalidation_error_keeps_identity() {
        let backend = Arc::new(FakeBackend::new());
        let token = token_expiring_in("tenant", Utc::now(), 3_600);
        let (context, _) = context_with(backend.clone(), Some(token));
        context.start().await.unwrap();
        let before = context.identity();

        backend.fail_introspect.store(true, Ordering::SeqCst);
        let err = context.revalidate().await.unwrap_err();
        assert!(matches!(err, SessionError::Api(ApiError::ServerError(_))));
        assert!(!err.requires_reauthentication());

        assert_eq!(context.identity(), before);
        assert!(context.manager().current().is_some());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_republishes_expiry() {
        let backend = Arc::new(FakeBackend {
            renew_ttl_secs: 7_200,
            ..FakeBackend::new()
        });
        let token = token_expiring_in("tenant", Utc::now(), 3_600);
        let (context, _) = context_with(backend.clone(), Some(token));
        let before = context.start().await.unwrap();
        let mut changes = context.watch();
        changes.borrow_and_update();

        let renewed = context.manager().refresh().await.unwrap();

        assert!(changes.has_changed().unwrap());
        let after = context.identity();
        assert_eq!(after.user, before.user);
        assert_eq!(after.expires_at, renewed.claims().expires_at());
        assert!(after.expires_at > before.expires_at);
        assert!(!after.expiring_soon);
    }
}
