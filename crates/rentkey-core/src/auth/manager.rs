//! Single-flight credential renewal.
//!
//! `TokenManager` owns the credential store and the refresh scheduler and is
//! the only writer of either. Any number of callers may ask for a refresh;
//! while one renewal is in flight every further caller joins its wait queue,
//! and all of them are released in enqueue order with the same outcome.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::introspect::Credential;
use super::scheduler::RefreshScheduler;
use super::store::CredentialStore;
use crate::api::{ApiError, AuthBackend};
use crate::config::SessionTimings;
use crate::error::{RefreshFailure, SessionError};

type Waiter = oneshot::Sender<Result<Credential, SessionError>>;

/// Shortest proactive re-arm after a renewal. Bounds how often the timer can
/// renew when the server issues tokens that live no longer than the margin.
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(60);

/// Told about credential lifecycle events.
pub trait SessionObserver: Send + Sync {
    /// The session ended because the credential could not be kept alive.
    fn session_expired(&self, reason: &RefreshFailure);

    /// A renewal replaced the credential.
    fn credential_renewed(&self, _credential: &Credential) {}
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    /// Bumped on every refresh start, clear and supersession. A renewal
    /// whose epoch no longer matches settles nothing.
    epoch: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: Vec<(u64, Arc<dyn SessionObserver>)>,
}

struct Inner {
    store: CredentialStore,
    scheduler: RefreshScheduler,
    backend: Arc<dyn AuthBackend>,
    timings: SessionTimings,
    state: Mutex<RefreshState>,
    observers: Mutex<Observers>,
}

/// Removes its observer when dropped.
#[must_use = "dropping a Subscription unsubscribes the observer"]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut observers = inner.observers.lock().unwrap_or_else(|e| e.into_inner());
            observers.entries.retain(|(id, _)| *id != self.id);
        }
    }
}

enum Enqueued {
    Ready(Result<Credential, SessionError>),
    Waiting {
        rx: oneshot::Receiver<Result<Credential, SessionError>>,
        /// This caller started the renewal
        started: bool,
    },
}

/// How a credential came to be armed; decides the earliest allowed fire time.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Arming {
    Installed,
    Renewed,
}

/// Coordinates the credential lifecycle for one session.
/// Clone is cheap; clones share the same state.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    /// Build a manager over an opened store. The refresh timer is not armed
    /// until [`TokenManager::resume`], [`TokenManager::save`] or a refresh.
    pub fn new(store: CredentialStore, backend: Arc<dyn AuthBackend>, timings: SessionTimings) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                scheduler: RefreshScheduler::new(),
                backend,
                timings,
                state: Mutex::new(RefreshState::default()),
                observers: Mutex::new(Observers::default()),
            }),
        }
    }

    pub fn timings(&self) -> &SessionTimings {
        &self.inner.timings
    }

    /// The current credential, if any. Never performs I/O.
    pub fn current(&self) -> Option<Credential> {
        self.inner.store.get()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_state().refreshing
    }

    /// Time until the proactive refresh timer fires, if armed.
    pub fn next_refresh_in(&self) -> Option<Duration> {
        self.inner.scheduler.fires_in()
    }

    /// Install a freshly issued token (login, registration, external sign-in).
    ///
    /// Arms the refresh timer. If a renewal is in flight its outcome becomes
    /// moot and its waiters are released with this credential.
    pub fn save(&self, token: impl Into<String>) -> Result<Credential, SessionError> {
        let credential = Credential::parse(token)?;
        if credential.is_expired(Utc::now()) {
            return Err(SessionError::Expired);
        }
        self.inner.install(credential.clone());
        info!(sub = ?credential.subject(), "Credential saved");
        Ok(credential)
    }

    /// Forget the credential, cancel the timer and reject any waiters with
    /// [`SessionError::Cancelled`]. An in-flight renewal is left to finish,
    /// but its result is discarded.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Arm the refresh timer for the credential loaded at startup.
    pub fn resume(&self) -> bool {
        match self.inner.store.get() {
            Some(credential) => {
                self.inner.arm_scheduler(&credential, Arming::Installed);
                true
            }
            None => false,
        }
    }

    /// Renew now, or join the renewal already in flight.
    ///
    /// If the renewal fails, the caller that started it gets
    /// [`SessionError::RefreshFailed`] and every caller that joined it gets
    /// [`SessionError::QueueRejected`] with the same cause.
    pub async fn refresh(&self) -> Result<Credential, SessionError> {
        self.inner.refresh(None).await
    }

    /// Register for session-expired notifications.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> Subscription {
        let mut observers = self.inner.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.next_id += 1;
        let id = observers.next_id;
        observers.entries.push((id, observer));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// A credential fit to send: the stored one, or a renewed one if the
    /// stored credential has already expired.
    pub async fn valid_credential(&self) -> Result<Credential, SessionError> {
        let credential = self.current().ok_or(SessionError::NotAuthenticated)?;
        if credential.is_expired(Utc::now()) {
            debug!("Stored credential expired, refreshing before use");
            return self.inner.refresh(Some(&credential)).await;
        }
        Ok(credential)
    }

    /// Run `op` with the current credential attached. If it fails with an
    /// unauthorized error, wait for a (shared) refresh and run it exactly once
    /// more. A second unauthorized failure is returned as
    /// [`SessionError::RetryExhausted`].
    pub async fn authorized<T, F, Fut>(&self, op: F) -> Result<T, SessionError>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let credential = self.valid_credential().await?;

        match op(credential.clone()).await {
            Err(e) if e.is_unauthorized() => {
                debug!("Request unauthorized, waiting for credential refresh");
                let renewed = self.inner.refresh(Some(&credential)).await?;
                match op(renewed).await {
                    Err(e) if e.is_unauthorized() => {
                        warn!("Request still unauthorized after refresh, giving up");
                        Err(SessionError::RetryExhausted(e))
                    }
                    other => other.map_err(SessionError::from),
                }
            }
            other => other.map_err(SessionError::from),
        }
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn refresh(self: &Arc<Self>, seen: Option<&Credential>) -> Result<Credential, SessionError> {
        match self.enqueue(seen) {
            Enqueued::Ready(result) => result,
            Enqueued::Waiting { rx, started } => match rx.await {
                Ok(Err(SessionError::QueueRejected(failure))) if started => {
                    Err(SessionError::RefreshFailed(failure))
                }
                Ok(result) => result,
                // A dropped sender means the queue was torn down without settling
                Err(_) => Err(SessionError::Cancelled),
            },
        }
    }

    /// Join the wait queue, starting a renewal if none is running.
    ///
    /// `seen` is the credential the caller last used. If it has already been
    /// replaced, the caller gets the current credential without a renewal.
    fn enqueue(self: &Arc<Self>, seen: Option<&Credential>) -> Enqueued {
        let mut state = self.lock_state();
        let started = !state.refreshing;

        if started {
            let current = match self.store.get() {
                Some(current) => current,
                None => return Enqueued::Ready(Err(SessionError::NotAuthenticated)),
            };
            if let Some(seen) = seen {
                if seen.token() != current.token() {
                    debug!("Credential already renewed, reusing it");
                    return Enqueued::Ready(Ok(current));
                }
            }

            state.refreshing = true;
            state.epoch += 1;
            let epoch = state.epoch;
            info!(epoch, sub = ?current.subject(), "Starting credential refresh");
            tokio::spawn(Arc::clone(self).run_renewal(epoch, current));
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        debug!(queued = state.waiters.len(), "Waiting for credential refresh");
        Enqueued::Waiting { rx, started }
    }

    async fn run_renewal(self: Arc<Self>, epoch: u64, current: Credential) {
        let limit = self.timings.request_timeout;
        let outcome = match tokio::time::timeout(limit, self.backend.renew(current.token())).await {
            Ok(Ok(token)) => match Credential::parse(token) {
                Ok(renewed) if renewed.is_expired(Utc::now()) => Err(RefreshFailure::InvalidResponse(
                    "renewed credential is already expired".to_string(),
                )),
                Ok(renewed) => Ok(renewed),
                Err(e) => Err(RefreshFailure::InvalidResponse(e.to_string())),
            },
            Ok(Err(e)) => Err(RefreshFailure::from(e)),
            Err(_) => Err(RefreshFailure::Timeout(limit)),
        };
        self.settle(epoch, outcome);
    }

    fn settle(self: &Arc<Self>, epoch: u64, outcome: Result<Credential, RefreshFailure>) {
        let outcome = {
            let mut state = self.lock_state();
            if !state.refreshing || state.epoch != epoch {
                debug!(epoch, current_epoch = state.epoch, "Discarding superseded refresh result");
                return;
            }
            state.refreshing = false;
            let waiters = std::mem::take(&mut state.waiters);

            match outcome {
                Ok(credential) => {
                    self.store.set(Some(credential.clone()));
                    self.arm_scheduler(&credential, Arming::Renewed);
                    info!(
                        epoch,
                        released = waiters.len(),
                        ttl_secs = credential.time_to_live(Utc::now()),
                        "Credential refreshed"
                    );
                    for waiter in waiters {
                        let _ = waiter.send(Ok(credential.clone()));
                    }
                    Ok(credential)
                }
                Err(failure) => {
                    self.store.set(None);
                    self.scheduler.cancel();
                    error!(epoch, rejected = waiters.len(), error = %failure, "Credential refresh failed, session cleared");
                    for waiter in waiters {
                        let _ = waiter.send(Err(SessionError::QueueRejected(failure.clone())));
                    }
                    Err(failure)
                }
            }
        };

        self.store.persist();
        match outcome {
            Ok(credential) => self.notify(|observer| observer.credential_renewed(&credential)),
            Err(failure) => self.notify(|observer| observer.session_expired(&failure)),
        }
    }

    fn install(self: &Arc<Self>, credential: Credential) {
        {
            let mut state = self.lock_state();
            self.store.set(Some(credential.clone()));
            self.arm_scheduler(&credential, Arming::Installed);

            if state.refreshing {
                state.refreshing = false;
                state.epoch += 1;
                let waiters = std::mem::take(&mut state.waiters);
                debug!(released = waiters.len(), "New credential supersedes in-flight refresh");
                for waiter in waiters {
                    let _ = waiter.send(Ok(credential.clone()));
                }
            }
        }
        self.store.persist();
    }

    fn clear(&self) {
        {
            let mut state = self.lock_state();
            self.store.set(None);
            self.scheduler.cancel();

            if state.refreshing {
                state.refreshing = false;
                state.epoch += 1;
            }
            let waiters = std::mem::take(&mut state.waiters);
            if !waiters.is_empty() {
                debug!(cancelled = waiters.len(), "Rejecting waiters for cleared session");
            }
            for waiter in waiters {
                let _ = waiter.send(Err(SessionError::Cancelled));
            }
        }
        self.store.persist();
        info!("Credential cleared");
    }

    fn arm_scheduler(self: &Arc<Self>, credential: &Credential, arming: Arming) {
        let ttl = Duration::from_secs(credential.time_to_live(Utc::now()));
        let mut delay = ttl.saturating_sub(self.timings.refresh_margin);
        if arming == Arming::Renewed {
            // The floor never exceeds half the remaining lifetime
            let floor = MIN_RENEWAL_INTERVAL.min(ttl / 2);
            if delay < floor {
                warn!(
                    ttl_secs = ttl.as_secs(),
                    margin_secs = self.timings.refresh_margin.as_secs(),
                    delay_secs = floor.as_secs(),
                    "Renewed credential lives no longer than the refresh margin"
                );
                delay = floor;
            }
        }
        let weak = Arc::downgrade(self);
        self.scheduler.arm(delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_timer_fired().await;
            }
        });
    }

    async fn on_timer_fired(self: Arc<Self>) {
        let Some(credential) = self.store.get() else {
            debug!("Refresh timer fired without a credential");
            return;
        };

        if credential.is_expired(Utc::now()) {
            warn!(sub = ?credential.subject(), "Credential expired before proactive refresh");
            self.expire(RefreshFailure::CredentialExpired);
            return;
        }

        if let Err(e) = self.refresh(Some(&credential)).await {
            debug!(error = %e, "Proactive refresh did not complete");
        }
    }

    /// Logged-out transition for a credential that cannot be renewed.
    fn expire(self: &Arc<Self>, reason: RefreshFailure) {
        {
            let mut state = self.lock_state();
            self.store.set(None);
            self.scheduler.cancel();
            if state.refreshing {
                state.refreshing = false;
                state.epoch += 1;
            }
            for waiter in std::mem::take(&mut state.waiters) {
                let _ = waiter.send(Err(SessionError::QueueRejected(reason.clone())));
            }
        }
        self.store.persist();
        self.notify(|observer| observer.session_expired(&reason));
    }

    /// Call `event` on every observer. Never called with the state lock held.
    fn notify(&self, event: impl Fn(&dyn SessionObserver)) {
        let observers: Vec<Arc<dyn SessionObserver>> = {
            let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            observers.entries.iter().map(|(_, o)| Arc::clone(o)).collect()
        };
        for observer in observers {
            event(observer.as_ref());
        }
    }
}
