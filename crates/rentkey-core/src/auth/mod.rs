//! Authentication module for managing the session credential.
//!
//! This module provides:
//! - `introspect`: pure claim decoding and expiry arithmetic
//! - `CredentialStore`: the single persisted token (file, OS keychain or memory)
//! - `RefreshScheduler`: the one-shot proactive renewal timer
//! - `TokenManager`: single-flight renewal and the retry-once request wrapper
//! - `SessionContext`: the identity published to the UI
//!
//! Tokens are renewed a configurable margin before they expire, and on any
//! unauthorized response.

pub mod context;
pub mod introspect;
pub mod manager;
pub mod scheduler;
pub mod store;

pub use context::{SessionContext, SessionSnapshot};
pub use introspect::{Claims, Credential};
pub use manager::{SessionObserver, Subscription, TokenManager};
pub use scheduler::RefreshScheduler;
pub use store::{CredentialStore, FileStorage, KeyringStorage, MemoryStorage, TokenStorage};
