//! Pure helpers for reading the claims embedded in a bearer token.
//!
//! Signatures are never checked here; the server is the authority on whether a
//! token is genuine. These functions only answer "when does it lapse".
//! Every function takes the current instant explicitly so results are
//! deterministic.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Claims carried in the token payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user identifier)
    #[serde(default)]
    pub sub: Option<String>,
    /// Issued at, seconds since the epoch
    #[serde(default)]
    pub iat: Option<i64>,
    /// Expiry, seconds since the epoch
    pub exp: i64,
    /// Everything else, kept opaque
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat.and_then(|iat| Utc.timestamp_opt(iat, 0).single())
    }

    /// Seconds remaining until expiry, clamped at zero.
    pub fn time_to_live(&self, now: DateTime<Utc>) -> u64 {
        self.exp.saturating_sub(now.timestamp()).max(0) as u64
    }

    /// Expired exactly at `exp`, with no leeway.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }

    pub fn is_expiring_soon(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.time_to_live(now) < threshold.as_secs()
    }
}

/// Decode the payload segment of a `header.payload.signature` token.
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(_signature), None)
            if !header.is_empty() && !payload.is_empty() =>
        {
            payload
        }
        _ => return Err(DecodeError::Malformed),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| DecodeError::Encoding(e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| DecodeError::Claims(e.to_string()))
}

/// True iff `now >= exp`. An undecodable token counts as expired.
pub fn is_expired(token: &str, now: DateTime<Utc>) -> bool {
    decode(token).map(|c| c.is_expired(now)).unwrap_or(true)
}

/// True iff the remaining TTL is below `threshold`. An undecodable token
/// counts as expiring so that it gets refreshed rather than trusted.
pub fn is_expiring_soon(token: &str, now: DateTime<Utc>, threshold: Duration) -> bool {
    decode(token)
        .map(|c| c.is_expiring_soon(now, threshold))
        .unwrap_or(true)
}

/// Seconds remaining, clamped at zero. Zero for an undecodable token.
pub fn time_to_live(token: &str, now: DateTime<Utc>) -> u64 {
    decode(token).map(|c| c.time_to_live(now)).unwrap_or(0)
}

/// A bearer token together with its decoded claims.
///
/// Built only through [`Credential::parse`], so a `Credential` always has
/// claims that match its token.
#[derive(Clone, PartialEq)]
pub struct Credential {
    token: String,
    claims: Claims,
}

impl Credential {
    pub fn parse(token: impl Into<String>) -> Result<Self, DecodeError> {
        let token = token.into();
        let claims = decode(&token)?;
        Ok(Self { token, claims })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn subject(&self) -> Option<&str> {
        self.claims.sub.as_deref()
    }

    pub fn time_to_live(&self, now: DateTime<Utc>) -> u64 {
        self.claims.time_to_live(now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.claims.is_expired(now)
    }

    pub fn is_expiring_soon(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.claims.is_expiring_soon(now, threshold)
    }
}

// Keep tokens out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("sub", &self.claims.sub)
            .field("exp", &self.claims.exp)
            .finish_non_exhaustive()
    }
}

/// Build an unsigned token carrying the given claims. Test helper.
#[cfg(test)]
pub(crate) fn encode_for_test(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

/// Token for `sub` expiring `ttl_secs` after `now`. Test helper.
#[cfg(test)]
pub(crate) fn token_expiring_in(sub: &str, now: DateTime<Utc>, ttl_secs: i64) -> String {
    encode_for_test(&serde_json::json!({
        "sub": sub,
        "iat": now.timestamp(),
        "exp": now.timestamp() + ttl_secs,
    }))
}
