//! Upload tokens.
//!
//! A token is the URL-safe base64 encoding of a JSON put policy. Tokens are
//! not signed; they only carry the scope a compose request is allowed to
//! write to.

use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("token does not carry a put policy: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PutPolicy {
    /// `bucket` or `bucket:key`.
    pub scope: String,

    /// Unix timestamp (seconds) after which the token is rejected.
    pub deadline: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accesses: Vec<String>,
}

impl PutPolicy {
    pub fn new(scope: impl Into<String>, expiry: Duration, accesses: Vec<String>) -> Self {
        let deadline = chrono::Duration::from_std(expiry)
            .ok()
            .and_then(|expiry| Utc::now().checked_add_signed(expiry))
            .map_or(i64::MAX, |t| t.timestamp());
        Self {
            scope: scope.into(),
            deadline,
            accesses,
        }
    }

    pub fn encode(&self) -> Result<String, PolicyError> {
        Ok(URL_SAFE.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(token: &str) -> Result<Self, PolicyError> {
        let raw = URL_SAFE.decode(token.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn bucket(&self) -> &str {
        self.scope
            .split_once(':')
            .map_or(self.scope.as_str(), |(bucket, _)| bucket)
    }

    /// Key the scope is pinned to, if any.
    pub fn scoped_key(&self) -> Option<&str> {
        self.scope.split_once(':').map(|(_, key)| key)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.deadline
    }

    /// Whether this policy lets a request write `key`.
    pub fn permits(&self, key: &str) -> bool {
        if let Some(scoped) = self.scoped_key() {
            if scoped != key {
                return false;
            }
        }
        self.accesses.is_empty() || self.accesses.iter().any(|k| k == key)
    }
}
