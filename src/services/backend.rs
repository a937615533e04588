//! Collaborators the stream writer relies on but does not implement itself:
//! probing an object's size, whole-object PUT, and minting upload tokens.
//!
//! `HttpBackend` is the implementation that talks to the reference backend
//! served by this crate.

use crate::{
    models::{
        object::ObjectStat,
        policy::{PolicyError, PutPolicy},
    },
    services::{compose_client::error_message, staging::StagingBuffer},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{
    Body, StatusCode,
    header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED},
};
use std::{io, time::Duration};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Header carrying the object size on `HEAD` responses.
pub const OBJECT_SIZE_HEADER: &str = "x-object-size";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Current size of `key`, or `BackendError::NotFound`.
    async fn probe_size(&self, key: &str) -> BackendResult<ObjectStat>;

    /// Replace `key` with the staged bytes.
    async fn whole_object_put(
        &self,
        key: &str,
        staging: StagingBuffer,
        content_type: Option<&str>,
    ) -> BackendResult<()>;

    /// Opaque credential for the compose endpoint.
    async fn mint_upload_token(
        &self,
        scope: &str,
        expiry: Duration,
        allowed_keys: &[String],
    ) -> BackendResult<String>;
}

/// `ObjectBackend` over the reference backend's HTTP surface.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl HttpBackend {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key.trim_start_matches('/'))
    }

    /// Download the full content of `key`.
    pub async fn get_object(&self, key: &str) -> BackendResult<Bytes> {
        let response = self.http.get(self.object_url(key)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(key.to_string())),
            status if status.is_success() => Ok(response.bytes().await?),
            status => Err(status_error(status, &response.bytes().await?)),
        }
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> BackendError {
    BackendError::Status {
        status: status.as_u16(),
        message: error_message(body),
    }
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: impl reqwest::header::AsHeaderName,
) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn stat_from_headers(key: &str, headers: &HeaderMap) -> BackendResult<ObjectStat> {
    let size = header_str(headers, OBJECT_SIZE_HEADER)
        .or_else(|| header_str(headers, CONTENT_LENGTH))
        .ok_or_else(|| BackendError::Malformed(format!("no size reported for `{}`", key)))?
        .parse::<u64>()
        .map_err(|err| BackendError::Malformed(format!("size of `{}`: {}", key, err)))?;
    let last_modified = header_str(headers, LAST_MODIFIED)
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.with_timezone(&Utc));
    let etag = header_str(headers, ETAG).map(|v| v.trim_matches('"').to_string());
    Ok(ObjectStat {
        key: key.to_string(),
        size,
        last_modified,
        etag,
    })
}

#[async_trait]
impl ObjectBackend for HttpBackend {
    async fn probe_size(&self, key: &str) -> BackendResult<ObjectStat> {
        let response = self.http.head(self.object_url(key)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(key.to_string())),
            status if status.is_success() => stat_from_headers(key, response.headers()),
            // HEAD carries no body to explain itself.
            status => Err(status_error(status, b"")),
        }
    }

    async fn whole_object_put(
        &self,
        key: &str,
        staging: StagingBuffer,
        content_type: Option<&str>,
    ) -> BackendResult<()> {
        let len = staging.len();
        let reader = staging.reader().await?;
        let mut request = self
            .http
            .put(self.object_url(key))
            .header(CONTENT_LENGTH, len)
            .body(Body::wrap_stream(ReaderStream::new(reader)));
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        debug!("PUT {} ({} bytes)", key, len);
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, &response.bytes().await?))
        }
    }

    async fn mint_upload_token(
        &self,
        scope: &str,
        expiry: Duration,
        allowed_keys: &[String],
    ) -> BackendResult<String> {
        Ok(PutPolicy::new(scope, expiry, allowed_keys.to_vec()).encode()?)
    }
}
