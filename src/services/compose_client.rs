//! Compose client: sends an encoded manifest to the backend's `/parts`
//! endpoint and decodes the reply.

use crate::{
    errors::WriteError,
    models::object::PutRet,
    services::encoder::{self, ComposeRequest, PartStreamError},
};
use serde::Deserialize;
use std::error::Error as _;
use tracing::{debug, warn};

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Extract the message from a backend error body, which is JSON
/// `{"error": ...}` when the backend produced it and arbitrary text when a
/// proxy did.
pub(crate) fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

/// Map a reqwest failure to `TransportFailure`, recovering the index of the
/// direct part whose stream failed, if that is what happened.
pub(crate) fn transport_failure(err: reqwest::Error) -> WriteError {
    let mut cause = err.source();
    let mut part = None;
    while let Some(current) = cause {
        if let Some(stream_err) = current.downcast_ref::<PartStreamError>() {
            part = Some(stream_err.part);
            break;
        }
        cause = current.source();
    }
    WriteError::TransportFailure { part, source: err }
}

/// Client for the compose endpoint. Cheap to clone; the underlying
/// connection pool is shared.
#[derive(Clone, Debug)]
pub struct ComposeClient {
    http: reqwest::Client,
    up_host: String,
}

impl ComposeClient {
    pub fn new(http: reqwest::Client, up_host: impl Into<String>) -> Self {
        Self {
            http,
            up_host: up_host.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/parts", self.up_host)
    }

    /// Encode and send one compose request.
    pub async fn put_parts(&self, request: ComposeRequest) -> Result<PutRet, WriteError> {
        let target = request.key.clone();
        let encoded = encoder::encode(request).await?;
        let url = self.endpoint();
        debug!(
            "POST {} composing {:?} from {} parts",
            url,
            target,
            encoded.manifest.parts.len()
        );

        let response = self
            .http
            .post(&url)
            .multipart(encoded.form)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = response.status();
        let body = response.bytes().await.map_err(transport_failure)?;
        if !status.is_success() {
            let message = error_message(&body);
            warn!("compose of {:?} rejected ({}): {}", target, status, message);
            return Err(WriteError::ComposeRejected {
                status: status.as_u16(),
                message,
            });
        }

        let ret: PutRet = serde_json::from_slice(&body)?;
        debug!("composed `{}` hash={}", ret.key, ret.hash);
        Ok(ret)
    }
}
