//! Stream write facade.
//!
//! One `write_at_offset` call moves through
//! `Staging -> Planning -> Composing -> Done`, or stops in `Failed` with the
//! first error. The staging buffer is owned by the call and dropped on every
//! exit path, including when the returned future is dropped mid-flight.

use crate::{
    config::WriterConfig,
    errors::WriteError,
    models::manifest::{DirectPart, DirectSource, PartManifest, PartSpec, WritePlan},
    services::{
        backend::{BackendError, ObjectBackend},
        compose_client::ComposeClient,
        encoder::ComposeRequest,
        planner,
        staging::{PartBody, StagingBuffer},
    },
};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

/// Orchestrates positioned writes against a compose-capable backend.
pub struct StreamWriter<B> {
    backend: B,
    compose: ComposeClient,
    config: WriterConfig,
}

impl<B: ObjectBackend> StreamWriter<B> {
    pub fn new(config: WriterConfig, backend: B, http: reqwest::Client) -> Self {
        let compose = ComposeClient::new(http, config.up_host().to_string());
        Self {
            backend,
            compose,
            config,
        }
    }

    /// Write everything `reader` yields into `key` starting at `offset`.
    ///
    /// Returns the number of bytes read from `reader`, regardless of how much
    /// of the object was carried over through copy parts. Offsets past the
    /// current end leave a zero-filled gap.
    pub async fn write_at_offset<R>(
        &self,
        key: &str,
        offset: u64,
        mut reader: R,
    ) -> Result<u64, WriteError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let key = key.trim_start_matches('/');

        debug!("write `{}` at {}: staging", key, offset);
        let (staged, probe) = tokio::join!(
            StagingBuffer::stage(&mut reader, self.config.spool_threshold),
            self.backend.probe_size(key),
        );
        let staging = staged.map_err(|source| WriteError::ReadFailure { part: None, source })?;
        let existing = match probe {
            Ok(stat) => Some(stat.size),
            Err(BackendError::NotFound(_)) => None,
            Err(err) => {
                warn!("probing `{}` failed: {}", key, err);
                return Err(WriteError::Backend(err));
            }
        };
        let staged_len = staging.len();

        debug!(
            "write `{}` at {}: planning {} bytes over {:?}",
            key, offset, staged_len, existing
        );
        let plan = planner::plan(key, existing, offset, staged_len)?;

        match plan {
            WritePlan::WholeObject => {
                debug!("write `{}`: whole-object put", key);
                self.backend
                    .whole_object_put(key, staging, self.config.mime_type.as_deref())
                    .await?;
            }
            WritePlan::Compose(_)
                if staging.is_empty() && existing.is_some_and(|size| offset <= size) =>
            {
                debug!("write `{}`: empty write inside the object, nothing to compose", key);
            }
            WritePlan::Compose(manifest) => {
                debug!("write `{}`: composing {} parts", key, manifest.parts.len());
                let manifest = self.bind(manifest.parts, staging)?;
                let token = self
                    .backend
                    .mint_upload_token(
                        &format!("{}:{}", self.config.bucket, key),
                        self.config.token_expiry,
                        &[key.to_string()],
                    )
                    .await?;
                self.compose
                    .put_parts(ComposeRequest::new(token, Some(key.to_string()), manifest))
                    .await?;
            }
        }

        info!("wrote {} bytes to `{}` at offset {}", staged_len, key, offset);
        Ok(staged_len)
    }

    /// Attach payload bodies to a planned manifest. The staged bytes back the
    /// single new-data part.
    fn bind(&self, parts: Vec<PartSpec>, staging: StagingBuffer) -> Result<PartManifest, WriteError> {
        let mut staging = Some(staging);
        let mut manifest = PartManifest::new(self.config.mime_type.clone());
        for part in parts {
            match part {
                PartSpec::Copy { key, range } => {
                    manifest.push_copy(key, range);
                }
                PartSpec::Direct(DirectSource::ZeroFill { len }) => {
                    manifest.push_direct(
                        DirectPart::new(PartBody::Zeros(len)).check_crc(self.config.check_crc),
                    );
                }
                PartSpec::Direct(DirectSource::NewData { .. }) => {
                    let staged = staging.take().ok_or_else(|| {
                        WriteError::InvalidManifest("staged data referenced twice".into())
                    })?;
                    manifest.push_direct(
                        DirectPart::new(PartBody::Staged(staged)).check_crc(self.config.check_crc),
                    );
                }
            }
        }
        Ok(manifest)
    }
}
