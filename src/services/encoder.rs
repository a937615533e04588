//! Manifest transport encoder.
//!
//! Builds the multipart body of a compose request. Field order is fixed:
//!
//! 1. `token`
//! 2. `key`, when the write targets an explicit key
//! 3. caller metadata fields, in key order
//! 4. one `part-{i}` file field per direct part, `i` being the part's
//!    position in the manifest
//! 5. `parts`, the JSON manifest
//!
//! Validation and checksumming run to completion before the form is built,
//! so a rejected manifest never costs an upload.

use crate::{
    errors::WriteError,
    models::manifest::{PartDescriptor, PartManifest, WireManifest, WirePart},
    services::{checksum::checksum_part, staging::PartReader},
};
use futures::TryStreamExt;
use reqwest::{
    Body,
    multipart::{Form, Part},
};
use std::{collections::BTreeMap, io};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::debug;

pub const TOKEN_FIELD: &str = "token";
pub const KEY_FIELD: &str = "key";
pub const MANIFEST_FIELD: &str = "parts";
const ATTACHMENT_MIME: &str = "application/octet-stream";

pub fn part_field_name(index: usize) -> String {
    format!("part-{}", index)
}

/// Parse a `part-{i}` field name back into its manifest position.
pub fn parse_part_field(name: &str) -> Option<usize> {
    name.strip_prefix("part-")?.parse().ok()
}

/// I/O error raised while streaming a direct part, tagged with its position.
#[derive(Debug, Error)]
#[error("streaming direct part {part}: {source}")]
pub struct PartStreamError {
    pub part: usize,
    #[source]
    pub source: io::Error,
}

/// Everything needed to send one compose request.
#[derive(Debug)]
pub struct ComposeRequest {
    pub token: String,
    /// Target key. `None` lets the backend pick one.
    pub key: Option<String>,
    /// Opaque metadata fields forwarded verbatim.
    pub params: BTreeMap<String, String>,
    pub manifest: PartManifest,
}

impl ComposeRequest {
    pub fn new(token: impl Into<String>, key: Option<String>, manifest: PartManifest) -> Self {
        Self {
            token: token.into(),
            key,
            params: BTreeMap::new(),
            manifest,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Direct part that passed validation and checksumming.
struct Attachment {
    index: usize,
    len: u64,
    reader: PartReader,
}

/// A form ready to send plus the manifest it carries.
pub struct EncodedCompose {
    pub form: Form,
    pub manifest: WireManifest,
}

/// Validate `request`, checksum its direct parts and build the multipart
/// form. Each direct part is read once more when the form is sent.
pub async fn encode(request: ComposeRequest) -> Result<EncodedCompose, WriteError> {
    let ComposeRequest {
        token,
        key,
        params,
        manifest,
    } = request;
    manifest.validate()?;

    let mut wire_parts = Vec::with_capacity(manifest.parts.len());
    let mut attachments = Vec::new();
    for (index, part) in manifest.parts.into_iter().enumerate() {
        match part {
            PartDescriptor::Copy(copy) => wire_parts.push(WirePart::Copy {
                storage_file: copy.key,
                range: copy.range.to_string(),
            }),
            PartDescriptor::Direct(direct) => {
                let len = direct.body.len();
                let mut reader = direct.body.open().await.map_err(|source| {
                    WriteError::ReadFailure {
                        part: Some(index),
                        source,
                    }
                })?;
                let crc32 = match direct.crc32 {
                    Some(crc32) => crc32,
                    None if direct.check_crc => checksum_part(&mut reader, index).await?,
                    None => 0,
                };
                wire_parts.push(WirePart::Direct { crc32 });
                attachments.push(Attachment { index, len, reader });
            }
        }
    }

    let wire = WireManifest {
        mime_type: manifest.mime_type.unwrap_or_default(),
        parts: wire_parts,
    };
    let manifest_json = serde_json::to_string(&wire)?;
    debug!(
        "encoding compose request with {} parts ({} attachments)",
        wire.parts.len(),
        attachments.len()
    );

    let mut form = Form::new().text(TOKEN_FIELD, token);
    if let Some(key) = key {
        form = form.text(KEY_FIELD, key);
    }
    for (name, value) in params {
        form = form.text(name, value);
    }
    for attachment in attachments {
        let name = part_field_name(attachment.index);
        let part = Part::stream_with_length(
            attachment_body(attachment.index, attachment.reader),
            attachment.len,
        )
        .file_name(name.clone())
        .mime_str(ATTACHMENT_MIME)
        .map_err(|source| WriteError::TransportFailure {
            part: Some(attachment.index),
            source,
        })?;
        form = form.part(name, part);
    }
    form = form.text(MANIFEST_FIELD, manifest_json);

    Ok(EncodedCompose {
        form,
        manifest: wire,
    })
}

fn attachment_body(index: usize, reader: PartReader) -> Body {
    let stream = ReaderStream::new(reader).map_err(move |source| PartStreamError {
        part: index,
        source,
    });
    Body::wrap_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::manifest::{CopyRange, DirectPart},
        services::staging::PartBody,
    };
    use bytes::Bytes;

    #[test]
    fn part_field_names_round_trip_positions() {
        assert_eq!(part_field_name(0), "part-0");
        assert_eq!(parse_part_field("part-12"), Some(12));
        assert_eq!(parse_part_field("parts"), None);
        assert_eq!(parse_part_field("part-x"), None);
    }

    #[tokio::test]
    async fn manifest_lists_parts_in_order_with_checksums() {
        let mut manifest = PartManifest::new(Some("application/octet-stream".into()));
        manifest
            .push_copy("blob", CopyRange::bounded(0, 30))
            .push_direct(
                DirectPart::new(PartBody::Bytes(Bytes::from_static(b"new"))).check_crc(true),
            )
            .push_direct(
                DirectPart::new(PartBody::Zeros(4))
                    .with_crc32(99)
                    .check_crc(true),
            )
            .push_direct(DirectPart::new(PartBody::Bytes(Bytes::from_static(b"raw"))))
            .push_copy("blob", CopyRange::open(50));

        let encoded = encode(ComposeRequest::new("t", Some("blob".into()), manifest))
            .await
            .unwrap();
        assert_eq!(
            encoded.manifest.parts,
            vec![
                WirePart::Copy {
                    storage_file: "blob".into(),
                    range: "0-30".into()
                },
                WirePart::Direct {
                    crc32: crc32fast::hash(b"new")
                },
                WirePart::Direct { crc32: 99 },
                WirePart::Direct { crc32: 0 },
                WirePart::Copy {
                    storage_file: "blob".into(),
                    range: "50--1".into()
                },
            ]
        );
        assert_eq!(encoded.manifest.mime_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn invalid_range_is_rejected_before_reading_parts() {
        let mut manifest = PartManifest::new(None);
        manifest
            .push_direct(
                DirectPart::new(PartBody::OneShot {
                    reader: Box::new(&b"abc"[..]),
                    len: 3,
                })
                .check_crc(true),
            )
            .push_copy("blob", CopyRange::bounded(10, 10));

        let err = encode(ComposeRequest::new("t", None, manifest))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WriteError::InvalidManifest(_)));
    }

    #[tokio::test]
    async fn checksum_over_one_shot_source_fails() {
        let mut manifest = PartManifest::new(None);
        manifest
            .push_copy("blob", CopyRange::open(0))
            .push_direct(
                DirectPart::new(PartBody::OneShot {
                    reader: Box::new(&b"abc"[..]),
                    len: 3,
                })
                .check_crc(true),
            );

        let err = encode(ComposeRequest::new("t", None, manifest))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WriteError::SourceNotSeekable { part: 1 }));
    }

    #[tokio::test]
    async fn one_shot_source_without_checksum_is_accepted() {
        let mut manifest = PartManifest::new(None);
        manifest.push_direct(DirectPart::new(PartBody::OneShot {
            reader: Box::new(&b"abc"[..]),
            len: 3,
        }));

        let encoded = encode(ComposeRequest::new("t", None, manifest))
            .await
            .unwrap();
        assert_eq!(encoded.manifest.parts, vec![WirePart::Direct { crc32: 0 }]);
    }
}
