//! `POST /parts`: build an object from a multipart compose request.
//!
//! The form carries an upload token, an optional target key, one file field
//! `part-{i}` per direct part and the JSON manifest in `parts`. Attachments
//! are spooled to disk as they arrive, so the manifest may come last.

use crate::{
    errors::AppError,
    models::{
        manifest::{CopyRange, WireManifest, WirePart},
        object::PutRet,
        policy::PutPolicy,
    },
    services::{
        encoder::{KEY_FIELD, MANIFEST_FIELD, TOKEN_FIELD, parse_part_field},
        storage_service::{ComposeSource, StagedAttachment, StorageError, StorageService},
    },
};
use axum::{
    Json,
    extract::{Multipart, State},
};
use chrono::Utc;
use futures::TryStreamExt;
use std::{collections::BTreeMap, io};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
struct ComposeForm {
    token: Option<String>,
    key: Option<String>,
    manifest: Option<String>,
    attachments: BTreeMap<usize, StagedAttachment>,
}

async fn read_form(
    service: &StorageService,
    multipart: &mut Multipart,
) -> Result<ComposeForm, AppError> {
    let mut form = ComposeForm::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            TOKEN_FIELD => form.token = Some(field.text().await?),
            KEY_FIELD => form.key = Some(field.text().await?),
            MANIFEST_FIELD => form.manifest = Some(field.text().await?),
            other => match parse_part_field(other) {
                Some(index) => {
                    let attachment = service
                        .stage_attachment(field.map_err(io::Error::other))
                        .await?;
                    debug!("received {} ({} bytes)", other, attachment.len);
                    form.attachments.insert(index, attachment);
                }
                None => debug!("ignoring form field `{}`", other),
            },
        }
    }
    Ok(form)
}

/// Pair every manifest entry with its attachment or parsed range.
fn resolve_sources(
    manifest: WireManifest,
    mut attachments: BTreeMap<usize, StagedAttachment>,
) -> Result<Vec<ComposeSource>, AppError> {
    manifest
        .parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| -> Result<ComposeSource, AppError> {
            match part {
                WirePart::Direct { crc32 } => attachments
                    .remove(&index)
                    .map(|attachment| ComposeSource::Direct { attachment, crc32 })
                    .ok_or_else(|| StorageError::MissingAttachment(index).into()),
                WirePart::Copy {
                    storage_file,
                    range,
                } => {
                    let range = range.parse::<CopyRange>().map_err(|err| {
                        AppError::bad_request(format!("part {}: {}", index, err))
                    })?;
                    Ok(ComposeSource::Copy {
                        key: storage_file.trim_start_matches('/').to_string(),
                        range,
                    })
                }
            }
        })
        .collect()
}

pub async fn compose_object(
    State(service): State<StorageService>,
    mut multipart: Multipart,
) -> Result<Json<PutRet>, AppError> {
    let form = read_form(&service, &mut multipart).await?;

    let token = form
        .token
        .ok_or_else(|| AppError::unauthorized("missing upload token"))?;
    let policy = PutPolicy::decode(&token)
        .map_err(|err| AppError::unauthorized(format!("invalid upload token: {}", err)))?;
    if policy.is_expired(Utc::now()) {
        return Err(AppError::unauthorized("upload token expired"));
    }

    let key = form
        .key
        .or_else(|| policy.scoped_key().map(str::to_string))
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if !policy.permits(&key) {
        return Err(AppError::unauthorized(format!(
            "upload token does not cover `{}`",
            key
        )));
    }

    let manifest_json = form
        .manifest
        .ok_or_else(|| AppError::bad_request("missing `parts` manifest"))?;
    let manifest: WireManifest = serde_json::from_str(&manifest_json)
        .map_err(|err| AppError::bad_request(format!("malformed manifest: {}", err)))?;
    let content_type = Some(manifest.mime_type.clone()).filter(|m| !m.is_empty());
    let sources = resolve_sources(manifest, form.attachments)?;

    let object = service
        .compose_object(policy.bucket(), &key, content_type, sources)
        .await?;
    info!(
        "composed {}/{} ({} bytes, etag {})",
        object.bucket, object.key, object.size_bytes, object.etag
    );

    Ok(Json(PutRet {
        key: object.key,
        hash: object.etag,
    }))
}
