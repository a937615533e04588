//! Routes of the reference compose backend.
//!
//! - `GET  /healthz`, `GET /readyz`
//! - `POST /parts` compose an object from a multipart manifest
//! - `PUT | GET | HEAD /{bucket}/{*key}` whole-object operations
//!
//! The wildcard `*key` allows nested keys like `docker/registry/v2/blobs/data`.

use crate::{
    handlers::{
        compose_handlers::compose_object,
        health_handlers::{healthz, readyz},
        object_handlers::{get_object, head_object, upload_object},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router. Object bodies are streamed to disk, so the default
/// request body limit is lifted.
pub fn routes() -> Router<StorageService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/parts", post(compose_object))
        .route(
            "/{bucket}/{*key}",
            put(upload_object).get(get_object).head(head_object),
        )
        .layer(DefaultBodyLimit::disable())
}
