//! Represents an object (blob) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata row for a stored object.
///
/// Objects are immutable once written: a compose or whole-object PUT under
/// the same key writes a new payload file and points the row at it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Version id. Changes on every write and names the payload file.
    pub id: Uuid,

    /// Bucket namespace the key lives in.
    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: String,

    /// Timestamp when the current version was written.
    pub last_modified: DateTime<Utc>,
}

/// Size and existence information returned by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Body returned by a successful compose.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PutRet {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub hash: String,
}
