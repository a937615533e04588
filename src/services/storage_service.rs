//! src/services/storage_service.rs
//!
//! StorageService: the reference backend's object store. Metadata lives in
//! SQLite, payloads on local disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}.{id}`. Every write produces a new
//! payload file named by the row id it commits, so a row never points at bytes
//! of another version. Besides whole-object uploads it
//! assembles composed objects from uploaded attachments and byte ranges of
//! stored objects.

use crate::models::{
    manifest::{CopyRange, RangeEnd},
    object::Object,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("no attachment uploaded for direct part {0}")]
    MissingAttachment(usize),
    #[error("direct part {part}: crc32 {actual:#010x} does not match declared {expected:#010x}")]
    ChecksumMismatch {
        part: usize,
        expected: u32,
        actual: u32,
    },
    #[error("range {range} of `{key}` is outside its {size} bytes")]
    RangeNotSatisfiable {
        key: String,
        range: String,
        size: u64,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One uploaded direct part, spooled to disk with its length and CRC32.
/// The file is removed when the attachment is dropped.
#[derive(Debug)]
pub struct StagedAttachment {
    file: NamedTempFile,
    pub len: u64,
    pub crc32: u32,
}

impl StagedAttachment {
    async fn reader(&self) -> io::Result<File> {
        Ok(File::from_std(self.file.reopen()?))
    }
}

/// A resolved compose part, in manifest order.
#[derive(Debug)]
pub enum ComposeSource {
    /// Uploaded bytes; a declared `crc32` of 0 skips verification.
    Direct {
        attachment: StagedAttachment,
        crc32: u32,
    },
    /// Bytes of an object stored in the same bucket.
    Copy { key: String, range: CopyRange },
}

/// StorageService provides the operations the reference backend serves:
/// - Upload an object (streams bytes to disk and upserts metadata)
/// - Get object (reads metadata from SQLite and payload from disk)
/// - Compose an object from attachments and ranges of stored objects
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const COPY_CHUNK: usize = 64 * 1024;
const OPEN_RETRIES: usize = 3;

/// A payload being written: `tmp_path` is renamed to `file_path` before the
/// row naming `id` is committed.
struct PendingPayload {
    id: Uuid,
    tmp_path: PathBuf,
    file_path: PathBuf,
}

impl StorageService {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = migration_statements(MIGRATION);
        debug!("running {} migration statements", statements.len());
        for stmt in &statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Rejects empty or oversized keys, keys beginning with `/`, and keys
    /// containing `..` or control characters.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Bucket names become directory names: 3-63 lowercase letters, digits,
    /// dots and hyphens, alphanumeric at both ends, not shaped like an IPv4
    /// address.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&name.len()) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }
        Ok(())
    }

    fn ensure_target_safe(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.ensure_bucket_name_safe(bucket)?;
        self.ensure_key_safe(key)
    }

    /// Two-level shard directories from MD5(bucket/key).
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `base_path/bucket/{shard}/{shard}/{key}.{id}`. Parent directories may
    /// not exist yet.
    fn payload_path(&self, bucket_name: &str, key: &str, id: Uuid) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.base_path.join(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(format!("{}.{}", key, id.simple()));
        path
    }

    fn uploads_dir(&self) -> PathBuf {
        self.base_path.join(".uploads")
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket, key, content_type, size_bytes, etag, last_modified
             FROM objects
             WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Current row together with an open handle on the payload it names.
    ///
    /// A concurrent commit deletes the superseded payload after switching the
    /// row, so a lookup racing it can find its file gone. The lookup is
    /// repeated then. Once open, the handle keeps reading that version.
    async fn open_current(&self, bucket: &str, key: &str) -> StorageResult<(Object, File)> {
        let mut attempt = 0;
        loop {
            let object = self.fetch_object(bucket, key).await?;
            match File::open(self.payload_path(bucket, key, object.id)).await {
                Ok(file) => return Ok((object, file)),
                Err(err) if err.kind() == ErrorKind::NotFound && attempt < OPEN_RETRIES => {
                    debug!("payload of {}/{} replaced while opening, retrying", bucket, key);
                    attempt += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::ObjectNotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    });
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
    }

    /// Fresh version id plus a temp file in the directory of its payload, so
    /// the commit is a rename within one directory.
    async fn temp_payload(&self, bucket: &str, key: &str) -> StorageResult<PendingPayload> {
        let id = Uuid::new_v4();
        let file_path = self.payload_path(bucket, key, id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        Ok(PendingPayload {
            id,
            tmp_path,
            file_path,
        })
    }

    /// Stream-upload an object to disk and upsert its metadata.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_target_safe(bucket, key)?;
        let pending = self.temp_payload(bucket, key).await?;

        let written = write_stream(&pending.tmp_path, stream).await;
        let (size_bytes, digest) = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&pending.tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };

        self.commit(bucket, key, content_type, pending, size_bytes, digest)
            .await
    }

    /// Spool one multipart attachment under `base_path/.uploads`.
    pub async fn stage_attachment<S>(&self, stream: S) -> StorageResult<StagedAttachment>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let dir = self.uploads_dir();
        fs::create_dir_all(&dir).await?;
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix(".part-").tempfile_in(dir)
        })
        .await
        .map_err(io::Error::other)??;

        let mut file = File::from_std(named.as_file().try_clone()?);
        let mut hasher = crc32fast::Hasher::new();
        let mut len = 0u64;
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            len += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(StagedAttachment {
            file: named,
            len,
            crc32: hasher.finalize(),
        })
    }

    /// Assemble `sources` in order into a new payload for `bucket/key` and
    /// atomically replace whatever was stored there. Copy sources read the
    /// object currently stored, so a compose may copy from its own target.
    pub async fn compose_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        sources: Vec<ComposeSource>,
    ) -> StorageResult<Object> {
        self.ensure_target_safe(bucket, key)?;
        let pending = self.temp_payload(bucket, key).await?;

        let assembled = self.assemble(bucket, &pending.tmp_path, sources).await;
        let (size_bytes, digest) = match assembled {
            Ok(assembled) => assembled,
            Err(err) => {
                let _ = fs::remove_file(&pending.tmp_path).await;
                return Err(err);
            }
        };

        debug!("composed {}/{} ({} bytes)", bucket, key, size_bytes);
        self.commit(bucket, key, content_type, pending, size_bytes, digest)
            .await
    }

    async fn assemble(
        &self,
        bucket: &str,
        tmp_path: &Path,
        sources: Vec<ComposeSource>,
    ) -> StorageResult<(i64, Context)> {
        let mut file = File::create(tmp_path).await?;
        let mut digest = Context::new();
        let mut size_bytes = 0u64;

        for (part, source) in sources.into_iter().enumerate() {
            match source {
                ComposeSource::Direct { attachment, crc32 } => {
                    if crc32 != 0 && crc32 != attachment.crc32 {
                        return Err(StorageError::ChecksumMismatch {
                            part,
                            expected: crc32,
                            actual: attachment.crc32,
                        });
                    }
                    let mut reader = attachment.reader().await?;
                    size_bytes += copy_hashed(&mut reader, &mut file, &mut digest).await?;
                }
                ComposeSource::Copy { key, range } => {
                    self.ensure_key_safe(&key)?;
                    let (source, mut payload) = self.open_current(bucket, &key).await?;
                    let size = source.size_bytes.max(0) as u64;
                    let beyond = match range.to {
                        RangeEnd::At(to) => to > size,
                        RangeEnd::OpenEnded => range.from > size,
                    };
                    if beyond {
                        return Err(StorageError::RangeNotSatisfiable {
                            key,
                            range: range.to_string(),
                            size,
                        });
                    }
                    payload.seek(SeekFrom::Start(range.from)).await?;
                    let mut reader = payload.take(range.resolve(size));
                    size_bytes += copy_hashed(&mut reader, &mut file, &mut digest).await?;
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok((size_bytes as i64, digest))
    }

    /// Move the finished temp file to its versioned path and point the
    /// metadata row at it. The superseded payload is deleted afterwards.
    async fn commit(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        pending: PendingPayload,
        size_bytes: i64,
        digest: Context,
    ) -> StorageResult<Object> {
        if let Err(err) = fs::rename(&pending.tmp_path, &pending.file_path).await {
            let _ = fs::remove_file(&pending.tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let etag = format!("{:x}", digest.compute());
        let (object, previous) = match self
            .upsert(bucket, key, content_type, pending.id, size_bytes, &etag)
            .await
        {
            Ok(upserted) => upserted,
            Err(err) => {
                let _ = fs::remove_file(&pending.file_path).await;
                return Err(err);
            }
        };

        if let Some(previous) = previous {
            let stale = self.payload_path(bucket, key, previous);
            if let Err(err) = fs::remove_file(&stale).await {
                if err.kind() != ErrorKind::NotFound {
                    warn!("failed to remove superseded payload {:?}: {}", stale, err);
                }
            }
        }
        Ok(object)
    }

    /// Replace the row for `bucket/key` with version `id`, returning the new
    /// row and the id it replaced.
    async fn upsert(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        id: Uuid,
        size_bytes: i64,
        etag: &str,
    ) -> StorageResult<(Object, Option<Uuid>)> {
        let mut tx = self.db.begin().await?;
        let previous = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM objects WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let object = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (
                id, bucket, key, content_type, size_bytes, etag, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                id = excluded.id,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING id, bucket, key, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(id)
        .bind(bucket)
        .bind(key)
        .bind(content_type)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((object, previous))
    }

    /// Metadata plus an open payload handle ready for streaming out.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, File)> {
        self.ensure_target_safe(bucket, key)?;
        self.open_current(bucket, key).await
    }

    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_target_safe(bucket, key)?;
        self.fetch_object(bucket, key).await
    }
}

/// Split a SQL script into statements. `--` comment lines are dropped first
/// so punctuation inside them cannot end a statement.
fn migration_statements(script: &str) -> Vec<String> {
    let code = script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    code.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .map(str::to_string)
        .collect()
}

async fn write_stream<S>(tmp_path: &Path, stream: S) -> io::Result<(i64, Context)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut file = File::create(tmp_path).await?;
    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as i64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((size_bytes, digest))
}

async fn copy_hashed<R>(reader: &mut R, file: &mut File, digest: &mut Context) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(copied);
        }
        digest.consume(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
}

/// True for names in dotted-decimal IPv4 form such as `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;

    async fn service() -> (TempDir, StorageService) {
        let dir = TempDir::new().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("meta.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        let service = StorageService::new(Arc::new(pool), dir.path().join("objects"));
        service.migrate().await.unwrap();
        (dir, service)
    }

    fn body(bytes: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(vec![Ok(Bytes::from_static(bytes))])
    }

    async fn read_all(service: &StorageService, key: &str) -> Vec<u8> {
        let (_, mut file) = service.get_object_reader("reg", key).await.unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn ipv4_shaped_names_are_detected() {
        assert!(is_ipv4_like("192.168.0.1"));
        assert!(!is_ipv4_like("192.168.0"));
        assert!(!is_ipv4_like("256.1.1.1"));
        assert!(!is_ipv4_like("a.b.c.d"));
    }

    #[test]
    fn comment_lines_do_not_split_statements() {
        let script = "-- header; with a semicolon\nCREATE TABLE t (a INT);\n\n-- tail;\nCREATE INDEX i ON t (a);\n";
        assert_eq!(
            migration_statements(script),
            vec!["CREATE TABLE t (a INT)", "CREATE INDEX i ON t (a)"]
        );
    }

    #[tokio::test]
    async fn migrate_runs_on_fresh_database() {
        let dir = TempDir::new().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("fresh.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        let service = StorageService::new(Arc::new(pool), dir.path().join("objects"));
        service.migrate().await.unwrap();
        service.migrate().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects")
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn unsafe_keys_and_buckets_are_rejected() {
        let (_dir, service) = service().await;
        for key in ["", "/abs", "a/../b", "tab\there"] {
            assert!(matches!(
                service.get_object_metadata("reg", key).await,
                Err(StorageError::InvalidObjectKey)
            ));
        }
        assert!(matches!(
            service.get_object_metadata("Reg", "k").await,
            Err(StorageError::InvalidBucketName { .. })
        ));
    }

    #[tokio::test]
    async fn upload_overwrites_in_place() {
        let (_dir, service) = service().await;
        service
            .upload_object_stream("reg", "a/b", None, body(b"first"))
            .await
            .unwrap();
        let object = service
            .upload_object_stream("reg", "a/b", Some("text/plain".into()), body(b"second"))
            .await
            .unwrap();
        assert_eq!(object.size_bytes, 6);
        assert_eq!(object.etag, format!("{:x}", md5::compute(b"second")));
        assert_eq!(read_all(&service, "a/b").await, b"second");
    }

    #[tokio::test]
    async fn overwrite_writes_new_payload_and_drops_the_old_one() {
        let (_dir, service) = service().await;
        let first = service
            .upload_object_stream("reg", "a/b", None, body(b"first"))
            .await
            .unwrap();
        let second = service
            .upload_object_stream("reg", "a/b", None, body(b"second!"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert!(!service.payload_path("reg", "a/b", first.id).exists());
        let current = service.payload_path("reg", "a/b", second.id);
        assert_eq!(std::fs::metadata(current).unwrap().len(), 7);
    }

    #[tokio::test]
    async fn open_reader_keeps_its_version_across_overwrite() {
        let (_dir, service) = service().await;
        service
            .upload_object_stream("reg", "blob", None, body(b"old"))
            .await
            .unwrap();
        let (meta, mut file) = service.get_object_reader("reg", "blob").await.unwrap();

        service
            .upload_object_stream("reg", "blob", None, body(b"brand new"))
            .await
            .unwrap();

        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"old");
        assert_eq!(meta.size_bytes, out.len() as i64);
        assert_eq!(read_all(&service, "blob").await, b"brand new");
    }

    #[tokio::test]
    async fn failed_compose_keeps_previous_version() {
        let (_dir, service) = service().await;
        let stored = service
            .upload_object_stream("reg", "blob", None, body(b"0123"))
            .await
            .unwrap();
        let attachment = service.stage_attachment(body(b"xy")).await.unwrap();
        service
            .compose_object(
                "reg",
                "blob",
                None,
                vec![ComposeSource::Direct {
                    attachment,
                    crc32: 7,
                }],
            )
            .await
            .unwrap_err();

        let meta = service.get_object_metadata("reg", "blob").await.unwrap();
        assert_eq!(meta.id, stored.id);
        assert_eq!(read_all(&service, "blob").await, b"0123");
    }

    #[tokio::test]
    async fn compose_splices_attachment_into_stored_object() {
        let (_dir, service) = service().await;
        service
            .upload_object_stream("reg", "blob", None, body(b"0123456789"))
            .await
            .unwrap();
        let attachment = service.stage_attachment(body(b"xy")).await.unwrap();
        assert_eq!(attachment.crc32, crc32fast::hash(b"xy"));

        let sources = vec![
            ComposeSource::Copy {
                key: "blob".into(),
                range: CopyRange::bounded(0, 3),
            },
            ComposeSource::Direct {
                attachment,
                crc32: crc32fast::hash(b"xy"),
            },
            ComposeSource::Copy {
                key: "blob".into(),
                range: CopyRange::open(5),
            },
        ];
        let object = service
            .compose_object("reg", "blob", None, sources)
            .await
            .unwrap();
        assert_eq!(object.size_bytes, 10);
        assert_eq!(read_all(&service, "blob").await, b"012xy56789");
    }

    #[tokio::test]
    async fn compose_rejects_checksum_mismatch() {
        let (_dir, service) = service().await;
        let attachment = service.stage_attachment(body(b"xy")).await.unwrap();
        let err = service
            .compose_object(
                "reg",
                "blob",
                None,
                vec![ComposeSource::Direct {
                    attachment,
                    crc32: 7,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { part: 0, .. }));
        assert!(matches!(
            service.get_object_metadata("reg", "blob").await,
            Err(StorageError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn compose_rejects_ranges_past_the_source() {
        let (_dir, service) = service().await;
        service
            .upload_object_stream("reg", "blob", None, body(b"0123"))
            .await
            .unwrap();
        let err = service
            .compose_object(
                "reg",
                "out",
                None,
                vec![ComposeSource::Copy {
                    key: "blob".into(),
                    range: CopyRange::bounded(2, 9),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RangeNotSatisfiable { size: 4, .. }));
    }

    #[tokio::test]
    async fn compose_from_missing_source_is_not_found() {
        let (_dir, service) = service().await;
        let err = service
            .compose_object(
                "reg",
                "out",
                None,
                vec![ComposeSource::Copy {
                    key: "nope".into(),
                    range: CopyRange::open(0),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ObjectNotFound { .. }));
    }
}
