//! End-to-end writes against the reference backend on an ephemeral port.

use axum::{Json, Router, extract::Multipart, routing::post};
use bytes::Bytes;
use compose_store::{
    config::WriterConfig,
    errors::WriteError,
    models::{
        manifest::{CopyRange, DirectPart, PartManifest},
        object::PutRet,
        policy::PutPolicy,
    },
    routes,
    services::{
        backend::{HttpBackend, ObjectBackend},
        compose_client::ComposeClient,
        encoder::ComposeRequest,
        staging::PartBody,
        storage_service::StorageService,
        stream_writer::StreamWriter,
    },
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncRead, ReadBuf},
    net::TcpListener,
};

const BUCKET: &str = "registry";
const SEED: &[u8] = b"0123456789";

struct TestBackend {
    _dir: TempDir,
    endpoint: String,
    http: reqwest::Client,
}

impl TestBackend {
    async fn spawn() -> Self {
        let dir = TempDir::new().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("meta.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .unwrap();
        let storage = StorageService::new(Arc::new(pool), dir.path().join("objects"));
        storage.migrate().await.unwrap();

        let app = routes::routes::routes().with_state(storage);
        let endpoint = serve(app).await;
        Self {
            _dir: dir,
            endpoint,
            http: reqwest::Client::new(),
        }
    }

    fn backend(&self) -> HttpBackend {
        HttpBackend::new(self.http.clone(), self.endpoint.clone(), BUCKET)
    }

    fn writer_with(&self, config: impl FnOnce(&mut WriterConfig)) -> StreamWriter<HttpBackend> {
        let mut cfg = WriterConfig::new(self.endpoint.clone(), BUCKET);
        config(&mut cfg);
        StreamWriter::new(cfg, self.backend(), self.http.clone())
    }

    fn writer(&self) -> StreamWriter<HttpBackend> {
        self.writer_with(|_| {})
    }

    fn compose_client(&self) -> ComposeClient {
        ComposeClient::new(self.http.clone(), self.endpoint.clone())
    }

    async fn read(&self, key: &str) -> Vec<u8> {
        self.backend().get_object(key).await.unwrap().to_vec()
    }

    async fn seeded(key: &str) -> Self {
        let backend = Self::spawn().await;
        backend.writer().write_at_offset(key, 0, SEED).await.unwrap();
        backend
    }
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn token_for(scope: &str, keys: &[&str]) -> String {
    PutPolicy::new(
        scope,
        Duration::from_secs(60),
        keys.iter().map(|k| k.to_string()).collect(),
    )
    .encode()
    .unwrap()
}

#[tokio::test]
async fn absent_object_is_created_by_whole_put() {
    let backend = TestBackend::spawn().await;
    let written = backend
        .writer()
        .write_at_offset("docker/blob", 0, &b"hello"[..])
        .await
        .unwrap();
    assert_eq!(written, 5);
    assert_eq!(backend.read("docker/blob").await, b"hello");

    let stat = backend.backend().probe_size("docker/blob").await.unwrap();
    assert_eq!(stat.size, 5);
    assert_eq!(stat.etag.as_deref(), Some(format!("{:x}", md5::compute(b"hello")).as_str()));
}

#[tokio::test]
async fn overwrite_at_start_keeps_tail() {
    let backend = TestBackend::seeded("blob").await;
    backend.writer().write_at_offset("blob", 0, &b"ab"[..]).await.unwrap();
    assert_eq!(backend.read("blob").await, b"ab23456789");
}

#[tokio::test]
async fn overwrite_in_middle_keeps_both_sides() {
    let backend = TestBackend::seeded("blob").await;
    backend.writer().write_at_offset("blob", 4, &b"xy"[..]).await.unwrap();
    assert_eq!(backend.read("blob").await, b"0123xy6789");
}

#[tokio::test]
async fn overwrite_reaching_the_end_drops_tail() {
    let backend = TestBackend::seeded("blob").await;
    backend.writer().write_at_offset("blob", 8, &b"xy"[..]).await.unwrap();
    assert_eq!(backend.read("blob").await, b"01234567xy");
}

#[tokio::test]
async fn overwrite_past_the_end_extends() {
    let backend = TestBackend::seeded("blob").await;
    backend
        .writer()
        .write_at_offset("blob", 8, &b"wxyz"[..])
        .await
        .unwrap();
    assert_eq!(backend.read("blob").await, b"01234567wxyz");
}

#[tokio::test]
async fn write_at_end_appends() {
    let backend = TestBackend::seeded("blob").await;
    backend.writer().write_at_offset("blob", 10, &b"ab"[..]).await.unwrap();
    assert_eq!(backend.read("blob").await, b"0123456789ab");
}

#[tokio::test]
async fn write_past_end_zero_fills_gap() {
    let backend = TestBackend::seeded("blob").await;
    backend.writer().write_at_offset("blob", 13, &b"ab"[..]).await.unwrap();
    assert_eq!(backend.read("blob").await, b"0123456789\0\0\0ab");
}

#[tokio::test]
async fn absent_object_past_zero_is_zero_filled() {
    let backend = TestBackend::spawn().await;
    backend
        .writer()
        .write_at_offset("fresh", 3, &b"ab"[..])
        .await
        .unwrap();
    assert_eq!(backend.read("fresh").await, b"\0\0\0ab");
}

#[tokio::test]
async fn empty_write_inside_object_changes_nothing() {
    let backend = TestBackend::seeded("blob").await;
    let written = backend
        .writer()
        .write_at_offset("blob", 5, &b""[..])
        .await
        .unwrap();
    assert_eq!(written, 0);
    assert_eq!(backend.read("blob").await, SEED);
}

#[tokio::test]
async fn repeated_overwrite_is_idempotent() {
    let backend = TestBackend::seeded("blob").await;
    let writer = backend.writer();
    writer.write_at_offset("blob", 3, &b"abc"[..]).await.unwrap();
    let first = backend.read("blob").await;
    writer.write_at_offset("blob", 3, &b"abc"[..]).await.unwrap();
    assert_eq!(backend.read("blob").await, first);
    assert_eq!(first, b"012abc6789");
}

#[tokio::test]
async fn spooled_input_composes_like_buffered_input() {
    let backend = TestBackend::spawn().await;
    let base: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let patch: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8 + 100).collect();

    let writer = backend.writer_with(|cfg| cfg.spool_threshold = 1024);
    writer.write_at_offset("big", 0, &base[..]).await.unwrap();
    writer
        .write_at_offset("big", 50_000, &patch[..])
        .await
        .unwrap();

    let mut expected = base.clone();
    expected[50_000..150_000].copy_from_slice(&patch);
    assert_eq!(backend.read("big").await, expected);
}

#[tokio::test]
async fn unchecked_parts_are_accepted() {
    let backend = TestBackend::seeded("blob").await;
    backend
        .writer_with(|cfg| cfg.check_crc = false)
        .write_at_offset("blob", 2, &b"--"[..])
        .await
        .unwrap();
    assert_eq!(backend.read("blob").await, b"01--456789");
}

#[tokio::test]
async fn token_for_another_key_is_rejected() {
    let backend = TestBackend::seeded("blob").await;
    let mut manifest = PartManifest::new(None);
    manifest.push_direct(DirectPart::new(PartBody::Bytes(Bytes::from_static(b"x"))));

    let err = backend
        .compose_client()
        .put_parts(ComposeRequest::new(
            token_for("registry:other", &["other"]),
            Some("blob".into()),
            manifest,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, WriteError::ComposeRejected { status: 401, .. }));
    assert_eq!(backend.read("blob").await, SEED);
}

#[tokio::test]
async fn wrong_checksum_is_rejected() {
    let backend = TestBackend::seeded("blob").await;
    let mut manifest = PartManifest::new(None);
    manifest
        .push_copy("blob", CopyRange::bounded(0, 2))
        .push_direct(
            DirectPart::new(PartBody::Bytes(Bytes::from_static(b"xy")))
                .with_crc32(crc32fast::hash(b"yx"))
                .check_crc(true),
        );

    let err = backend
        .compose_client()
        .put_parts(ComposeRequest::new(
            token_for("registry:blob", &[]),
            Some("blob".into()),
            manifest,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, WriteError::ComposeRejected { status: 400, .. }));
    assert_eq!(backend.read("blob").await, SEED);
}

#[tokio::test]
async fn missing_copy_source_is_not_found() {
    let backend = TestBackend::spawn().await;
    let mut manifest = PartManifest::new(None);
    manifest.push_copy("nowhere", CopyRange::open(0));

    let err = backend
        .compose_client()
        .put_parts(ComposeRequest::new(
            token_for("registry", &[]),
            Some("out".into()),
            manifest,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, WriteError::ComposeRejected { status: 404, .. }));
}

#[tokio::test]
async fn compose_without_key_gets_one_assigned() {
    let backend = TestBackend::spawn().await;
    let mut manifest = PartManifest::new(Some("text/plain".into()));
    manifest.push_direct(
        DirectPart::new(PartBody::Bytes(Bytes::from_static(b"anon"))).check_crc(true),
    );

    let ret = backend
        .compose_client()
        .put_parts(ComposeRequest::new(token_for("registry", &[]), None, manifest))
        .await
        .unwrap();
    assert!(!ret.key.is_empty());
    assert_eq!(ret.hash, format!("{:x}", md5::compute(b"anon")));
    assert_eq!(backend.read(&ret.key).await, b"anon");
}

#[tokio::test]
async fn invalid_range_never_reaches_the_network() {
    // Nothing listens on the discard port.
    let client = ComposeClient::new(reqwest::Client::new(), "http://127.0.0.1:9");
    let mut manifest = PartManifest::new(None);
    manifest.push_copy("blob", CopyRange::bounded(10, 10));

    let err = client
        .put_parts(ComposeRequest::new("t", Some("blob".into()), manifest))
        .await
        .unwrap_err();
    assert!(matches!(err, WriteError::InvalidManifest(_)));
}

#[tokio::test]
async fn one_shot_source_cannot_be_checksummed() {
    let client = ComposeClient::new(reqwest::Client::new(), "http://127.0.0.1:9");
    let mut manifest = PartManifest::new(None);
    manifest.push_direct(
        DirectPart::new(PartBody::OneShot {
            reader: Box::new(&b"stream"[..]),
            len: 6,
        })
        .check_crc(true),
    );

    let err = client
        .put_parts(ComposeRequest::new("t", Some("blob".into()), manifest))
        .await
        .unwrap_err();
    assert!(matches!(err, WriteError::SourceNotSeekable { part: 0 }));
}

/// Yields one chunk, then fails as a dropped upstream connection would.
struct CutOffStream {
    sent: bool,
}

impl AsyncRead for CutOffStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "upstream closed",
            )));
        }
        self.sent = true;
        buf.put_slice(b"abc");
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn one_shot_stream_failing_mid_upload_names_its_part() {
    let app = Router::new().route(
        "/parts",
        post(|mut multipart: Multipart| async move {
            while let Ok(Some(field)) = multipart.next_field().await {
                if field.bytes().await.is_err() {
                    break;
                }
            }
            Json(PutRet {
                key: "k".into(),
                hash: "h".into(),
            })
        }),
    );
    let endpoint = serve(app).await;

    let mut manifest = PartManifest::new(None);
    manifest
        .push_direct(DirectPart::new(PartBody::Bytes(Bytes::from_static(b"ok"))))
        .push_direct(DirectPart::new(PartBody::OneShot {
            reader: Box::new(CutOffStream { sent: false }),
            len: 6,
        }));

    let err = ComposeClient::new(reqwest::Client::new(), endpoint)
        .put_parts(ComposeRequest::new("t", Some("k".into()), manifest))
        .await
        .unwrap_err();
    assert!(
        matches!(err, WriteError::TransportFailure { part: Some(1), .. }),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn form_fields_arrive_in_fixed_order() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = seen.clone();
    let app = Router::new().route(
        "/parts",
        post(move |mut multipart: Multipart| {
            let recorder = recorder.clone();
            async move {
                while let Some(field) = multipart.next_field().await.unwrap() {
                    let name = field.name().unwrap_or_default().to_string();
                    field.bytes().await.unwrap();
                    recorder.lock().unwrap().push(name);
                }
                Json(PutRet {
                    key: "k".into(),
                    hash: "h".into(),
                })
            }
        }),
    );
    let endpoint = serve(app).await;

    let mut manifest = PartManifest::new(None);
    manifest
        .push_copy("k", CopyRange::open(0))
        .push_direct(DirectPart::new(PartBody::Zeros(3)).check_crc(true));
    let request = ComposeRequest::new("t", Some("k".into()), manifest)
        .with_param("x:zeta", "2")
        .with_param("x:alpha", "1");

    let ret = ComposeClient::new(reqwest::Client::new(), endpoint)
        .put_parts(request)
        .await
        .unwrap();
    assert_eq!(ret.key, "k");
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        ["token", "key", "x:alpha", "x:zeta", "part-1", "parts"]
    );
}
