//! Re-readable payload sources for direct parts.
//!
//! `StagingBuffer` holds one write call's input. Small inputs stay in memory;
//! once the input grows past the spool threshold the buffered prefix and the
//! rest of the stream are spooled to an anonymous temp file which is removed
//! when the buffer is dropped. Every call to [`StagingBuffer::reader`] yields
//! an independent reader positioned at the start.

use bytes::{Bytes, BytesMut};
use std::{
    io::{self, Cursor, SeekFrom},
    pin::Pin,
    task::{Context, Poll},
};
use tempfile::NamedTempFile;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncWriteExt, ReadBuf},
};
use tracing::debug;

const READ_CHUNK: usize = 64 * 1024;
const STAGING_PREFIX: &str = "compose-stage-";

/// Readers that can be rewound to the start.
pub trait AsyncReadSeek: AsyncRead + AsyncSeek + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Sync + Unpin> AsyncReadSeek for T {}

enum Spool {
    Memory(Bytes),
    Disk(NamedTempFile),
}

pub struct StagingBuffer {
    spool: Spool,
    len: u64,
}

impl StagingBuffer {
    /// Read `reader` to the end, spilling to disk once more than
    /// `spool_threshold` bytes have been buffered.
    pub async fn stage<R>(reader: &mut R, spool_threshold: usize) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = BytesMut::with_capacity(READ_CHUNK.min(spool_threshold.max(1)));
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                let bytes = buf.freeze();
                return Ok(Self {
                    len: bytes.len() as u64,
                    spool: Spool::Memory(bytes),
                });
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() > spool_threshold {
                break;
            }
        }

        let named = tokio::task::spawn_blocking(|| {
            tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempfile()
        })
        .await
        .map_err(io::Error::other)??;
        let mut file = File::from_std(named.as_file().try_clone()?);
        file.write_all(&buf).await?;
        let copied = tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;

        let len = buf.len() as u64 + copied;
        debug!(
            "spooled {} staged bytes to {}",
            len,
            named.path().display()
        );
        Ok(Self {
            spool: Spool::Disk(named),
            len,
        })
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            len: bytes.len() as u64,
            spool: Spool::Memory(bytes),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self.spool, Spool::Disk(_))
    }

    /// Fresh reader over the staged bytes, positioned at the start.
    pub async fn reader(&self) -> io::Result<Box<dyn AsyncReadSeek>> {
        match &self.spool {
            Spool::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Spool::Disk(named) => Ok(Box::new(File::from_std(named.reopen()?))),
        }
    }
}

/// A fixed-length run of zero bytes.
#[derive(Debug, Clone)]
pub struct ZeroFill {
    len: u64,
    pos: u64,
}

impl ZeroFill {
    pub fn new(len: u64) -> Self {
        Self { len, pos: 0 }
    }
}

impl AsyncRead for ZeroFill {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let remaining = self.len.saturating_sub(self.pos);
        let n = remaining.min(buf.remaining() as u64) as usize;
        buf.initialize_unfilled_to(n).fill(0);
        buf.advance(n);
        self.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for ZeroFill {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let target = match position {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        self.pos = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of zero fill")
        })?;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}

/// Byte source of one direct part.
pub enum PartBody {
    Staged(StagingBuffer),
    Zeros(u64),
    Bytes(Bytes),
    /// A stream that can be read exactly once.
    OneShot {
        reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
        len: u64,
    },
}

impl PartBody {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        match self {
            PartBody::Staged(buffer) => buffer.len(),
            PartBody::Zeros(len) => *len,
            PartBody::Bytes(bytes) => bytes.len() as u64,
            PartBody::OneShot { len, .. } => *len,
        }
    }

    /// Open the body for reading. The staging buffer, if any, moves into the
    /// reader and is released when the reader is dropped.
    pub async fn open(self) -> io::Result<PartReader> {
        Ok(match self {
            PartBody::Staged(buffer) => PartReader::Rewindable {
                reader: buffer.reader().await?,
                _staging: Some(buffer),
            },
            PartBody::Zeros(len) => PartReader::Rewindable {
                reader: Box::new(ZeroFill::new(len)),
                _staging: None,
            },
            PartBody::Bytes(bytes) => PartReader::Rewindable {
                reader: Box::new(Cursor::new(bytes)),
                _staging: None,
            },
            PartBody::OneShot { reader, .. } => PartReader::OneShot(reader),
        })
    }
}

pub enum PartReader {
    Rewindable {
        reader: Box<dyn AsyncReadSeek>,
        _staging: Option<StagingBuffer>,
    },
    OneShot(Box<dyn AsyncRead + Send + Sync + Unpin>),
}

impl AsyncRead for PartReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PartReader::Rewindable { reader, .. } => Pin::new(reader).poll_read(cx, buf),
            PartReader::OneShot(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}
