//! CRC32 (IEEE) over direct part payloads.
//!
//! Computing the checksum consumes the source once and rewinds it so the same
//! reader can be handed to the upload pass. Sources that cannot be rewound are
//! rejected before any byte is read.

use crate::{errors::WriteError, services::staging::PartReader};
use std::io::{self, SeekFrom};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

const CHUNK: usize = 64 * 1024;

/// Hash `reader` to the end and seek it back to the start.
pub async fn checksum_and_rewind<R>(reader: &mut R) -> io::Result<u32>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    reader.seek(SeekFrom::Start(0)).await?;
    Ok(hasher.finalize())
}

/// Checksum of direct part `part`, leaving `reader` positioned at the start.
pub async fn checksum_part(reader: &mut PartReader, part: usize) -> Result<u32, WriteError> {
    match reader {
        PartReader::Rewindable { reader, .. } => checksum_and_rewind(reader)
            .await
            .map_err(|source| WriteError::ReadFailure {
                part: Some(part),
                source,
            }),
        PartReader::OneShot(_) => Err(WriteError::SourceNotSeekable { part }),
    }
}
