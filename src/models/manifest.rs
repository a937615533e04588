//! Part manifests for the compose operation.
//!
//! Two views of the same manifest live here:
//! - [`ManifestPlan`] is what the offset planner produces. It is pure data
//!   (no payload bodies) and can be compared and cloned freely.
//! - [`PartManifest`] is what the transport encoder consumes. Its direct parts
//!   own the byte sources that will be streamed to the backend.
//!
//! [`WireManifest`] is the JSON document sent in the final `parts` field of
//! the compose request and decoded again by the reference backend.

use crate::{errors::WriteError, services::staging::PartBody};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Wire value of an open-ended range end.
pub const OPEN_ENDED: i64 = -1;

/// End of a copy range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEnd {
    /// Exclusive byte offset.
    At(u64),
    /// Through the end of the source object at compose time.
    OpenEnded,
}

/// Half-open byte range `[from, to)` of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRange {
    pub from: u64,
    pub to: RangeEnd,
}

impl CopyRange {
    pub fn bounded(from: u64, to: u64) -> Self {
        Self {
            from,
            to: RangeEnd::At(to),
        }
    }

    pub fn open(from: u64) -> Self {
        Self {
            from,
            to: RangeEnd::OpenEnded,
        }
    }

    /// A bounded range must end strictly after it starts.
    pub fn is_valid(&self) -> bool {
        match self.to {
            RangeEnd::At(to) => to > self.from,
            RangeEnd::OpenEnded => true,
        }
    }

    /// Number of bytes this range contributes when copied from a source of
    /// `source_len` bytes.
    pub fn resolve(&self, source_len: u64) -> u64 {
        let end = match self.to {
            RangeEnd::At(to) => to.min(source_len),
            RangeEnd::OpenEnded => source_len,
        };
        end.saturating_sub(self.from)
    }
}

impl fmt::Display for CopyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to {
            RangeEnd::At(to) => write!(f, "{}-{}", self.from, to),
            RangeEnd::OpenEnded => write!(f, "{}-{}", self.from, OPEN_ENDED),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed copy range `{0}`")]
pub struct RangeParseError(pub String);

impl FromStr for CopyRange {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RangeParseError(s.to_string());
        let (from, to) = s.split_once('-').ok_or_else(malformed)?;
        let from = from.parse::<u64>().map_err(|_| malformed())?;
        let to = match to.parse::<i64>().map_err(|_| malformed())? {
            OPEN_ENDED => RangeEnd::OpenEnded,
            to if to >= 0 => RangeEnd::At(to as u64),
            _ => return Err(malformed()),
        };
        let range = CopyRange { from, to };
        if range.is_valid() {
            Ok(range)
        } else {
            Err(malformed())
        }
    }
}

/// Where a planned direct part gets its bytes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectSource {
    /// The bytes staged for this write call.
    NewData { len: u64 },
    /// A run of zero bytes filling the gap past the current end.
    ZeroFill { len: u64 },
}

impl DirectSource {
    pub fn len(&self) -> u64 {
        match *self {
            DirectSource::NewData { len } | DirectSource::ZeroFill { len } => len,
        }
    }
}

/// One planned manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartSpec {
    Direct(DirectSource),
    Copy { key: String, range: CopyRange },
}

impl PartSpec {
    pub fn new_data(len: u64) -> Self {
        PartSpec::Direct(DirectSource::NewData { len })
    }

    pub fn zero_fill(len: u64) -> Self {
        PartSpec::Direct(DirectSource::ZeroFill { len })
    }

    pub fn copy(key: &str, range: CopyRange) -> Self {
        PartSpec::Copy {
            key: key.to_string(),
            range,
        }
    }
}

/// Ordered list of planned parts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestPlan {
    pub parts: Vec<PartSpec>,
}

impl ManifestPlan {
    pub fn new(parts: Vec<PartSpec>) -> Self {
        Self { parts }
    }

    /// Size of the object composing this plan would produce when every copy
    /// part reads from a source of `existing` bytes.
    pub fn resolved_len(&self, existing: u64) -> u64 {
        self.parts
            .iter()
            .map(|part| match part {
                PartSpec::Direct(source) => source.len(),
                PartSpec::Copy { range, .. } => range.resolve(existing),
            })
            .sum()
    }
}

/// Outcome of planning one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePlan {
    /// No prior object and nothing to pad: upload the staged bytes as-is.
    WholeObject,
    /// Compose a replacement object from the listed parts.
    Compose(ManifestPlan),
}

/// A direct part ready for transmission.
pub struct DirectPart {
    pub body: PartBody,
    /// Precomputed CRC32, if the caller already knows it.
    pub crc32: Option<u32>,
    /// Ask the encoder to compute the CRC32 when `crc32` is absent.
    pub check_crc: bool,
}

impl DirectPart {
    pub fn new(body: PartBody) -> Self {
        Self {
            body,
            crc32: None,
            check_crc: false,
        }
    }

    pub fn with_crc32(mut self, crc32: u32) -> Self {
        self.crc32 = Some(crc32);
        self
    }

    pub fn check_crc(mut self, check: bool) -> Self {
        self.check_crc = check;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPart {
    pub key: String,
    pub range: CopyRange,
}

pub enum PartDescriptor {
    Direct(DirectPart),
    Copy(CopyPart),
}

impl fmt::Debug for PartDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartDescriptor::Direct(part) => f
                .debug_struct("Direct")
                .field("len", &part.body.len())
                .field("crc32", &part.crc32)
                .field("check_crc", &part.check_crc)
                .finish(),
            PartDescriptor::Copy(part) => f
                .debug_struct("Copy")
                .field("key", &part.key)
                .field("range", &part.range.to_string())
                .finish(),
        }
    }
}

/// Ordered parts plus the MIME type of the composed object.
#[derive(Debug, Default)]
pub struct PartManifest {
    pub mime_type: Option<String>,
    pub parts: Vec<PartDescriptor>,
}

impl PartManifest {
    pub fn new(mime_type: Option<String>) -> Self {
        Self {
            mime_type,
            parts: Vec::new(),
        }
    }

    pub fn push_direct(&mut self, part: DirectPart) -> &mut Self {
        self.parts.push(PartDescriptor::Direct(part));
        self
    }

    pub fn push_copy(&mut self, key: impl Into<String>, range: CopyRange) -> &mut Self {
        self.parts.push(PartDescriptor::Copy(CopyPart {
            key: key.into(),
            range,
        }));
        self
    }

    /// Reject copy parts whose range is empty or inverted.
    pub fn validate(&self) -> Result<(), WriteError> {
        for (index, part) in self.parts.iter().enumerate() {
            if let PartDescriptor::Copy(copy) = part {
                if !copy.range.is_valid() {
                    return Err(WriteError::InvalidManifest(format!(
                        "part {} copies `{}` with invalid range {}",
                        index, copy.key, copy.range
                    )));
                }
            }
        }
        Ok(())
    }
}

/// JSON manifest carried by the `parts` form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireManifest {
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WirePart {
    /// A crc32 of 0 means the backend does not verify the payload.
    Direct {
        #[serde(default)]
        crc32: u32,
    },
    Copy {
        #[serde(rename = "storageFile")]
        storage_file: String,
        range: String,
    },
}
