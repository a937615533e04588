//! Offset planner.
//!
//! Maps a positioned write onto a compose manifest. Copy ranges are half-open
//! and always read from the key being written, so the result of composing the
//! plan is:
//!
//! ```text
//! existing[0..offset] ++ zeros(offset - existing) ++ new ++ existing[offset + new..]
//! ```
//!
//! where each segment is omitted when empty.

use crate::models::manifest::{CopyRange, ManifestPlan, PartSpec, WritePlan};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("writing {len} bytes at offset {offset} overflows the object size")]
    Overflow { offset: u64, len: u64 },
}

/// Plan a write of `new_len` bytes at `offset` into `key`, whose current size
/// is `existing` (`None` when the object does not exist).
pub fn plan(
    key: &str,
    existing: Option<u64>,
    offset: u64,
    new_len: u64,
) -> Result<WritePlan, PlanError> {
    let end = offset
        .checked_add(new_len)
        .ok_or(PlanError::Overflow {
            offset,
            len: new_len,
        })?;

    let Some(existing) = existing else {
        if offset == 0 {
            return Ok(WritePlan::WholeObject);
        }
        // Nothing to copy from; pad up to the offset instead.
        return Ok(WritePlan::Compose(ManifestPlan::new(vec![
            PartSpec::zero_fill(offset),
            PartSpec::new_data(new_len),
        ])));
    };

    let mut parts = Vec::with_capacity(3);
    if offset == 0 {
        parts.push(PartSpec::new_data(new_len));
        if new_len < existing {
            parts.push(PartSpec::copy(key, CopyRange::open(new_len)));
        }
    } else {
        match offset.cmp(&existing) {
            Ordering::Equal => {
                parts.push(PartSpec::copy(key, CopyRange::open(0)));
                parts.push(PartSpec::new_data(new_len));
            }
            Ordering::Less => {
                parts.push(PartSpec::copy(key, CopyRange::bounded(0, offset)));
                parts.push(PartSpec::new_data(new_len));
                if end < existing {
                    parts.push(PartSpec::copy(key, CopyRange::open(end)));
                }
            }
            Ordering::Greater => {
                parts.push(PartSpec::copy(key, CopyRange::open(0)));
                parts.push(PartSpec::zero_fill(offset - existing));
                parts.push(PartSpec::new_data(new_len));
            }
        }
    }

    Ok(WritePlan::Compose(ManifestPlan::new(parts)))
}
