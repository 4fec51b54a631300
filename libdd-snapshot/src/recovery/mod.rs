// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-reset reconstruction of the mirrored console stream.
//!
//! The consumer contract is fixed: given the head pointer, the current
//! pointer and the buffer size, the final 8 bytes decide the shape of the
//! recovered stream. If the magic key is present the buffer wrapped while
//! full and the oldest bytes start right after the cursor; otherwise the
//! buffer never filled and the valid bytes run from head to cursor.

use crate::shared::constants::{LAST_KMSG_MAGIC, LAST_KMSG_MAGIC_SZ};
use chrono::{DateTime, Utc};

/// A reconstructed console stream from a previous boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredLog {
    pub bytes: Vec<u8>,
    /// Whether the buffer had wrapped while full (magic key present).
    pub wrapped: bool,
    pub recovered_at: DateTime<Utc>,
}

/// Whether `image` carries the wrap magic in its final 8 bytes.
pub fn has_wrap_magic(image: &[u8]) -> bool {
    if image.len() < LAST_KMSG_MAGIC_SZ {
        return false;
    }
    let tail: [u8; LAST_KMSG_MAGIC_SZ] = image[image.len() - LAST_KMSG_MAGIC_SZ..]
        .try_into()
        .unwrap_or([0; LAST_KMSG_MAGIC_SZ]);
    u64::from_ne_bytes(tail) == LAST_KMSG_MAGIC
}

/// Reconstructs the mirrored stream from a frozen buffer image.
///
/// `curr` is the cursor offset from the head at reset time. Returns `None`
/// when there is nothing trustworthy to recover (empty cursor, cursor out of
/// range).
pub fn reconstruct_last_kmsg(image: &[u8], curr: usize) -> Option<RecoveredLog> {
    if image.is_empty() || curr == 0 || curr > image.len() {
        return None;
    }

    let (bytes, wrapped) = if has_wrap_magic(image) {
        // Full buffer: oldest content starts right after the cursor.
        let mut bytes = Vec::with_capacity(image.len());
        bytes.extend_from_slice(&image[curr..]);
        bytes.extend_from_slice(&image[..curr]);
        (bytes, true)
    } else {
        (image[..curr].to_vec(), false)
    };

    Some(RecoveredLog {
        bytes,
        wrapped,
        recovered_at: Utc::now(),
    })
}
