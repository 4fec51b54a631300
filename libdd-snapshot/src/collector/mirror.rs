// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Console/log mirroring into the wraparound byte buffers.
//!
//! The host environment owns the console path and invokes the sink on every
//! emitted byte sequence; this module only supplies the sink implementation.
//! A write that would run past the end of the buffer restarts at the head,
//! and -- when last-output preservation is on -- first stamps a magic key
//! into the buffer's final 8 bytes so the next boot can tell "wrapped while
//! full" from "never filled" (see `recovery`).

use crate::registry::LogItem;
use crate::shared::constants::{LAST_KMSG_MAGIC, LAST_KMSG_MAGIC_SZ};
use crate::Snapshot;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Narrow capability handed to the host's console callback slot.
pub trait ByteSink: Send + Sync {
    fn write(&self, bytes: &[u8]);
}

/// Capability for the platform logger callback slot (tagged strings).
pub trait PlatformSink: Send + Sync {
    fn write(&self, tag: &str, msg: &str);
}

/// Mirrors raw console output into the `log_kernel` item.
pub struct KernelLogSink(pub(crate) Arc<Snapshot>);

impl ByteSink for KernelLogSink {
    fn write(&self, bytes: &[u8]) {
        self.0.hook_logbuf(bytes);
    }
}

/// Mirrors platform logger strings into the `log_platform` item.
pub struct PlatformLogSink(pub(crate) Arc<Snapshot>);

impl PlatformSink for PlatformLogSink {
    fn write(&self, tag: &str, msg: &str) {
        self.0.hook_logger(tag, msg);
    }
}

pub(crate) struct MirrorWrite {
    pub(crate) end: usize,
    pub(crate) wrapped: bool,
}

/// Claims a byte range in `item` and copies `bytes` into it.
///
/// The cursor claim is a CAS loop, so the sink is callable from any context
/// without a lock; two racing writers may interleave content, which is the
/// same best-effort class as a torn ring entry.
pub(crate) fn mirror_write(item: &LogItem, bytes: &[u8], stamp_magic: bool) -> Option<MirrorWrite> {
    let len = bytes.len();
    if len == 0 || !item.is_mapped() || len > item.size {
        return None;
    }

    let mut cur = item.curr.load(Ordering::Relaxed);
    let (start, wrapped) = loop {
        let (start, wrapped) = if item.check_eob(cur, len) {
            (0, true)
        } else {
            (cur, false)
        };
        match item
            .curr
            .compare_exchange_weak(cur, start + len, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break (start, wrapped),
            Err(seen) => cur = seen,
        }
    };

    // SAFETY: start + len <= size by the claim above; the magic slot is the
    // final 8 bytes of the mapped item.
    unsafe {
        if wrapped && stamp_magic {
            (item.head().add(item.size - LAST_KMSG_MAGIC_SZ) as *mut u64).write(LAST_KMSG_MAGIC);
        }
        ptr::copy_nonoverlapping(bytes.as_ptr(), item.head().add(start), len);
    }

    Some(MirrorWrite {
        end: start + len,
        wrapped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ItemSpec;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    static MIRROR_SPEC: ItemSpec = ItemSpec {
        name: "log_kernel",
        size: 64,
        persist: false,
        enabled_init: true,
    };

    fn make_item(buf: &mut Vec<u64>, size: usize) -> LogItem {
        buf.resize(size / 8, 0);
        LogItem {
            spec: &MIRROR_SPEC,
            paddr: 0x9000_0000,
            vaddr: buf.as_mut_ptr() as *mut u8,
            size,
            curr: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    #[test]
    fn writes_advance_the_cursor() {
        let mut buf = Vec::new();
        let item = make_item(&mut buf, 64);

        let first = mirror_write(&item, b"hello ", true).unwrap();
        assert_eq!(first.end, 6);
        assert!(!first.wrapped);
        let second = mirror_write(&item, b"world", true).unwrap();
        assert_eq!(second.end, 11);

        assert_eq!(&unsafe { item.bytes() }[..11], b"hello world");
    }

    #[test]
    fn overflowing_write_wraps_to_head_and_stamps_magic() {
        let mut buf = Vec::new();
        let item = make_item(&mut buf, 64);

        mirror_write(&item, &[b'a'; 60], true).unwrap();
        let write = mirror_write(&item, b"12345678", true).unwrap();
        assert!(write.wrapped);
        assert_eq!(write.end, 8);

        let bytes = unsafe { item.bytes() };
        assert_eq!(&bytes[..8], b"12345678");
        let magic = u64::from_ne_bytes(bytes[64 - 8..].try_into().unwrap());
        assert_eq!(magic, LAST_KMSG_MAGIC);
    }

    #[test]
    fn wrap_without_preservation_leaves_no_magic() {
        let mut buf = Vec::new();
        let item = make_item(&mut buf, 64);

        mirror_write(&item, &[b'a'; 60], false).unwrap();
        let write = mirror_write(&item, b"12345678", false).unwrap();
        assert!(write.wrapped);

        let bytes = unsafe { item.bytes() };
        let magic = u64::from_ne_bytes(bytes[64 - 8..].try_into().unwrap());
        assert_ne!(magic, LAST_KMSG_MAGIC);
    }

    #[test]
    fn degenerate_writes_are_rejected() {
        let mut buf = Vec::new();
        let item = make_item(&mut buf, 64);
        assert!(mirror_write(&item, b"", true).is_none());
        assert!(mirror_write(&item, &[0u8; 65], true).is_none());

        let unmapped = LogItem {
            spec: &MIRROR_SPEC,
            paddr: 0,
            vaddr: std::ptr::null_mut(),
            size: 0,
            curr: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
        };
        assert!(mirror_write(&unmapped, b"x", true).is_none());
    }
}
