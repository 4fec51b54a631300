// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Boot-time reservation of the snapshot memory region.
//!
//! The region is a fixed-size shared mapping established once, before any
//! recording starts, and never grown or moved afterwards. With a file
//! backing, the content survives a process "soft reset": the next boot maps
//! the same backing and finds the previous boot's bytes. The rest of the
//! crate never cares how the region was produced -- it operates on a base
//! pointer and a length, so tests substitute plain heap buffers.
//!
//! There is no userspace equivalent of a non-cacheable mapping attribute;
//! the mapping is ordinary shared memory and the recording paths rely on
//! atomics for the few fields a concurrent observer may read.

use crate::SnapshotError;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::ptr::NonNull;
use tracing::{error, info};

/// A mapped, page-rounded memory reservation for the snapshot subsystem.
///
/// Unmapped on drop; in a normal boot it lives until process exit.
pub struct ReservedRegion {
    base: NonNull<c_void>,
    len: usize,
    _backing: Option<File>,
}

// SAFETY: The mapping is plain memory owned by this struct for its whole
// lifetime. All mutation of the mapped bytes goes through the snapshot
// context, which uses atomics for every field a concurrent reader may see.
unsafe impl Send for ReservedRegion {}
unsafe impl Sync for ReservedRegion {}

impl ReservedRegion {
    /// Reserves `len` bytes (page-rounded) backed by the shared file at
    /// `path`, creating and sizing the file as needed. The file's previous
    /// content is preserved -- that is the whole point.
    pub fn reserve(
        path: &Path,
        len: usize,
        virtual_base_hint: Option<usize>,
    ) -> Result<Self, SnapshotError> {
        let len = round_to_pages(len);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .inspect_err(|e| error!("snapshot backing {} unavailable: {e}", path.display()))?;

        let current = file.metadata()?.len();
        if current < len as u64 {
            nix::unistd::ftruncate(&file, len as libc::off_t).map_err(|errno| {
                error!("snapshot backing {} resize failed: {errno}", path.display());
                SnapshotError::ReservationFailed(std::io::Error::from_raw_os_error(errno as i32))
            })?;
        }

        let length = NonZeroUsize::new(len).ok_or(SnapshotError::RegionTooSmall {
            need: page_size::get(),
            got: 0,
        })?;
        let addr = virtual_base_hint.and_then(NonZeroUsize::new);
        // SAFETY: mapping a file we own, with a length matching its size;
        // the hint is only a hint, the kernel may place the mapping anywhere.
        let base = unsafe {
            mmap(
                addr,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .inspect_err(|errno| error!("snapshot region map failed: {errno}"))?;

        info!(
            "snapshot memory reserved: {} bytes at {:p} ({})",
            len,
            base.as_ptr(),
            path.display()
        );
        Ok(Self {
            base,
            len,
            _backing: Some(file),
        })
    }

    /// Reserves an anonymous region of `len` bytes (page-rounded). The
    /// content does not survive the process, but everything else behaves
    /// identically -- used when no backing path is configured, and by tests.
    pub fn anonymous(len: usize) -> Result<Self, SnapshotError> {
        let len = round_to_pages(len);
        let length = NonZeroUsize::new(len).ok_or(SnapshotError::RegionTooSmall {
            need: page_size::get(),
            got: 0,
        })?;
        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .inspect_err(|errno| error!("anonymous snapshot region map failed: {errno}"))?;
        Ok(Self {
            base,
            len,
            _backing: None,
        })
    }

    pub fn base_virtual_address(&self) -> NonNull<u8> {
        self.base.cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole reservation as a raw slice pointer, the form the snapshot
    /// context consumes.
    pub fn as_region(&self) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(self.base.cast::<u8>(), self.len)
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        // SAFETY: base/len came from a successful mmap and are unmapped once.
        if let Err(errno) = unsafe { munmap(self.base, self.len) } {
            error!("snapshot region unmap failed: {errno}");
        }
    }
}

pub(crate) fn round_to_pages(len: usize) -> usize {
    let page = page_size::get();
    len.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_page_size() {
        let page = page_size::get();
        assert_eq!(round_to_pages(1), page);
        assert_eq!(round_to_pages(page), page);
        assert_eq!(round_to_pages(page + 1), 2 * page);
    }

    #[test]
    fn anonymous_region_is_usable() {
        let region = ReservedRegion::anonymous(64 * 1024).unwrap();
        assert!(region.len() >= 64 * 1024);
        let ptr = region.base_virtual_address().as_ptr();
        unsafe {
            ptr.write(0xA5);
            ptr.add(region.len() - 1).write(0x5A);
            assert_eq!(ptr.read(), 0xA5);
        }
    }

    #[test]
    fn file_backed_region_survives_remap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");

        {
            let region = ReservedRegion::reserve(&path, 128 * 1024, None).unwrap();
            unsafe { region.base_virtual_address().as_ptr().write(0xEE) };
        }

        // A fresh mapping of the same backing sees the previous write.
        let region = ReservedRegion::reserve(&path, 128 * 1024, None).unwrap();
        assert_eq!(unsafe { region.base_virtual_address().as_ptr().read() }, 0xEE);
    }

    #[test]
    fn reserve_fails_on_unwritable_path() {
        let err = ReservedRegion::reserve(Path::new("/nonexistent-dir/snapshot.bin"), 4096, None);
        assert!(matches!(err, Err(SnapshotError::ReservationFailed(_))));
    }
}
