// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The static table of named log regions and the sequential layout pass
//! that assigns each enabled item its slice of the reservation.

use crate::shared::constants::{HEADER_ALLOC_SZ, HEADER_TOTAL_SZ, RESERVE_SLACK_SZ};
use crate::SnapshotError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::info;

/// One row of the static registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemSpec {
    pub name: &'static str,
    pub size: usize,
    /// Skip zero-fill across a reset; the content is someone's to recover.
    pub persist: bool,
    /// Allocate a slice of the reservation at boot.
    pub enabled_init: bool,
}

/// The item whose region carries the header block.
pub(crate) const HEADER_CARRIER: &str = "log_kevents";

/// Declaration order is layout order.
pub(crate) const DEFAULT_ITEMS: [ItemSpec; 5] = [
    ItemSpec {
        name: "log_kevents",
        size: 0x0040_0000,
        persist: false,
        enabled_init: true,
    },
    ItemSpec {
        name: "log_kernel",
        size: 0x0020_0000,
        persist: false,
        enabled_init: true,
    },
    ItemSpec {
        name: "log_platform",
        size: 0x0010_0000,
        persist: false,
        enabled_init: true,
    },
    ItemSpec {
        name: "log_pstore",
        size: 0x8000,
        persist: true,
        enabled_init: true,
    },
    ItemSpec {
        name: "log_sfr",
        size: 0x0004_0000,
        persist: false,
        enabled_init: false,
    },
];

/// A registry row plus its layout result and live write state.
pub(crate) struct LogItem {
    pub(crate) spec: &'static ItemSpec,
    pub(crate) paddr: u64,
    pub(crate) vaddr: *mut u8,
    pub(crate) size: usize,
    /// Byte-stream write offset from the head of the item.
    pub(crate) curr: AtomicUsize,
    pub(crate) enabled: AtomicBool,
}

impl LogItem {
    fn new(spec: &'static ItemSpec) -> Self {
        Self {
            spec,
            paddr: 0,
            vaddr: std::ptr::null_mut(),
            size: 0,
            curr: AtomicUsize::new(0),
            enabled: AtomicBool::new(spec.enabled_init),
        }
    }

    pub(crate) fn is_mapped(&self) -> bool {
        !self.vaddr.is_null()
    }

    pub(crate) fn head(&self) -> *mut u8 {
        self.vaddr
    }

    /// Whether a write of `extra` bytes from `curr` would run past the end.
    pub(crate) fn check_eob(&self, curr: usize, extra: usize) -> bool {
        curr + extra > self.size
    }

    /// The item's region as a frozen byte image.
    ///
    /// # Safety
    /// The item must be mapped and the caller must not hold this across
    /// concurrent writers expecting consistent content (post-mortem reads
    /// only; live reads are best-effort like everything else here).
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.vaddr, self.size)
    }
}

/// The ordered item table plus the well-known indices resolved from it.
pub(crate) struct Registry {
    items: Vec<LogItem>,
    carrier: usize,
    log_kernel: Option<usize>,
    log_platform: Option<usize>,
    need_header: bool,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::with_items(&DEFAULT_ITEMS)
    }

    pub(crate) fn with_items(specs: &'static [ItemSpec]) -> Self {
        let items: Vec<LogItem> = specs.iter().map(LogItem::new).collect();
        let position = |name: &str| specs.iter().position(|spec| spec.name == name);
        let carrier = position(HEADER_CARRIER).unwrap_or(0);
        let need_header = !specs
            .get(carrier)
            .map(|spec| spec.enabled_init)
            .unwrap_or(false);
        Self {
            items,
            carrier,
            log_kernel: position("log_kernel"),
            log_platform: position("log_platform"),
            need_header,
        }
    }

    pub(crate) fn need_header(&self) -> bool {
        self.need_header
    }

    pub(crate) fn items(&self) -> &[LogItem] {
        &self.items
    }

    pub(crate) fn carrier(&self) -> &LogItem {
        &self.items[self.carrier]
    }

    pub(crate) fn carrier_index(&self) -> usize {
        self.carrier
    }

    pub(crate) fn log_kernel(&self) -> Option<&LogItem> {
        self.log_kernel.map(|i| &self.items[i])
    }

    pub(crate) fn log_platform(&self) -> Option<&LogItem> {
        self.log_platform.map(|i| &self.items[i])
    }

    pub(crate) fn find(&self, name: &str) -> Option<&LogItem> {
        self.items.iter().find(|item| item.spec.name == name)
    }

    /// Bytes to reserve for everything enabled at init, plus slack, plus a
    /// header-only block when the carrier itself is disabled.
    pub(crate) fn total_reserve_size(&self) -> usize {
        let mut size: usize = self
            .items
            .iter()
            .filter(|item| item.spec.enabled_init)
            .map(|item| item.spec.size)
            .sum();
        size += RESERVE_SLACK_SZ;
        if self.need_header {
            size += HEADER_ALLOC_SZ;
        }
        size
    }

    /// Assigns contiguous physical/virtual slices to the carrier and every
    /// `enabled_init` item, in declaration order.
    pub(crate) fn layout(
        &mut self,
        phys_base: u64,
        virt_base: *mut u8,
        region_len: usize,
    ) -> Result<(), SnapshotError> {
        let need_header = self.need_header;
        let carrier = self.carrier;
        let mut used = 0usize;

        for (i, item) in self.items.iter_mut().enumerate() {
            if i != carrier && !item.spec.enabled_init {
                continue;
            }
            let item_size = if i == carrier && need_header {
                HEADER_ALLOC_SZ
            } else {
                item.spec.size
            };
            if used + item_size > region_len {
                return Err(SnapshotError::RegionTooSmall {
                    need: used + item_size,
                    got: region_len,
                });
            }

            item.paddr = phys_base + used as u64;
            // SAFETY: used + item_size was bounds-checked against the region.
            item.vaddr = unsafe { virt_base.add(used) };
            item.size = item_size;
            item.curr.store(0, Ordering::Relaxed);
            used += item_size;
        }

        // The carrier block must at least hold the fixed header layout.
        if self.items[carrier].size < HEADER_TOTAL_SZ {
            return Err(SnapshotError::RegionTooSmall {
                need: HEADER_TOTAL_SZ,
                got: self.items[carrier].size,
            });
        }

        for item in self.items.iter().filter(|item| item.is_mapped()) {
            info!(
                "{:12}: phys:{:#x} / size:{:#x}",
                item.spec.name, item.paddr, item.size
            );
        }
        Ok(())
    }
}
