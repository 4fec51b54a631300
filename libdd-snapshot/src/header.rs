// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The persisted header block: a self-describing descriptor copy, the
//! scratch sign used for crash classification, and the fixed-offset status
//! fields an external dump reader consumes without symbol lookups.
//!
//! Layout within the header-carrier item (see `shared::constants`):
//!
//! ```text
//! 0x000  copy of the base descriptor
//! 0x100  scratch sign value
//! 0x200  last mirrored-log physical write pointer
//! 0x300  emergency reason code
//! 0x400  core power-state slots (u32 per core)
//! 0x500  panic-statistics counters (u32 per core)
//! 0x600  last program counter per core (u64 per core)
//! 0xC00  panic string buffer
//! 0x1000 per-core register dump, CORE_REG_OFFSET stride
//! ```

use crate::shared::constants::*;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Self-description of the whole reservation, copied to offset 0 of the
/// header at init so a dump is interpretable on its own.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseDescriptor {
    pub size: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub persist: u32,
    pub enabled: u32,
    pub enabled_init: u32,
}

/// Lifecycle sign values written to the scratch field. The value found at
/// the next boot classifies how the previous one ended.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum BootSign {
    Reset = 0x0,
    Reserved = 0x1,
    Scratch = 0xD,
    Alive = 0xFACE,
    Dead = 0xDEAD,
    Panic = 0xBABA,
    SafeFault = 0xFAFA,
    NormalReboot = 0xCAFE,
    ForcedReboot = 0xDAFE,
}

/// A core's register file at dump time, caller-sampled.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRegisters {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl CoreRegisters {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }
}

const _: () = assert!(std::mem::size_of::<CoreRegisters>() <= CORE_REG_OFFSET);
const _: () = assert!(std::mem::size_of::<BaseDescriptor>() <= OFFSET_SCRATCH);

/// Typed accessor view over the header block.
///
/// All status fields are atomics living in the mapped region itself, so a
/// crash at any instant leaves them readable. The view requires `base` to be
/// valid for `HEADER_TOTAL_SZ` bytes and 8-byte aligned (it is page-aligned
/// in practice).
pub(crate) struct HeaderView {
    base: *mut u8,
}

impl HeaderView {
    /// # Safety
    /// `base` must point to at least `HEADER_TOTAL_SZ` writable bytes with
    /// 8-byte alignment, valid for the lifetime of the view.
    pub(crate) unsafe fn new(base: *mut u8) -> Self {
        debug_assert!(base as usize % 8 == 0);
        Self { base }
    }

    #[inline]
    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= HEADER_TOTAL_SZ);
        // SAFETY: in-bounds, aligned, and only ever accessed atomically.
        unsafe { &*(self.base.add(offset) as *const AtomicU32) }
    }

    #[inline]
    fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= HEADER_TOTAL_SZ);
        // SAFETY: as above.
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    // -- Descriptor copy ----------------------------------------------------

    pub(crate) fn write_descriptor(&self, descriptor: &BaseDescriptor) {
        // SAFETY: offset 0 is aligned and sized for the descriptor.
        unsafe { ptr::write(self.base as *mut BaseDescriptor, *descriptor) };
    }

    /// Reads the descriptor back exactly as an external reader would.
    pub(crate) fn read_descriptor(&self) -> BaseDescriptor {
        // SAFETY: as write_descriptor.
        unsafe { ptr::read(self.base as *const BaseDescriptor) }
    }

    // -- Scratch sign -------------------------------------------------------

    pub(crate) fn set_sign(&self, sign: BootSign) {
        self.atomic_u32(OFFSET_SCRATCH)
            .store(sign as u32, Ordering::Release);
    }

    pub(crate) fn raw_sign(&self) -> u32 {
        self.atomic_u32(OFFSET_SCRATCH).load(Ordering::Acquire)
    }

    pub(crate) fn sign(&self) -> Option<BootSign> {
        BootSign::from_u32(self.raw_sign())
    }

    // -- Pointer/status scratch fields --------------------------------------

    pub(crate) fn set_last_logbuf(&self, phys: u64) {
        self.atomic_u64(OFFSET_LAST_LOGBUF)
            .store(phys, Ordering::Release);
    }

    pub(crate) fn last_logbuf(&self) -> u64 {
        self.atomic_u64(OFFSET_LAST_LOGBUF).load(Ordering::Acquire)
    }

    pub(crate) fn set_emergency_reason(&self, reason: u32) {
        self.atomic_u32(OFFSET_EMERGENCY_REASON)
            .store(reason, Ordering::Release);
    }

    pub(crate) fn emergency_reason(&self) -> u32 {
        self.atomic_u32(OFFSET_EMERGENCY_REASON)
            .load(Ordering::Acquire)
    }

    pub(crate) fn set_core_power_state(&self, cpu: usize, sign: BootSign) {
        let cpu = cpu % NR_CPUS;
        self.atomic_u32(OFFSET_CORE_POWER_STAT + cpu * 4)
            .store(sign as u32, Ordering::Release);
    }

    pub(crate) fn core_power_state(&self, cpu: usize) -> Option<BootSign> {
        let cpu = cpu % NR_CPUS;
        BootSign::from_u32(
            self.atomic_u32(OFFSET_CORE_POWER_STAT + cpu * 4)
                .load(Ordering::Acquire),
        )
    }

    pub(crate) fn bump_panic_stat(&self, cpu: usize) -> u32 {
        let cpu = cpu % NR_CPUS;
        self.atomic_u32(OFFSET_PANIC_STAT + cpu * 4)
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    pub(crate) fn panic_stat(&self, cpu: usize) -> u32 {
        let cpu = cpu % NR_CPUS;
        self.atomic_u32(OFFSET_PANIC_STAT + cpu * 4)
            .load(Ordering::Acquire)
    }

    pub(crate) fn set_last_pc(&self, cpu: usize, pc: u64) {
        let cpu = cpu % NR_CPUS;
        self.atomic_u64(OFFSET_LAST_PC + cpu * 8)
            .store(pc, Ordering::Release);
    }

    pub(crate) fn last_pc(&self, cpu: usize) -> u64 {
        let cpu = cpu % NR_CPUS;
        self.atomic_u64(OFFSET_LAST_PC + cpu * 8).load(Ordering::Acquire)
    }

    // -- Panic string -------------------------------------------------------

    /// Copies `message` into the panic-string buffer, truncated to fit and
    /// always NUL-terminated.
    pub(crate) fn write_panic_string(&self, message: &str) {
        let bytes = message.as_bytes();
        let len = bytes.len().min(PANIC_STRING_SZ - 1);
        // SAFETY: OFFSET_PANIC_STRING + PANIC_STRING_SZ fits in the header.
        unsafe {
            let dst = self.base.add(OFFSET_PANIC_STRING);
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, len);
            dst.add(len).write(0);
        }
    }

    pub(crate) fn panic_string(&self) -> String {
        // SAFETY: reads the fixed panic-string window only.
        let raw = unsafe {
            std::slice::from_raw_parts(self.base.add(OFFSET_PANIC_STRING), PANIC_STRING_SZ)
        };
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    // -- Per-core register dump ---------------------------------------------

    pub(crate) fn save_core_registers(&self, cpu: usize, registers: &CoreRegisters) {
        let cpu = cpu % NR_CPUS;
        // SAFETY: stride * NR_CPUS fits in the register-dump page.
        unsafe {
            let dst = self.base.add(HEADER_SZ + cpu * CORE_REG_OFFSET) as *mut CoreRegisters;
            ptr::write(dst, *registers);
        }
    }

    pub(crate) fn core_registers(&self, cpu: usize) -> CoreRegisters {
        let cpu = cpu % NR_CPUS;
        // SAFETY: as save_core_registers.
        unsafe {
            ptr::read(self.base.add(HEADER_SZ + cpu * CORE_REG_OFFSET) as *const CoreRegisters)
        }
    }
}
