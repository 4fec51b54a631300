// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed sizing and layout constants for the snapshot region.
//!
//! Everything an external dump reader needs to locate is derived from the
//! constants in this file; changing any of them is a persisted-format break.

// ---------------------------------------------------------------------------
// Size domain
// ---------------------------------------------------------------------------

/// Bytes at the start of the header page preserved across a soft reset
/// (descriptor copy, scratch sign, last-log pointer). Everything past this
/// offset in the header-carrier block is re-zeroed at init.
pub const KEEP_HEADER_SZ: usize = 256 * 3;

/// The header page proper (descriptor copy + scratch fields + panic string).
pub const HEADER_SZ: usize = 0x1000;

/// Per-CPU register-dump region, one page, fixed stride per core.
pub const CORE_REG_SZ: usize = 0x1000;

/// Spare room between the fixed header block and the event rings.
pub const SPARE_SZ: usize = 0x4000;

/// Total fixed block at the start of the header-carrier item.
pub const HEADER_TOTAL_SZ: usize = HEADER_SZ + CORE_REG_SZ + SPARE_SZ;

/// Size of the header-only block laid out when the header-carrier item is
/// disabled at init. The descriptor must exist even with event logging off.
pub const HEADER_ALLOC_SZ: usize = 0x0020_0000;

/// Slack added to the reservation on top of the enabled items.
pub const RESERVE_SLACK_SZ: usize = 0x8000;

// ---------------------------------------------------------------------------
// Length domain
// ---------------------------------------------------------------------------

/// Ring capacity for the per-CPU event categories.
pub const LOG_MAX_NUM: usize = 1024;

/// Ring capacity for the global printk record/line categories.
pub const API_MAX_NUM: usize = 2048;

/// Captured call frames per slot, upper bound.
pub const CALLSTACK_MAX_NUM: usize = 4;

/// Innermost frames skipped when capturing a callstack; these belong to the
/// recorder itself, not to the traced event.
pub const CALLSTACK_SKIP: usize = 3;

/// Last-PC history depth per core.
pub const PC_ITERATION: usize = 5;

/// Compile-time core count; per-CPU rings are sized for this many cores and
/// runtime core ids are folded into it.
pub const NR_CPUS: usize = 8;

/// Fixed length of recorded task names.
pub const TASK_COMM_LEN: usize = 16;

/// Fixed length of recorded printk lines.
pub const LOG_STRING_LEN: usize = 128;

/// Register-dump stride per core inside the register-dump page.
pub const CORE_REG_OFFSET: usize = 0x200;

// ---------------------------------------------------------------------------
// Header offsets -- the persisted contract with external dump readers
// ---------------------------------------------------------------------------

/// Scratch sign value (4 bytes).
pub const OFFSET_SCRATCH: usize = 0x100;

/// Last mirrored-log physical write pointer (8 bytes).
pub const OFFSET_LAST_LOGBUF: usize = 0x200;

/// Emergency reason code (4 bytes).
pub const OFFSET_EMERGENCY_REASON: usize = 0x300;

/// Core power-state slots, one u32 sign value per core.
pub const OFFSET_CORE_POWER_STAT: usize = 0x400;

/// Panic-statistics blob, one u32 counter per core.
pub const OFFSET_PANIC_STAT: usize = 0x500;

/// Last program counter per core, one u64 per core.
pub const OFFSET_LAST_PC: usize = 0x600;

/// Panic string buffer, 0xC00..=0xFFF.
pub const OFFSET_PANIC_STRING: usize = 0xC00;

/// Capacity of the panic string buffer.
pub const PANIC_STRING_SZ: usize = HEADER_SZ - OFFSET_PANIC_STRING;

/// Fixed compose buffer for one platform-logger line (tag + message).
pub const PLATFORM_LOG_LINE_SZ: usize = 256;

/// Magic key stamped into the final 8 bytes of the kernel-log mirror when it
/// wraps while full ("Full\n").
pub const LAST_KMSG_MAGIC: u64 = 0x0000_000a_6c6c_7546;

/// Width of the wrap magic key.
pub const LAST_KMSG_MAGIC_SZ: usize = 8;

const _: () = assert!(OFFSET_PANIC_STRING + PANIC_STRING_SZ <= HEADER_SZ);
const _: () = assert!(NR_CPUS * 4 <= OFFSET_PANIC_STAT - OFFSET_CORE_POWER_STAT);
const _: () = assert!(NR_CPUS * 4 <= OFFSET_LAST_PC - OFFSET_PANIC_STAT);
const _: () = assert!(NR_CPUS * 8 <= OFFSET_PANIC_STRING - OFFSET_LAST_PC);
const _: () = assert!(NR_CPUS * CORE_REG_OFFSET <= CORE_REG_SZ);
const _: () = assert!(KEEP_HEADER_SZ > OFFSET_LAST_LOGBUF + 8);
