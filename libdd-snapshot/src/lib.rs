// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reset-survivable kernel-event snapshot recording.
//!
//! This crate records ring-buffered snapshots of system activity -- task
//! switches, work execution, interrupts, cpuidle transitions, suspend/resume,
//! clock events and console output -- into a dedicated, pre-reserved memory
//! region that survives a soft reset, so an off-device tool can reconstruct
//! the sequence of events preceding a crash or watchdog reset.
//!
//! Design constraints, in force everywhere:
//!
//! - Recording runs from arbitrary contexts, including panic paths. The hot
//!   paths never block, never allocate, and never take a sleeping lock; slot
//!   claims are relaxed atomic increments with modulo wraparound.
//! - All storage is fixed at init. The region is one byte arena laid out by
//!   the item registry; typed views (header, rings, byte mirrors) address it
//!   by offset.
//! - There is no writer/reader coordination. The only reader operates on a
//!   frozen post-mortem image; torn entries from a mid-populate fault are
//!   the reader's problem, by contract.
//!
//! The [`Snapshot`] context is the single descriptor for all of it: it is
//! constructed exactly once at startup, before any recording call, and every
//! component works through a reference to it. A snapshot built from a
//! missing or unparseable boot token is permanently disabled: every call on
//! it is an inert no-op.

pub mod collector;
pub mod header;
pub mod recovery;
pub mod region;
pub(crate) mod registry;
pub mod shared;

pub use collector::crash::register_panic_hook;
pub use collector::events::EventFlow;
pub use collector::mirror::{ByteSink, KernelLogSink, PlatformLogSink, PlatformSink};
pub use header::{BaseDescriptor, BootSign, CoreRegisters};
pub use recovery::{reconstruct_last_kmsg, RecoveredLog};
pub use region::ReservedRegion;
pub use registry::ItemSpec;
pub use shared::configuration::SnapshotConfiguration;

use collector::events::EventLog;
use collector::mirror::mirror_write;
use collector::rings::{current_cpu, EventRings};
use header::HeaderView;
use registry::Registry;
use shared::constants::*;
use std::mem;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

// The default registry must fit the fixed header block plus the event rings
// inside the header-carrier item.
const _: () =
    assert!(HEADER_TOTAL_SZ + mem::size_of::<EventLog>() <= registry::DEFAULT_ITEMS[0].size);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot reservation failed: {0}")]
    ReservationFailed(#[from] std::io::Error),
    #[error("snapshot mapping failed: {0}")]
    RemapFailed(#[from] nix::Error),
    #[error("snapshot region too small: need {need:#x}, got {got:#x}")]
    RegionTooSmall { need: usize, got: usize },
    #[error("no log item named {0:?}")]
    UnknownItem(String),
    #[error("snapshot subsystem is disabled")]
    Disabled,
}

struct Inner {
    config: SnapshotConfiguration,
    // Owned when the snapshot did its own reservation; callers providing a
    // region keep ownership of it.
    _region: Option<ReservedRegion>,
    registry: Registry,
    header: HeaderView,
    rings: Option<EventRings>,
    prev_sign: u32,
    hardlockup_mask: AtomicU64,
    panic_shots: AtomicU32,
    config_lock: AtomicU32,
}

/// The snapshot descriptor: item registry, header view, ring state and
/// lifecycle flags, constructed exactly once before any recording call.
pub struct Snapshot {
    enabled: AtomicBool,
    inner: Option<Inner>,
}

// SAFETY: All mutation of the mapped region goes through atomics or through
// raw writes whose slot/range was claimed atomically; the registry and
// header pointers are set once at init and never change. Torn slot content
// under concurrent lapping is accepted by the post-mortem contract.
unsafe impl Send for Snapshot {}
unsafe impl Sync for Snapshot {}

impl Snapshot {
    // -- Construction -------------------------------------------------------

    /// A permanently disabled subsystem; every call is an inert no-op.
    pub fn disabled() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            inner: None,
        }
    }

    /// Region length the default registry needs, for callers that provide
    /// their own memory to [`Snapshot::init_in_region`].
    pub fn required_region_len() -> usize {
        Registry::new().total_reserve_size()
    }

    /// Builds the subsystem from the boot-time base-address token. A missing
    /// or unparseable token, or any reservation failure, degrades to the
    /// disabled subsystem -- logged once, never retried.
    pub fn from_boot_token(token: Option<&str>, backing_path: Option<PathBuf>) -> Self {
        let Some(token) = token else {
            info!("snapshot: no base-address token, subsystem disabled");
            return Self::disabled();
        };
        let config = match SnapshotConfiguration::from_boot_token(token, backing_path) {
            Ok(config) => config,
            Err(e) => {
                error!("snapshot: bad base-address token, subsystem disabled: {e}");
                return Self::disabled();
            }
        };
        match Self::init(config) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("snapshot: init failed, subsystem disabled: {e}");
                Self::disabled()
            }
        }
    }

    /// Reserves the region described by `config` and initializes over it.
    pub fn init(config: SnapshotConfiguration) -> Result<Self, SnapshotError> {
        let registry = Registry::new();
        let len = region::round_to_pages(registry.total_reserve_size());
        let region = match config.backing_path() {
            Some(path) => ReservedRegion::reserve(path, len, config.virtual_base_hint())?,
            None => ReservedRegion::anonymous(len)?,
        };
        let base = region.base_virtual_address().as_ptr();
        let len = region.len();
        // SAFETY: the mapping is owned by the snapshot and outlives it.
        unsafe { Self::fixmap(registry, base, len, Some(region), config) }
    }

    /// Initializes over caller-provided memory. The caller keeps ownership
    /// of the region and the "physical" base comes from the configuration.
    ///
    /// # Safety
    /// `region` must be valid, writable, 8-byte aligned memory of its stated
    /// length, outliving the returned snapshot, and not concurrently
    /// initialized by anyone else.
    pub unsafe fn init_in_region(
        region: NonNull<[u8]>,
        config: SnapshotConfiguration,
    ) -> Result<Self, SnapshotError> {
        let registry = Registry::new();
        Self::fixmap(
            registry,
            region.as_ptr() as *mut u8,
            region.len(),
            None,
            config,
        )
    }

    /// The fixmap pass: lay the items out, self-describe the header, decide
    /// what survives from the previous boot, and arm the rings.
    unsafe fn fixmap(
        mut registry: Registry,
        base: *mut u8,
        len: usize,
        owned: Option<ReservedRegion>,
        config: SnapshotConfiguration,
    ) -> Result<Self, SnapshotError> {
        registry.layout(config.base_address(), base, len)?;

        let carrier = registry.carrier();
        let header = HeaderView::new(carrier.head());

        // Read what the previous boot left before anything is overwritten.
        let prev_sign = header.raw_sign();
        let prev_last_logbuf = header.last_logbuf();

        header.write_descriptor(&BaseDescriptor {
            size: len as u64,
            vaddr: base as u64,
            paddr: config.base_address(),
            persist: 0,
            enabled: 1,
            enabled_init: 1,
        });

        // Keep the descriptor/sign/pointer prefix, clear the rest of the
        // carrier block: stale rings and status fields are worthless once a
        // new boot starts writing.
        std::ptr::write_bytes(
            carrier.head().add(KEEP_HEADER_SZ),
            0,
            carrier.size - KEEP_HEADER_SZ,
        );

        let rings = if registry.need_header() {
            None
        } else {
            let need = HEADER_TOTAL_SZ + mem::size_of::<EventLog>();
            if carrier.size < need {
                return Err(SnapshotError::RegionTooSmall {
                    need,
                    got: carrier.size,
                });
            }
            Some(EventRings::new(
                carrier.head().add(HEADER_TOTAL_SZ),
                config.callstack(),
            ))
        };

        let carrier_index = registry.carrier_index();
        for (i, item) in registry.items().iter().enumerate() {
            if i == carrier_index || !item.is_mapped() {
                continue;
            }
            let is_log_kernel = registry
                .log_kernel()
                .map(|k| std::ptr::eq(k, item))
                .unwrap_or(false);
            if is_log_kernel {
                // Resume where the previous boot stopped, if the persisted
                // pointer still lands inside the item; otherwise start over.
                if prev_last_logbuf >= item.paddr
                    && prev_last_logbuf <= item.paddr + item.size as u64
                {
                    let resumed = (prev_last_logbuf - item.paddr) as usize;
                    item.curr.store(resumed, Ordering::Relaxed);
                    info!("snapshot: kernel log resumed at {resumed:#x}");
                } else {
                    std::ptr::write_bytes(item.head(), 0, item.size);
                }
            } else if !item.spec.persist {
                std::ptr::write_bytes(item.head(), 0, item.size);
            }
        }

        header.set_sign(BootSign::Scratch);

        let snapshot = Self {
            enabled: AtomicBool::new(true),
            inner: Some(Inner {
                config,
                _region: owned,
                registry,
                header,
                rings,
                prev_sign,
                hardlockup_mask: AtomicU64::new(0),
                panic_shots: AtomicU32::new(0),
                config_lock: AtomicU32::new(0),
            }),
        };
        info!("snapshot: initialized, {len:#x} bytes");
        Ok(snapshot)
    }

    // -- Exported operations ------------------------------------------------

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn base_virtual_address(&self) -> Option<NonNull<u8>> {
        let inner = self.inner.as_ref()?;
        NonNull::new(inner.registry.carrier().head())
    }

    /// Physical address of a named item, or `None` for unknown names and
    /// items that were not laid out.
    pub fn item_physical_address(&self, name: &str) -> Option<u64> {
        let inner = self.inner.as_ref()?;
        let item = inner.registry.find(name)?;
        item.is_mapped().then_some(item.paddr)
    }

    /// Tristate enable query. The distinguished name `"base"` reports the
    /// subsystem flag itself; unknown names report `None`.
    pub fn get_enabled(&self, name: &str, at_init: bool) -> Option<bool> {
        if name == "base" {
            return Some(self.is_enabled());
        }
        let inner = self.inner.as_ref()?;
        let item = inner.registry.find(name)?;
        Some(if at_init {
            item.spec.enabled_init
        } else {
            item.enabled.load(Ordering::Relaxed)
        })
    }

    /// Flips an item's (or `"base"`'s) enabled flag. Idempotent.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), SnapshotError> {
        let inner = self.inner.as_ref().ok_or(SnapshotError::Disabled)?;
        spin_lock(&inner.config_lock);
        let result = if name == "base" {
            self.enabled.store(enabled, Ordering::SeqCst);
            info!("snapshot: {}abled", if enabled { "en" } else { "dis" });
            Ok(())
        } else if let Some(item) = inner.registry.find(name) {
            item.enabled.store(enabled, Ordering::SeqCst);
            Ok(())
        } else {
            Err(SnapshotError::UnknownItem(name.to_string()))
        };
        spin_unlock(&inner.config_lock);
        result
    }

    /// The descriptor as an external reader sees it, straight from the
    /// header bytes.
    pub fn descriptor(&self) -> Option<BaseDescriptor> {
        Some(self.inner.as_ref()?.header.read_descriptor())
    }

    // -- Event recording ------------------------------------------------------

    #[inline]
    fn rings(&self) -> Option<&EventRings> {
        if !self.enabled.load(Ordering::Relaxed) {
            return None;
        }
        let inner = self.inner.as_ref()?;
        if !inner.registry.carrier().enabled.load(Ordering::Relaxed) {
            return None;
        }
        inner.rings.as_ref()
    }

    pub fn task(&self, cpu: usize, pid: u64, comm: &str, sp: u64) {
        if let Some(rings) = self.rings() {
            rings.task(cpu, pid, comm, sp);
        }
    }

    pub fn work(&self, cpu: usize, comm: &str, func: u64, sp: u64, flow: EventFlow) {
        if let Some(rings) = self.rings() {
            rings.work(cpu, comm, func, sp, flow);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn cpuidle(
        &self,
        cpu: usize,
        mode: u32,
        state: u32,
        online_cpus: u32,
        delta: i32,
        sp: u64,
        flow: EventFlow,
    ) {
        if let Some(rings) = self.rings() {
            rings.cpuidle(cpu, mode, state, online_cpus, delta, sp, flow);
        }
    }

    pub fn suspend(&self, func: u64, dev: u64, core: i32, sp: u64, flow: EventFlow) {
        if let Some(rings) = self.rings() {
            rings.suspend(func, dev, core, sp, flow);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn irq(
        &self,
        cpu: usize,
        irq: i32,
        func: u64,
        preempt: u32,
        val: u32,
        sp: u64,
        flow: EventFlow,
    ) {
        if let Some(rings) = self.rings() {
            rings.irq(cpu, irq, func, preempt, val, sp, flow);
        }
    }

    pub fn clockevent(&self, cpu: usize, cycle: u64, delta_ns: i64, next_event_ns: i64) {
        if let Some(rings) = self.rings() {
            rings.clockevent(cpu, cycle, delta_ns, next_event_ns);
        }
    }

    pub fn printk(&self, cpu: usize, line: &str) {
        if let Some(rings) = self.rings() {
            rings.printk(cpu, line);
        }
    }

    pub fn printkl(&self, cpu: usize, msg: u64, val: u64) {
        if let Some(rings) = self.rings() {
            rings.printkl(cpu, msg, val);
        }
    }

    pub fn save_core_pc_history(&self, cpu: usize, pcs: &[u64]) {
        if let Some(rings) = self.rings() {
            rings.save_core_pc_history(cpu, pcs);
        }
    }

    // -- Console mirrors ------------------------------------------------------

    /// The byte sink to register into the host's console callback slot.
    pub fn kernel_log_sink(self: &Arc<Self>) -> KernelLogSink {
        KernelLogSink(Arc::clone(self))
    }

    /// The string sink to register into the host's platform-logger slot.
    pub fn platform_log_sink(self: &Arc<Self>) -> PlatformLogSink {
        PlatformLogSink(Arc::clone(self))
    }

    pub(crate) fn hook_logbuf(&self, bytes: &[u8]) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let Some(item) = inner.registry.log_kernel() else {
            return;
        };
        if !item.enabled.load(Ordering::Relaxed) {
            return;
        }
        if let Some(write) = mirror_write(item, bytes, inner.config.preserve_last_kmsg()) {
            // Publish the cursor's physical address so an external reader
            // finds the tail without scanning.
            inner.header.set_last_logbuf(item.paddr + write.end as u64);
        }
    }

    pub(crate) fn hook_logger(&self, tag: &str, msg: &str) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        let Some(item) = inner.registry.log_platform() else {
            return;
        };
        if !item.enabled.load(Ordering::Relaxed) {
            return;
        }

        // Compose "tag: msg\n" in place; this path cannot allocate.
        let mut line = [0u8; PLATFORM_LOG_LINE_SZ];
        let mut len = 0usize;
        for part in [tag.as_bytes(), b": ", msg.as_bytes(), b"\n"] {
            let take = part.len().min(PLATFORM_LOG_LINE_SZ - len);
            line[len..len + take].copy_from_slice(&part[..take]);
            len += take;
            if len == PLATFORM_LOG_LINE_SZ {
                break;
            }
        }
        mirror_write(item, &line[..len], false);
    }

    /// Physical address of the most recent kernel-log byte, as published to
    /// the header scratch field.
    pub fn last_kmsg_pointer(&self) -> Option<u64> {
        let inner = self.inner.as_ref()?;
        Some(inner.header.last_logbuf())
    }

    // -- Lifecycle / crash classification -------------------------------------

    /// Records a panic: message, per-core statistics, and the `Panic` sign.
    /// One-shot per boot; later calls are ignored.
    pub fn record_panic(&self, message: &str) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        if inner.panic_shots.fetch_add(1, Ordering::SeqCst) > 0 {
            return;
        }
        let cpu = current_cpu();
        inner.header.write_panic_string(message);
        inner.header.bump_panic_stat(cpu);
        inner.header.set_sign(BootSign::Panic);
    }

    /// Marks a core stuck with interrupts off: power state, last PC, core
    /// mask, and the `Dead` sign.
    pub fn hardlockup(&self, cpu: usize, pc: u64) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.inner.as_ref() else {
            return;
        };
        inner
            .hardlockup_mask
            .fetch_or(1 << (cpu % NR_CPUS), Ordering::SeqCst);
        inner.header.set_last_pc(cpu, pc);
        inner.header.set_core_power_state(cpu, BootSign::Dead);
        inner.header.set_sign(BootSign::Dead);
    }

    pub fn hardlockup_core_mask(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|inner| inner.hardlockup_mask.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn set_emergency_reason(&self, reason: u32) {
        if let Some(inner) = self.guarded_inner() {
            inner.header.set_emergency_reason(reason);
        }
    }

    pub fn emergency_reason(&self) -> Option<u32> {
        Some(self.inner.as_ref()?.header.emergency_reason())
    }

    /// Per-core power transition: `Alive` when a core comes up, `Dead` when
    /// it goes down.
    pub fn core_power(&self, cpu: usize, up: bool) {
        if let Some(inner) = self.guarded_inner() {
            let sign = if up { BootSign::Alive } else { BootSign::Dead };
            inner.header.set_core_power_state(cpu, sign);
        }
    }

    pub fn core_power_state(&self, cpu: usize) -> Option<BootSign> {
        self.inner.as_ref()?.header.core_power_state(cpu)
    }

    pub fn save_core_registers(&self, cpu: usize, registers: &CoreRegisters) {
        if let Some(inner) = self.guarded_inner() {
            inner.header.save_core_registers(cpu, registers);
        }
    }

    pub fn last_pc(&self, cpu: usize) -> Option<u64> {
        Some(self.inner.as_ref()?.header.last_pc(cpu))
    }

    pub fn panic_string(&self) -> Option<String> {
        Some(self.inner.as_ref()?.header.panic_string())
    }

    /// Records that a fault was contained without taking the system down.
    pub fn safe_fault(&self) {
        if let Some(inner) = self.guarded_inner() {
            inner.header.set_sign(BootSign::SafeFault);
        }
    }

    /// Stamps the reboot kind on the way down; best-effort, like every
    /// write on this path.
    pub fn post_reboot(&self, forced: bool) {
        if let Some(inner) = self.guarded_inner() {
            let sign = if forced {
                BootSign::ForcedReboot
            } else {
                BootSign::NormalReboot
            };
            inner.header.set_sign(sign);
        }
    }

    /// The scratch sign the previous boot left behind, read at init before
    /// it was overwritten.
    pub fn previous_boot_sign(&self) -> Option<BootSign> {
        use num_traits::FromPrimitive;
        BootSign::from_u32(self.previous_boot_sign_raw()?)
    }

    pub fn previous_boot_sign_raw(&self) -> Option<u32> {
        Some(self.inner.as_ref()?.prev_sign)
    }

    /// Reconstructs the mirrored kernel log from the current region content
    /// (after a reattaching init, this is the previous boot's stream).
    pub fn recover_kernel_log(&self) -> Option<RecoveredLog> {
        let inner = self.inner.as_ref()?;
        let item = inner.registry.log_kernel()?;
        if !item.is_mapped() {
            return None;
        }
        let curr = item.curr.load(Ordering::Acquire);
        // SAFETY: the item is mapped for its stated size; recovery treats
        // the bytes as a frozen image.
        recovery::reconstruct_last_kmsg(unsafe { item.bytes() }, curr)
    }

    #[inline]
    fn guarded_inner(&self) -> Option<&Inner> {
        if !self.enabled.load(Ordering::Relaxed) {
            return None;
        }
        self.inner.as_ref()
    }
}

#[inline]
fn spin_lock(lock: &AtomicU32) {
    loop {
        match lock.compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return,
            Err(_) => std::hint::spin_loop(),
        }
    }
}

#[inline]
fn spin_unlock(lock: &AtomicU32) {
    lock.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Heap stand-in for the reservation, 8-byte aligned like a mapping.
    fn make_region(len: usize) -> (Vec<u64>, NonNull<[u8]>) {
        let words = len / 8 + 1;
        let mut buf = vec![0u64; words];
        let ptr = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();
        (buf, NonNull::slice_from_raw_parts(ptr, words * 8))
    }

    fn test_config() -> SnapshotConfiguration {
        SnapshotConfiguration::new(0xfd90_0000, None, None, NR_CPUS, 2, true).unwrap()
    }

    fn test_snapshot() -> (Vec<u64>, Snapshot) {
        let (buf, region) = make_region(Snapshot::required_region_len());
        let snapshot = unsafe { Snapshot::init_in_region(region, test_config()).unwrap() };
        (buf, snapshot)
    }

    #[test]
    fn item_addresses_are_layout_consistent() {
        let (_buf, snapshot) = test_snapshot();

        let kevents = snapshot.item_physical_address("log_kevents").unwrap();
        let kernel = snapshot.item_physical_address("log_kernel").unwrap();
        let platform = snapshot.item_physical_address("log_platform").unwrap();
        let pstore = snapshot.item_physical_address("log_pstore").unwrap();

        assert_eq!(kevents, 0xfd90_0000);
        assert_eq!(kernel, kevents + 0x0040_0000);
        assert_eq!(platform, kernel + 0x0020_0000);
        assert_eq!(pstore, platform + 0x0010_0000);

        // Unknown names and items skipped at layout get the sentinel.
        assert_eq!(snapshot.item_physical_address("log_bogus"), None);
        assert_eq!(snapshot.item_physical_address("log_sfr"), None);
    }

    #[test]
    fn descriptor_reads_back_as_written() {
        let (_buf, snapshot) = test_snapshot();
        let descriptor = snapshot.descriptor().unwrap();
        assert_eq!(descriptor.paddr, 0xfd90_0000);
        assert_eq!(descriptor.enabled, 1);
        assert_eq!(descriptor.enabled_init, 1);
        assert_eq!(
            descriptor.vaddr,
            snapshot.base_virtual_address().unwrap().as_ptr() as u64
        );
    }

    #[test]
    fn get_enabled_is_tristate() {
        let (_buf, snapshot) = test_snapshot();
        assert_eq!(snapshot.get_enabled("base", false), Some(true));
        assert_eq!(snapshot.get_enabled("log_kernel", false), Some(true));
        assert_eq!(snapshot.get_enabled("log_sfr", true), Some(false));
        assert_eq!(snapshot.get_enabled("log_bogus", false), None);
    }

    #[test]
    fn set_enabled_is_idempotent() {
        let (_buf, snapshot) = test_snapshot();
        snapshot.set_enabled("log_kernel", false).unwrap();
        let once = snapshot.get_enabled("log_kernel", false);
        snapshot.set_enabled("log_kernel", false).unwrap();
        assert_eq!(snapshot.get_enabled("log_kernel", false), once);

        snapshot.set_enabled("log_kernel", true).unwrap();
        snapshot.set_enabled("log_kernel", true).unwrap();
        assert_eq!(snapshot.get_enabled("log_kernel", false), Some(true));

        assert!(matches!(
            snapshot.set_enabled("log_bogus", true),
            Err(SnapshotError::UnknownItem(_))
        ));
    }

    #[test]
    fn disabling_the_carrier_stops_recording() {
        let (_buf, snapshot) = test_snapshot();
        snapshot.task(0, 1, "init", 0);
        snapshot.set_enabled("log_kevents", false).unwrap();
        snapshot.task(0, 2, "ignored", 0);
        snapshot.set_enabled("log_kevents", true).unwrap();

        let inner = snapshot.inner.as_ref().unwrap();
        assert_eq!(inner.rings.as_ref().unwrap().task_index(0), 1);
    }

    #[test]
    fn disabled_subsystem_is_inert() {
        let snapshot = Snapshot::from_boot_token(Some("not-an-address"), None);
        assert!(!snapshot.is_enabled());
        assert_eq!(snapshot.get_enabled("base", false), Some(false));
        assert_eq!(snapshot.get_enabled("log_kernel", false), None);
        assert_eq!(snapshot.item_physical_address("log_kernel"), None);
        assert!(snapshot.base_virtual_address().is_none());
        assert!(snapshot.descriptor().is_none());
        assert!(snapshot.recover_kernel_log().is_none());
        assert!(matches!(
            snapshot.set_enabled("log_kernel", true),
            Err(SnapshotError::Disabled)
        ));

        // Recording and lifecycle calls must not crash.
        snapshot.task(0, 1, "init", 0);
        snapshot.irq(0, 30, 0, 0, 0, 0, EventFlow::In);
        snapshot.hook_logbuf(b"dropped");
        snapshot.record_panic("dropped");
        snapshot.hardlockup(0, 0xdead);
        snapshot.post_reboot(false);
        assert_eq!(snapshot.hardlockup_core_mask(), 0);

        let missing = Snapshot::from_boot_token(None, None);
        assert!(!missing.is_enabled());
    }

    #[test]
    fn kernel_log_sink_publishes_physical_cursor() {
        let (_buf, snapshot) = test_snapshot();
        let snapshot = Arc::new(snapshot);
        let sink = snapshot.kernel_log_sink();

        sink.write(b"[    0.000000] Booting ...\n");
        let kernel = snapshot.item_physical_address("log_kernel").unwrap();
        assert_eq!(snapshot.last_kmsg_pointer(), Some(kernel + 27));

        sink.write(b"more\n");
        assert_eq!(snapshot.last_kmsg_pointer(), Some(kernel + 32));
    }

    #[test]
    fn recover_round_trips_the_mirror() {
        let (_buf, snapshot) = test_snapshot();
        snapshot.hook_logbuf(b"one\n");
        snapshot.hook_logbuf(b"two\n");
        let log = snapshot.recover_kernel_log().unwrap();
        assert!(!log.wrapped);
        assert_eq!(log.bytes, b"one\ntwo\n");
    }

    #[test]
    fn platform_sink_frames_lines() {
        let (_buf, snapshot) = test_snapshot();
        let snapshot = Arc::new(snapshot);
        let sink = snapshot.platform_log_sink();
        sink.write("radio", "SIM ready");

        let inner = snapshot.inner.as_ref().unwrap();
        let item = inner.registry.log_platform().unwrap();
        let written = item.curr.load(Ordering::Relaxed);
        let bytes = &unsafe { item.bytes() }[..written];
        assert_eq!(bytes, b"radio: SIM ready\n");
    }

    #[test]
    fn panic_record_is_one_shot() {
        let (_buf, snapshot) = test_snapshot();
        snapshot.record_panic("first cause");
        snapshot.record_panic("second cause");

        assert_eq!(snapshot.panic_string().unwrap(), "first cause");
        let inner = snapshot.inner.as_ref().unwrap();
        assert_eq!(inner.header.sign(), Some(BootSign::Panic));
    }

    #[test]
    fn hardlockup_tracks_cores_and_escalates() {
        let (_buf, snapshot) = test_snapshot();
        snapshot.hardlockup(2, 0xffff_0000_0000_1234);
        snapshot.hardlockup(5, 0xffff_0000_0000_5678);

        assert_eq!(snapshot.hardlockup_core_mask(), (1 << 2) | (1 << 5));
        assert_eq!(snapshot.last_pc(2), Some(0xffff_0000_0000_1234));
        assert_eq!(snapshot.core_power_state(2), Some(BootSign::Dead));
        let inner = snapshot.inner.as_ref().unwrap();
        assert_eq!(inner.header.sign(), Some(BootSign::Dead));
    }

    #[test]
    fn lifecycle_signs_and_status_fields() {
        let (_buf, snapshot) = test_snapshot();
        snapshot.core_power(1, true);
        assert_eq!(snapshot.core_power_state(1), Some(BootSign::Alive));

        snapshot.set_emergency_reason(3);
        assert_eq!(snapshot.emergency_reason(), Some(3));

        let mut regs = CoreRegisters::zeroed();
        regs.pc = 0x4242;
        snapshot.save_core_registers(3, &regs);

        snapshot.safe_fault();
        {
            let inner = snapshot.inner.as_ref().unwrap();
            assert_eq!(inner.header.sign(), Some(BootSign::SafeFault));
        }

        snapshot.post_reboot(true);
        let inner = snapshot.inner.as_ref().unwrap();
        assert_eq!(inner.header.sign(), Some(BootSign::ForcedReboot));
        assert_eq!(inner.header.core_registers(3).pc, 0x4242);
    }

    #[test]
    fn first_boot_classifies_as_reset() {
        let (_buf, snapshot) = test_snapshot();
        // A zeroed region reads back the Reset sign.
        assert_eq!(snapshot.previous_boot_sign(), Some(BootSign::Reset));
    }
}
