// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free recording into the fixed event rings.
//!
//! Every category claims a slot with a relaxed atomic increment and wraps by
//! modulo; per-CPU categories own disjoint index spaces, the global ones
//! (suspend, printk record/line) share a single atomic counter. There is
//! deliberately no publish barrier after populating a slot: the only reader
//! is a frozen post-mortem memory image, never a concurrent thread, and a
//! fault mid-populate leaves a torn entry that the off-device tool discards.
//!
//! Ring capacities are powers of two, so the u32 claim counters keep an
//! unbroken slot sequence across counter wraparound.

use crate::collector::events::*;
use crate::shared::constants::*;
use nix::time::{clock_gettime, ClockId};
use std::ptr::{addr_of, addr_of_mut};
use std::sync::atomic::{AtomicU32, Ordering};

const _: () = assert!(LOG_MAX_NUM.is_power_of_two());
const _: () = assert!(API_MAX_NUM.is_power_of_two());

/// Monotonic nanoseconds since an arbitrary boot-stable epoch; the embedded
/// per-entry timestamp consumers use to reconstruct a global order.
#[inline]
pub(crate) fn monotonic_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// The core currently executing the caller, folded into the ring range.
#[inline]
pub(crate) fn current_cpu() -> usize {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sched_getcpu has no preconditions; -1 means unsupported.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return cpu as usize % NR_CPUS;
        }
    }
    0
}

/// Captures up to `frames.len()` return addresses, skipping the innermost
/// recorder-owned frames.
///
/// SAFETY:
///     Uses the unsynchronized walker because recording contexts cannot
///     block on the symbol cache lock; resolving symbols is left to the
///     off-device tool, only raw addresses are stored.
pub(crate) fn capture_callstack(frames: &mut [u64]) {
    let mut skipped = 0usize;
    let mut depth = 0usize;
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if skipped < CALLSTACK_SKIP {
                skipped += 1;
                return true;
            }
            if depth >= frames.len() {
                return false;
            }
            frames[depth] = frame.ip() as u64;
            depth += 1;
            true
        });
    }
}

#[inline]
fn claim(counter: &AtomicU32, len: usize) -> usize {
    counter.fetch_add(1, Ordering::Relaxed) as usize % len
}

#[derive(Default)]
struct RingIndices {
    task: [AtomicU32; NR_CPUS],
    work: [AtomicU32; NR_CPUS],
    cpuidle: [AtomicU32; NR_CPUS],
    irq: [AtomicU32; NR_CPUS],
    clockevent: [AtomicU32; NR_CPUS],
    suspend: AtomicU32,
    printkl: AtomicU32,
    printk: AtomicU32,
}

/// Recording facade over the `EventLog` living in the reserved region.
///
/// The claim indices are process-local: the post-mortem reader does not need
/// them, it orders entries by their embedded timestamps.
pub(crate) struct EventRings {
    log: *mut EventLog,
    callstack: usize,
    idx: RingIndices,
}

impl EventRings {
    /// # Safety
    /// `base` must point to at least `size_of::<EventLog>()` writable bytes
    /// with 8-byte alignment, valid for the lifetime of the rings.
    pub(crate) unsafe fn new(base: *mut u8, callstack: usize) -> Self {
        debug_assert!(base as usize % 8 == 0);
        Self {
            log: base as *mut EventLog,
            callstack: callstack.min(CALLSTACK_MAX_NUM),
            idx: RingIndices::default(),
        }
    }

    pub(crate) fn task(&self, cpu: usize, pid: u64, comm: &str, sp: u64) {
        let cpu = cpu % NR_CPUS;
        let i = claim(&self.idx.task[cpu], LOG_MAX_NUM);
        // SAFETY: cpu and i are in bounds; see module docs for the
        // torn-entry policy on slot reuse.
        unsafe {
            addr_of_mut!((*self.log).task[cpu][i]).write(TaskSlot {
                time: monotonic_ns(),
                sp,
                pid,
                comm: comm_bytes(comm),
            });
        }
    }

    pub(crate) fn work(&self, cpu: usize, comm: &str, func: u64, sp: u64, flow: EventFlow) {
        let cpu = cpu % NR_CPUS;
        let i = claim(&self.idx.work[cpu], LOG_MAX_NUM);
        unsafe {
            addr_of_mut!((*self.log).work[cpu][i]).write(WorkSlot {
                time: monotonic_ns(),
                sp,
                comm: comm_bytes(comm),
                func,
                flow: flow as i32,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn cpuidle(
        &self,
        cpu: usize,
        mode: u32,
        state: u32,
        online_cpus: u32,
        delta: i32,
        sp: u64,
        flow: EventFlow,
    ) {
        let cpu = cpu % NR_CPUS;
        let i = claim(&self.idx.cpuidle[cpu], LOG_MAX_NUM);
        unsafe {
            addr_of_mut!((*self.log).cpuidle[cpu][i]).write(CpuidleSlot {
                time: monotonic_ns(),
                sp,
                mode,
                state,
                online_cpus,
                delta,
                flow: flow as i32,
            });
        }
    }

    pub(crate) fn suspend(&self, func: u64, dev: u64, core: i32, sp: u64, flow: EventFlow) {
        let i = claim(&self.idx.suspend, 4 * LOG_MAX_NUM);
        unsafe {
            addr_of_mut!((*self.log).suspend[i]).write(SuspendSlot {
                time: monotonic_ns(),
                sp,
                func,
                dev,
                flow: flow as i32,
                core,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn irq(
        &self,
        cpu: usize,
        irq: i32,
        func: u64,
        preempt: u32,
        val: u32,
        sp: u64,
        flow: EventFlow,
    ) {
        let cpu = cpu % NR_CPUS;
        let i = claim(&self.idx.irq[cpu], 2 * LOG_MAX_NUM);
        unsafe {
            addr_of_mut!((*self.log).irq[cpu][i]).write(IrqSlot {
                time: monotonic_ns(),
                sp,
                func,
                irq,
                preempt,
                val,
                flow: flow as i32,
            });
        }
    }

    pub(crate) fn clockevent(&self, cpu: usize, cycle: u64, delta_ns: i64, next_event_ns: i64) {
        let cpu = cpu % NR_CPUS;
        let i = claim(&self.idx.clockevent[cpu], LOG_MAX_NUM);
        let mut caller = [0u64; CALLSTACK_MAX_NUM];
        capture_callstack(&mut caller[..self.callstack]);
        unsafe {
            addr_of_mut!((*self.log).clockevent[cpu][i]).write(ClockeventSlot {
                time: monotonic_ns(),
                cycle,
                delta_ns,
                next_event_ns,
                caller,
            });
        }
    }

    pub(crate) fn printk(&self, cpu: usize, line: &str) {
        let i = claim(&self.idx.printk, API_MAX_NUM);
        let mut caller = [0u64; CALLSTACK_MAX_NUM];
        capture_callstack(&mut caller[..self.callstack]);
        unsafe {
            addr_of_mut!((*self.log).printk[i]).write(PrintkSlot {
                time: monotonic_ns(),
                cpu: cpu as i32,
                line: line_bytes(line),
                caller,
            });
        }
    }

    pub(crate) fn printkl(&self, cpu: usize, msg: u64, val: u64) {
        let i = claim(&self.idx.printkl, API_MAX_NUM);
        let mut caller = [0u64; CALLSTACK_MAX_NUM];
        capture_callstack(&mut caller[..self.callstack]);
        unsafe {
            addr_of_mut!((*self.log).printkl[i]).write(PrintklSlot {
                time: monotonic_ns(),
                cpu: cpu as i32,
                msg,
                val,
                caller,
            });
        }
    }

    /// Writes a core's last-PC history whole; called from dump paths, not
    /// per-event.
    pub(crate) fn save_core_pc_history(&self, cpu: usize, pcs: &[u64]) {
        let cpu = cpu % NR_CPUS;
        let mut last_pc = [0u64; PC_ITERATION];
        let len = pcs.len().min(PC_ITERATION);
        last_pc[..len].copy_from_slice(&pcs[..len]);
        unsafe {
            addr_of_mut!((*self.log).core[cpu]).write(CoreSlot { last_pc });
        }
    }

    // -- Read-back accessors (post-mortem style, used by tests) -------------

    pub(crate) fn task_slot(&self, cpu: usize, i: usize) -> TaskSlot {
        unsafe { addr_of!((*self.log).task[cpu % NR_CPUS][i % LOG_MAX_NUM]).read() }
    }

    pub(crate) fn work_slot(&self, cpu: usize, i: usize) -> WorkSlot {
        unsafe { addr_of!((*self.log).work[cpu % NR_CPUS][i % LOG_MAX_NUM]).read() }
    }

    pub(crate) fn cpuidle_slot(&self, cpu: usize, i: usize) -> CpuidleSlot {
        unsafe { addr_of!((*self.log).cpuidle[cpu % NR_CPUS][i % LOG_MAX_NUM]).read() }
    }

    pub(crate) fn clockevent_slot(&self, cpu: usize, i: usize) -> ClockeventSlot {
        unsafe { addr_of!((*self.log).clockevent[cpu % NR_CPUS][i % LOG_MAX_NUM]).read() }
    }

    pub(crate) fn printkl_slot(&self, i: usize) -> PrintklSlot {
        unsafe { addr_of!((*self.log).printkl[i % API_MAX_NUM]).read() }
    }

    pub(crate) fn irq_slot(&self, cpu: usize, i: usize) -> IrqSlot {
        unsafe { addr_of!((*self.log).irq[cpu % NR_CPUS][i % (2 * LOG_MAX_NUM)]).read() }
    }

    pub(crate) fn suspend_slot(&self, i: usize) -> SuspendSlot {
        unsafe { addr_of!((*self.log).suspend[i % (4 * LOG_MAX_NUM)]).read() }
    }

    pub(crate) fn printk_slot(&self, i: usize) -> PrintkSlot {
        unsafe { addr_of!((*self.log).printk[i % API_MAX_NUM]).read() }
    }

    pub(crate) fn core_slot(&self, cpu: usize) -> CoreSlot {
        unsafe { addr_of!((*self.log).core[cpu % NR_CPUS]).read() }
    }

    pub(crate) fn task_index(&self, cpu: usize) -> u32 {
        self.idx.task[cpu % NR_CPUS].load(Ordering::Relaxed)
    }

    pub(crate) fn suspend_index(&self) -> u32 {
        self.idx.suspend.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Heap stand-in for the event-ring region, 8-byte aligned like the
    /// mapped reservation.
    fn make_rings() -> (Vec<u64>, EventRings) {
        let words = std::mem::size_of::<EventLog>() / 8 + 1;
        let mut buf = vec![0u64; words];
        let rings = unsafe { EventRings::new(buf.as_mut_ptr() as *mut u8, CALLSTACK_MAX_NUM) };
        (buf, rings)
    }

    #[test]
    fn consecutive_claims_are_sequential_mod_ring_size() {
        let (_buf, rings) = make_rings();
        for n in 0..10u64 {
            rings.task(1, 100 + n, "swapper/1", 0xffff_0000 + n);
        }
        assert_eq!(rings.task_index(1), 10);
        for n in 0..10u64 {
            let slot = rings.task_slot(1, n as usize);
            assert_eq!(slot.pid, 100 + n);
        }
        // Another CPU's index space is untouched.
        assert_eq!(rings.task_index(0), 0);
    }

    #[test]
    fn lap_overwrites_oldest() {
        let (_buf, rings) = make_rings();
        for n in 0..(LOG_MAX_NUM as u64 + 3) {
            rings.task(0, n, "t", 0);
        }
        assert_eq!(rings.task_index(0), LOG_MAX_NUM as u32 + 3);
        // Slots 0..3 were lapped.
        assert_eq!(rings.task_slot(0, 0).pid, LOG_MAX_NUM as u64);
        assert_eq!(rings.task_slot(0, 2).pid, LOG_MAX_NUM as u64 + 2);
        // Slot 3 still holds the first-lap entry.
        assert_eq!(rings.task_slot(0, 3).pid, 3);
    }

    #[test]
    fn work_slots_record_flow_direction() {
        let (_buf, rings) = make_rings();
        rings.work(1, "kworker/1:0", 0xffff_8000_0002_0000, 0x100, EventFlow::In);
        rings.work(1, "kworker/1:0", 0xffff_8000_0002_0000, 0x100, EventFlow::Out);

        let entry = rings.work_slot(1, 0);
        let exit = rings.work_slot(1, 1);
        assert_eq!(entry.flow, EventFlow::In as i32);
        assert_eq!(exit.flow, EventFlow::Out as i32);
        assert_eq!(&entry.comm[..11], b"kworker/1:0");
        assert!(entry.time <= exit.time);
    }

    #[test]
    fn global_suspend_ring_is_shared() {
        let (_buf, rings) = make_rings();
        rings.suspend(0x1000, 0, 0, 0, EventFlow::In);
        rings.suspend(0x1000, 0, 1, 0, EventFlow::Out);
        assert_eq!(rings.suspend_index(), 2);
        assert_eq!(rings.suspend_slot(0).core, 0);
        assert_eq!(rings.suspend_slot(1).core, 1);
        assert_eq!(rings.suspend_slot(0).flow, EventFlow::In as i32);
    }

    #[test]
    fn timestamps_order_events_across_categories() {
        let (_buf, rings) = make_rings();
        rings.task(2, 7, "first", 0);
        rings.irq(2, 39, 0xffff_8000_0001_0000, 0, 0, 0, EventFlow::In);
        let t1 = rings.task_slot(2, 0).time;
        let t2 = rings.irq_slot(2, 0).time;
        assert!(t1 > 0 && t2 > 0);
        assert!(t1 <= t2);
    }

    #[test]
    fn cpuidle_and_clockevent_record_their_payloads() {
        let (_buf, rings) = make_rings();
        rings.cpuidle(2, 1, 2, 8, -150, 0x200, EventFlow::In);
        let idle = rings.cpuidle_slot(2, 0);
        assert_eq!(idle.mode, 1);
        assert_eq!(idle.state, 2);
        assert_eq!(idle.online_cpus, 8);
        assert_eq!(idle.delta, -150);

        rings.clockevent(2, 26_000_000, 4_000_000, 30_000_000);
        let tick = rings.clockevent_slot(2, 0);
        assert_eq!(tick.cycle, 26_000_000);
        assert_eq!(tick.delta_ns, 4_000_000);
        assert_eq!(tick.next_event_ns, 30_000_000);
    }

    #[test]
    fn printkl_records_message_pointer_and_value() {
        let (_buf, rings) = make_rings();
        rings.printkl(1, 0xffff_8000_0003_0000, 42);
        let slot = rings.printkl_slot(0);
        assert_eq!(slot.cpu, 1);
        assert_eq!(slot.msg, 0xffff_8000_0003_0000);
        assert_eq!(slot.val, 42);
    }

    #[test]
    fn printk_line_is_truncated() {
        let (_buf, rings) = make_rings();
        let long = "y".repeat(LOG_STRING_LEN * 2);
        rings.printk(3, &long);
        let slot = rings.printk_slot(0);
        assert_eq!(slot.cpu, 3);
        assert_eq!(slot.line[LOG_STRING_LEN - 1], 0);
        assert!(slot.line[..LOG_STRING_LEN - 1].iter().all(|b| *b == b'y'));
    }

    #[test]
    fn core_pc_history_is_clamped() {
        let (_buf, rings) = make_rings();
        let pcs: Vec<u64> = (1..=10).collect();
        rings.save_core_pc_history(4, &pcs);
        let slot = rings.core_slot(4);
        assert_eq!(slot.last_pc, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn callstack_capture_respects_bounds() {
        let mut frames = [0u64; CALLSTACK_MAX_NUM];
        capture_callstack(&mut frames[..2]);
        // Depth limit: the tail stays untouched regardless of what the
        // walker produced for the head.
        assert_eq!(frames[2], 0);
        assert_eq!(frames[3], 0);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(a > 0);
        assert!(b >= a);
    }
}
