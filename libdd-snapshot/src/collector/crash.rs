// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Panic-path integration: a chainable panic hook that records the panic
//! into the persisted header before the previous hook runs.
//!
//! Mutexes are not allowed on this path, so the globals are `AtomicPtr`s.
//! These should always be either null_mut or `Box::into_raw()`, which means
//! stale values can be reclaimed with `Box::from_raw`.

use crate::Snapshot;
use std::panic;
use std::panic::PanicHookInfo;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;

static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());
static HOOK_SNAPSHOT: AtomicPtr<Arc<Snapshot>> = AtomicPtr::new(ptr::null_mut());

/// Registers the snapshot panic hook, chaining any previously installed
/// hook behind it.
///
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Not reentrant; no other registration should run concurrently.
/// ATOMICITY:
///     Swaps on atomic pointers; calling it again replaces the recorded
///     snapshot but installs the process hook only once.
pub fn register_panic_hook(snapshot: Arc<Snapshot>) {
    let snapshot_ptr = Box::into_raw(Box::new(snapshot));
    let old = HOOK_SNAPSHOT.swap(snapshot_ptr, SeqCst);
    if !old.is_null() {
        // SAFETY: this can only come from a Box above.
        unsafe {
            drop(Box::from_raw(old));
        }
    }

    // Install the process-wide hook only once.
    if !PREVIOUS_PANIC_HOOK.load(SeqCst).is_null() {
        return;
    }
    let old_hook = panic::take_hook();
    let old_hook_ptr = Box::into_raw(Box::new(old_hook));
    PREVIOUS_PANIC_HOOK.swap(old_hook_ptr, SeqCst);

    panic::set_hook(Box::new(|panic_info| {
        let snapshot_ptr = HOOK_SNAPSHOT.load(SeqCst);
        if !snapshot_ptr.is_null() {
            // SAFETY: the pointer can only come from Box::into_raw above and
            // is never freed while the hook remains installed.
            let snapshot = unsafe { &*snapshot_ptr };
            snapshot.record_panic(panic_message(panic_info));
        }
        call_previous_panic_hook(panic_info);
    }));
}

fn panic_message<'a>(panic_info: &'a PanicHookInfo<'_>) -> &'a str {
    if let Some(message) = panic_info.payload().downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic_info.payload().downcast_ref::<String>() {
        message.as_str()
    } else {
        "panic"
    }
}

/// Calls the hook that was installed before ours, if any.
///
/// PRECONDITIONS:
///     None
/// SAFETY:
///     Not reentrant; borrows the stored hook without taking ownership so it
///     remains valid for future panics.
fn call_previous_panic_hook(panic_info: &PanicHookInfo<'_>) {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    if !old_hook_ptr.is_null() {
        // SAFETY: the pointer can only come from Box::into_raw in
        // register_panic_hook.
        unsafe {
            let old_hook = &*old_hook_ptr;
            old_hook(panic_info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_panic_hook_installs_once() {
        let snapshot = Arc::new(Snapshot::disabled());
        register_panic_hook(snapshot.clone());
        assert!(!PREVIOUS_PANIC_HOOK.load(SeqCst).is_null());
        assert!(!HOOK_SNAPSHOT.load(SeqCst).is_null());

        let first_hook = PREVIOUS_PANIC_HOOK.load(SeqCst);
        register_panic_hook(snapshot);
        // Re-registration replaces the snapshot but not the chained hook.
        assert_eq!(PREVIOUS_PANIC_HOOK.load(SeqCst), first_hook);
    }

    #[test]
    fn message_extraction_handles_unknown_payloads() {
        // A disabled snapshot absorbs the record without touching memory.
        let snapshot = Snapshot::disabled();
        snapshot.record_panic("explicit message");
        snapshot.record_panic("");
    }
}
