// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide set of threads that opted into stack capture.
//!
//! Threads register on entry; a thread-local guard removes the handle again
//! when the thread unwinds, even on panic, so the registry never points at
//! dead threads for long.

use crate::shared::constants::MAX_REGISTERED_THREADS;
use std::sync::Mutex;

/// Native handle of a thread, as used by the signal rendezvous.
pub type ThreadHandle = libc::pthread_t;

static REGISTRY: Mutex<Vec<ThreadHandle>> = Mutex::new(Vec::new());

/// Handle of the calling thread.
pub fn this_thread() -> ThreadHandle {
    // Safety: no preconditions.
    unsafe { libc::pthread_self() }
}

struct ThreadExitGuard;

impl Drop for ThreadExitGuard {
    fn drop(&mut self) {
        unregister_thread(this_thread());
    }
}

thread_local! {
    static EXIT_GUARD: std::cell::OnceCell<ThreadExitGuard> = const { std::cell::OnceCell::new() };
}

/// Registers the calling thread and arms the automatic unregister at thread
/// exit.  Safe to call more than once.
pub fn register_thread() {
    EXIT_GUARD.with(|guard| {
        let _ = guard.set(ThreadExitGuard);
    });
    register_thread_handle(this_thread());
}

/// Registers a thread by handle.  The caller owns the matching
/// [`unregister_thread`]; duplicate inserts are no-ops, and inserts beyond
/// the registry bound are dropped.
pub fn register_thread_handle(handle: ThreadHandle) {
    let mut registry = REGISTRY.lock().unwrap();
    if registry.contains(&handle) {
        return;
    }
    if registry.len() >= MAX_REGISTERED_THREADS {
        log::warn!("Thread registry full ({MAX_REGISTERED_THREADS}); handle not tracked");
        return;
    }
    registry.push(handle);
}

/// Removes a thread from the registry.  Missing handles are tolerated.
pub fn unregister_thread(handle: ThreadHandle) {
    let mut registry = REGISTRY.lock().unwrap();
    if let Some(idx) = registry.iter().position(|&h| h == handle) {
        registry.remove(idx);
    }
}

/// Snapshot of the registered handles, in registration order.
pub fn registered_threads() -> Vec<ThreadHandle> {
    REGISTRY.lock().unwrap().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let handle = this_thread();
        register_thread();
        register_thread();
        let threads = registered_threads();
        assert_eq!(threads.iter().filter(|&&h| h == handle).count(), 1);
        unregister_thread(handle);
    }

    #[test]
    fn test_unregister_missing_is_tolerated() {
        // A handle that was never registered; removal must be a no-op.
        let handle = std::thread::spawn(this_thread).join().unwrap();
        unregister_thread(handle);
    }

    #[test]
    fn test_thread_exit_unregisters() {
        let handle = std::thread::spawn(|| {
            register_thread();
            this_thread()
        })
        .join()
        .unwrap();
        // The guard ran during thread teardown.
        for _ in 0..50 {
            if !registered_threads().contains(&handle) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("exited thread still registered");
    }

    #[test]
    fn test_registration_order_preserved() {
        // Two live parked threads, registered in a known order.
        let (tx, rx) = std::sync::mpsc::channel::<ThreadHandle>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let park = std::thread::spawn(move || {
            tx.send(this_thread()).unwrap();
            let _ = stop_rx.recv();
        });
        let first = rx.recv().unwrap();
        register_thread_handle(first);
        register_thread_handle(this_thread());
        let threads = registered_threads();
        let pos1 = threads.iter().position(|&h| h == first);
        let pos2 = threads.iter().position(|&h| h == this_thread());
        assert!(pos1.is_some() && pos2.is_some());
        assert!(pos1 < pos2);
        unregister_thread(first);
        unregister_thread(this_thread());
        stop_tx.send(()).unwrap();
        park.join().unwrap();
    }
}
