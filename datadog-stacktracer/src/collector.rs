// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw backtrace acquisition.
//!
//! Three paths: the calling thread (plain libc-style unwind), a foreign
//! thread (asynchronous-signal rendezvous), and every registered thread.
//!
//! The rendezvous works by installing a handler on a real-time signal,
//! delivering that signal to the target thread, and having the handler fill
//! a process-global buffer with its own return addresses.  The handler does
//! strictly bounded work and touches only atomics: in a signal context
//! neither allocation nor locking is allowed.  The requesting thread spins
//! with yields until the buffer is marked done or the timeout passes; a
//! silent target simply produces an empty trace.  The target thread is
//! briefly perturbed by the signal; that is inherent to the approach.

use crate::registry::{self, ThreadHandle};
use crate::shared::constants::{MAX_STACK_DEPTH, RENDEZVOUS_TIMEOUT};
use crate::shared::deadline::Deadline;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicI32, AtomicIsize, AtomicUsize};
use std::sync::Mutex;

/// Serializes foreign captures: one rendezvous in flight at a time.
static RENDEZVOUS: Mutex<()> = Mutex::new(());

/// Capture buffer written by the signal handler.  -1 means "not filled".
static CAPTURE_COUNT: AtomicIsize = AtomicIsize::new(-1);
static CAPTURE_BUFFER: [AtomicUsize; MAX_STACK_DEPTH] =
    [const { AtomicUsize::new(0) }; MAX_STACK_DEPTH];

/// 0 means "use the platform default".
static RENDEZVOUS_SIGNAL: AtomicI32 = AtomicI32::new(0);

#[cfg(target_os = "linux")]
fn realtime_signal_range() -> (i32, i32) {
    (libc::SIGRTMIN(), libc::SIGRTMAX())
}

// macOS has no real-time signals; the user signals stand in for them.
#[cfg(not(target_os = "linux"))]
fn realtime_signal_range() -> (i32, i32) {
    (libc::SIGUSR1, libc::SIGUSR2)
}

/// Signal used for the rendezvous.  Prefers 39 when the platform's
/// real-time range covers it.
pub fn rendezvous_signal() -> i32 {
    let configured = RENDEZVOUS_SIGNAL.load(SeqCst);
    if configured != 0 {
        return configured;
    }
    let (min, max) = realtime_signal_range();
    if 39 >= min && 39 <= max {
        39
    } else {
        (min + 4).min(max)
    }
}

/// Overrides the rendezvous signal for hosts that claim the default for
/// their own real-time signaling.  0 restores the default choice.
pub fn set_rendezvous_signal(signal: i32) {
    RENDEZVOUS_SIGNAL.store(signal, SeqCst);
}

/// Runs on the target thread.  Captures raw return addresses only; no
/// allocation, no locks, no symbol resolution.
extern "C" fn backtrace_signal_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let mut count = 0;
    // Safety: the unsynchronized walker is the only one usable here; the
    // rendezvous mutex guarantees a single walker per process.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if count < MAX_STACK_DEPTH {
                CAPTURE_BUFFER[count].store(frame.ip() as usize, SeqCst);
                count += 1;
                true
            } else {
                false
            }
        });
    }
    CAPTURE_COUNT.store(count as isize, SeqCst);
}

/// Backtrace of the calling thread, innermost frame first.
fn backtrace_self() -> Vec<u64> {
    let mut trace = Vec::with_capacity(64);
    backtrace::trace(|frame| {
        trace.push(frame.ip() as usize as u64);
        trace.len() < MAX_STACK_DEPTH
    });
    trace
}

/// Backtrace of an arbitrary thread via the signal rendezvous.  Returns an
/// empty vector when the target does not answer within the timeout.
fn backtrace_foreign(target: ThreadHandle) -> Vec<u64> {
    let _lock = RENDEZVOUS.lock().unwrap();
    let signal = rendezvous_signal();

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = backtrace_signal_handler as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO;
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    // Safety: installing a handler with a zeroed mask is always valid.
    unsafe {
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, &mut previous) != 0 {
            return Vec::new();
        }
    }

    CAPTURE_COUNT.store(-1, SeqCst);
    // Safety: pthread_kill on a dead handle returns an error rather than
    // delivering; we only forward handles the registry produced.
    let delivered = unsafe { libc::pthread_kill(target, signal) } == 0;

    let mut trace = Vec::new();
    if delivered {
        let deadline = Deadline::new(RENDEZVOUS_TIMEOUT);
        while CAPTURE_COUNT.load(SeqCst) == -1 && !deadline.expired() {
            std::thread::yield_now();
        }
        let count = CAPTURE_COUNT.load(SeqCst).max(0) as usize;
        trace.reserve(count);
        for slot in CAPTURE_BUFFER.iter().take(count) {
            trace.push(slot.load(SeqCst) as u64);
        }
    }

    CAPTURE_COUNT.store(-1, SeqCst);
    // Safety: restores the handler captured above.
    unsafe {
        libc::sigaction(signal, &previous, std::ptr::null_mut());
    }
    trace
}

/// Backtrace of one thread, choosing the self or rendezvous path.
pub(crate) fn backtrace_thread(target: ThreadHandle) -> Vec<u64> {
    if target == registry::this_thread() {
        backtrace_self()
    } else {
        backtrace_foreign(target)
    }
}

/// Raw backtrace of the calling thread.
pub fn backtrace() -> Vec<u64> {
    backtrace_thread(registry::this_thread())
}

/// Raw backtrace of the given thread; empty when the thread cannot be
/// reached.
pub fn backtrace_of(target: ThreadHandle) -> Vec<u64> {
    backtrace_thread(target)
}

/// One raw backtrace per registered thread, in registry order.
pub fn backtrace_all() -> Vec<Vec<u64>> {
    registry::registered_threads()
        .into_iter()
        .map(backtrace_thread)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtrace_self_nonempty() {
        let trace = backtrace();
        assert!(!trace.is_empty());
        assert!(trace.len() <= MAX_STACK_DEPTH);
        assert!(trace.iter().any(|&a| a != 0));
    }

    #[test]
    fn test_backtrace_foreign_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            tx.send(registry::this_thread()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(500));
        });
        let handle = rx.recv().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let trace = backtrace_of(handle);
        worker.join().unwrap();
        // Either the platform answered with a real stack, or it declined;
        // both are in contract, a hang or crash is not.
        if !trace.is_empty() {
            assert!(trace.iter().any(|&a| a != 0));
        }
    }

    #[test]
    fn test_backtrace_foreign_returns_within_deadline() {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            tx.send(registry::this_thread()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(300));
        });
        let handle = rx.recv().unwrap();
        let start = std::time::Instant::now();
        let _ = backtrace_of(handle);
        assert!(start.elapsed() < std::time::Duration::from_millis(200));
        worker.join().unwrap();
    }

    #[test]
    fn test_rendezvous_signal_in_realtime_range() {
        let signal = rendezvous_signal();
        let (min, max) = realtime_signal_range();
        assert!(signal >= min && signal <= max);
    }

    #[test]
    fn test_rendezvous_signal_override() {
        let (min, _) = realtime_signal_range();
        set_rendezvous_signal(min + 1);
        assert_eq!(rendezvous_signal(), min + 1);
        set_rendezvous_signal(0);
    }
}
