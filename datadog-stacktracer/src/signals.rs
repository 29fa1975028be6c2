// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal naming and the catchable-signal tables.

use crate::collector::rendezvous_signal;
use std::ffi::CStr;
use std::sync::OnceLock;

const MAX_SIGNAL: i32 = 64;

/// Human-readable name for a signal number, from the platform tables.
pub fn signal_name(signal: i32) -> String {
    static NAMES: OnceLock<Vec<String>> = OnceLock::new();
    let names = NAMES.get_or_init(|| {
        (1..=MAX_SIGNAL)
            .map(|sig| {
                // Safety: strsignal returns a process-owned string; it is
                // copied before the next call can clobber it.
                let ptr = unsafe { libc::strsignal(sig) };
                if ptr.is_null() {
                    format!("Unknown signal {sig}")
                } else {
                    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
                }
            })
            .collect()
    });
    if signal >= 1 && signal <= MAX_SIGNAL {
        names[(signal - 1) as usize].clone()
    } else {
        format!("Unknown signal {signal}")
    }
}

#[cfg(target_os = "linux")]
fn realtime_range() -> (i32, i32) {
    (libc::SIGRTMIN(), libc::SIGRTMAX())
}

#[cfg(not(target_os = "linux"))]
fn realtime_range() -> (i32, i32) {
    (libc::SIGUSR1, libc::SIGUSR2)
}

/// Every signal a handler may legally be installed for.
pub fn all_signals_to_catch() -> Vec<i32> {
    let mut signals = Vec::with_capacity(MAX_SIGNAL as usize);
    for sig in 1..32 {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        signals.push(sig);
    }
    let (min, max) = realtime_range();
    for sig in min..=max {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP || signals.contains(&sig) {
            continue;
        }
        signals.push(sig);
    }
    signals
}

/// The default catch set: everything except the signals a healthy program
/// receives in normal operation, and the one reserved for the backtrace
/// rendezvous.
pub fn default_signals_to_catch() -> Vec<i32> {
    let excluded = [
        libc::SIGWINCH,
        libc::SIGCONT,
        libc::SIGCHLD,
        libc::SIGALRM,
        libc::SIGVTALRM,
        libc::SIGPROF,
        rendezvous_signal(),
    ];
    all_signals_to_catch()
        .into_iter()
        .filter(|sig| !excluded.contains(sig))
        .collect()
}

/// Raises a signal in the current process.
pub fn raise_signal(signal: i32) {
    // Safety: raising a signal has no memory preconditions.
    unsafe { libc::raise(signal) };
}
