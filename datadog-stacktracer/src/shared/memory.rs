// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal resident-memory probe used to stamp `bytes_used` on abort errors.

/// Returns the resident set size of the current process in bytes, or 0 when
/// the platform offers no cheap way to ask.
#[cfg(target_os = "linux")]
pub fn memory_usage() -> u64 {
    // /proc/self/statm: size resident shared text lib data dt (in pages)
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let resident_pages = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    resident_pages * page_size::get() as u64
}

#[cfg(not(target_os = "linux"))]
pub fn memory_usage() -> u64 {
    0
}
