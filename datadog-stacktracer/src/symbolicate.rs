// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Address symbolication.
//!
//! For each raw address: ask the dynamic loader for the containing object
//! and nearest symbol, demangle, then batch the addresses per object and run
//! one external line-decoder invocation per object to recover file and line.
//! External decoders are expensive per call, which is why everything here is
//! batch-oriented.  Any decoder failure leaves the affected fields alone;
//! this path must stay safe to call from an error context.

use crate::cleanup::canonicalize_function_name;
use crate::exec;
use crate::frame::StackFrame;
use crate::shared::constants::RESOLVE_BLOCK_SIZE;
use crate::symbols;
use std::ffi::CStr;
use symbolic_demangle::demangle;

/// Stage 1: dynamic-loader lookup for one frame.
fn resolve_with_loader(frame: &mut StackFrame) {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // Safety: dladdr only writes the out-param on success.
    let rc = unsafe { libc::dladdr(frame.address as usize as *const libc::c_void, &mut info) };
    if rc == 0 {
        // The loader was silent; fall back to the executable symbol index.
        if let Some((object, object_path)) = symbols::lookup_object(frame.address) {
            frame.object = object;
            frame.object_path = object_path;
        }
        return;
    }
    frame.address2 = frame.address.abs_diff(info.dli_fbase as u64);
    if !info.dli_fname.is_null() {
        // Safety: dladdr returns a NUL-terminated path owned by the loader.
        let fname = unsafe { CStr::from_ptr(info.dli_fname) };
        frame.set_object(&fname.to_string_lossy());
    }
    if !info.dli_sname.is_null() {
        // Safety: as above.
        let sname = unsafe { CStr::from_ptr(info.dli_sname) };
        let mut name = demangle(&sname.to_string_lossy()).into_owned();
        canonicalize_function_name(&mut name);
        frame.set_function(&name);
    }
}

fn object_key(frame: &StackFrame) -> (String, String) {
    (frame.object.clone(), frame.object_path.clone())
}

fn object_full_path(frame: &StackFrame) -> String {
    if frame.object_path.is_empty() {
        frame.object.clone()
    } else {
        format!("{}/{}", frame.object_path, frame.object)
    }
}

/// Stage 3 (Linux): one `addr2line` call for every frame in the same
/// object.  Two output lines per queried address (function, `file:line`);
/// each frame queries both its absolute and relative address and prefers
/// whichever the decoder could answer.
#[cfg(not(target_os = "macos"))]
fn decode_object(frames: &mut [StackFrame], idx: &[usize]) -> anyhow::Result<()> {
    let object = object_full_path(&frames[idx[0]]);
    let mut args = vec![
        "-C".to_string(),
        "-f".to_string(),
        "-e".to_string(),
        object,
    ];
    for &i in idx {
        args.push(format!("{:x}", frames[i].address));
        args.push(format!("{:x}", frames[i].address2));
    }
    let mut output: Vec<String> = Vec::with_capacity(4 * idx.len());
    exec::exec_lines("addr2line", &args, |line| output.push(line.to_string()))?;
    anyhow::ensure!(
        output.len() == 4 * idx.len(),
        "addr2line returned {} lines for {} addresses",
        output.len(),
        idx.len()
    );
    for (k, &i) in idx.iter().enumerate() {
        let (mut name, mut location) = (&output[4 * k], &output[4 * k + 1]);
        if name.starts_with("??") {
            (name, location) = (&output[4 * k + 2], &output[4 * k + 3]);
        }
        if name.starts_with("??") {
            continue;
        }
        if frames[i].function.is_empty() {
            let mut name = name.clone();
            canonicalize_function_name(&mut name);
            frames[i].set_function(&name);
        }
        if !location.starts_with('?') && !location.is_empty() {
            let (file, line_str) = location.split_once(':').unwrap_or((location.as_str(), ""));
            let digits: String = line_str.chars().take_while(|c| c.is_ascii_digit()).collect();
            frames[i].set_filename(file);
            frames[i].line = digits.parse().unwrap_or(0);
        }
    }
    Ok(())
}

/// Stage 3 (macOS): one `atos` call per object, one output line per address
/// of the form `func (in obj) (file:line)`, parsed tolerantly.
#[cfg(target_os = "macos")]
fn decode_object(frames: &mut [StackFrame], idx: &[usize]) -> anyhow::Result<()> {
    let Some(load_address) = macos_load_address(&frames[idx[0]].object) else {
        return Ok(());
    };
    let object = object_full_path(&frames[idx[0]]);
    let mut args = vec![
        "-o".to_string(),
        object,
        "-f".to_string(),
        "-l".to_string(),
        format!("{load_address:x}"),
    ];
    for &i in idx {
        args.push(format!("{:x}", frames[i].address));
    }
    let mut output: Vec<String> = Vec::with_capacity(idx.len());
    exec::exec_lines("atos", &args, |line| output.push(line.to_string()))?;
    anyhow::ensure!(
        output.len() == idx.len(),
        "atos returned {} lines for {} addresses",
        output.len(),
        idx.len()
    );
    for (k, &i) in idx.iter().enumerate() {
        let parsed = parse_atos_line(&output[k]);
        if frames[i].function.is_empty() {
            frames[i].set_function(&parsed.function);
        }
        if frames[i].object.is_empty() && !parsed.object.is_empty() {
            frames[i].set_object(&parsed.object);
        }
        if frames[i].filename.is_empty() && !parsed.filename.is_empty() {
            frames[i].set_filename(&parsed.filename);
        }
        if frames[i].line == 0 {
            frames[i].line = parsed.line;
        }
    }
    Ok(())
}

#[cfg(target_os = "macos")]
struct AtosFields {
    function: String,
    object: String,
    filename: String,
    line: u32,
}

/// `func (in obj) (file:line)` with every piece optional.
#[cfg(target_os = "macos")]
fn parse_atos_line(line: &str) -> AtosFields {
    let mut out = AtosFields {
        function: String::new(),
        object: String::new(),
        filename: String::new(),
        line: 0,
    };
    let Some(split) = line.find(" (in ") else {
        let mut name = line.to_string();
        canonicalize_function_name(&mut name);
        out.function = name;
        return out;
    };
    let mut name = line[..split].to_string();
    canonicalize_function_name(&mut name);
    out.function = name;
    let rest = &line[split + 5..];
    let Some(close) = rest.find(')') else {
        return out;
    };
    out.object = rest[..close].to_string();
    let rest = &rest[close + 1..];
    if let (Some(open), Some(close)) = (rest.find('('), rest.rfind(')')) {
        if open < close {
            let loc = &rest[open + 1..close];
            match loc.split_once(':') {
                Some((file, line)) => {
                    out.filename = file.to_string();
                    out.line = line.trim().parse().unwrap_or(0);
                }
                None => out.filename = loc.to_string(),
            }
        }
    }
    out
}

/// Load base of a named image, from the loader's image list.
#[cfg(target_os = "macos")]
fn macos_load_address(object: &str) -> Option<u64> {
    extern "C" {
        fn _dyld_image_count() -> u32;
        fn _dyld_get_image_header(index: u32) -> *const libc::c_void;
        fn _dyld_get_image_name(index: u32) -> *const libc::c_char;
    }
    // Safety: the dyld image list APIs are callable at any time; entries for
    // unloaded images return null, which we skip.
    unsafe {
        for i in 0.._dyld_image_count() {
            let name = _dyld_get_image_name(i);
            if name.is_null() {
                continue;
            }
            let name = CStr::from_ptr(name).to_string_lossy();
            let (base, _) = crate::frame::split_path(&name);
            if base == object {
                return Some(_dyld_get_image_header(i) as u64);
            }
        }
    }
    None
}

/// Stage 2+3 driver: group a block of frames by object and decode each
/// group with a single external invocation.
fn decode_lines(frames: &mut [StackFrame]) {
    let mut start = 0;
    while start < frames.len() {
        let end = (start + RESOLVE_BLOCK_SIZE).min(frames.len());
        let mut keys: Vec<(String, String)> = Vec::new();
        for frame in &frames[start..end] {
            let key = object_key(frame);
            if !key.0.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        for key in keys {
            let idx: Vec<usize> = (start..end)
                .filter(|&i| object_key(&frames[i]) == key)
                .collect();
            if let Err(e) = decode_object(frames, &idx) {
                log::warn!("Line decoding failed for {}: {e}", key.0);
            }
        }
        start = end;
    }
}

extern "C" fn resolve_guard_handler(_signal: libc::c_int) {
    // Deliberately empty: while a decoder runs we only need the process to
    // survive a stray interrupt, not to re-enter the fatal path.
}

/// Fills in everything known about a batch of raw addresses.
pub fn resolve(addresses: &[u64]) -> Vec<StackFrame> {
    // Park the interrupt handler so a crash-context caller cannot recurse
    // through us while a decoder subprocess is in flight.
    let guard = resolve_guard_handler as extern "C" fn(libc::c_int);
    let previous = unsafe { libc::signal(libc::SIGINT, guard as libc::sighandler_t) };
    let mut frames: Vec<StackFrame> = addresses
        .iter()
        .map(|&address| {
            let mut frame = StackFrame::new(address);
            resolve_with_loader(&mut frame);
            frame
        })
        .collect();
    decode_lines(&mut frames);
    unsafe { libc::signal(libc::SIGINT, previous) };
    frames
}

/// Single-address convenience wrapper.
pub fn resolve_one(address: u64) -> StackFrame {
    resolve(std::slice::from_ref(&address))
        .pop()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_own_function() {
        // An address inside this test binary resolves to at least an object.
        let address = test_resolve_own_function as usize as u64;
        let frame = resolve_one(address);
        assert_eq!(frame.address, address);
        assert!(!frame.object.is_empty());
    }

    #[test]
    fn test_resolve_batch_preserves_order() {
        let a = test_resolve_own_function as usize as u64;
        let b = resolve as usize as u64;
        let frames = resolve(&[a, b]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].address, a);
        assert_eq!(frames[1].address, b);
    }

    #[test]
    fn test_resolve_garbage_address() {
        // A bogus address must not error, just come back unresolved.
        let frame = resolve_one(0x10);
        assert_eq!(frame.address, 0x10);
        assert!(frame.line == 0 || !frame.filename.is_empty());
    }
}
