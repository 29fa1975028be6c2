// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lazy, process-global index of the static symbols of the running
//! executable, extracted with the host `nm`.  Used as a fallback when the
//! dynamic loader has nothing to say about an address (static binaries,
//! stripped dynamic tables).

use crate::exec;
use crate::frame::split_path;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    /// Symbol start address, ascending across the table.
    pub address: u64,
    /// The nm type character (`T`, `t`, `W`, ...).
    pub kind: char,
    /// Symbol label (basename portion).
    pub object: String,
    /// Directory portion of the label, usually empty.
    pub object_path: String,
}

static SYMBOL_CACHE: Mutex<Option<Vec<SymbolEntry>>> = Mutex::new(None);

/// Parses one line of `nm --numeric-sort` output:
/// `<hex-address> <type-char> <symbol>`.
fn parse_nm_line(line: &str) -> Option<SymbolEntry> {
    if line.starts_with(' ') {
        return None;
    }
    let (addr, rest) = line.split_once(' ')?;
    let (kind, symbol) = rest.split_once(' ')?;
    let address = u64::from_str_radix(addr, 16).ok()?;
    let (name, dir) = split_path(symbol.trim_end());
    Some(SymbolEntry {
        address,
        kind: kind.chars().next()?,
        object: name.to_string(),
        object_path: dir.to_string(),
    })
}

fn load_symbol_data() -> Vec<SymbolEntry> {
    let exe = get_executable();
    if exe.is_empty() {
        return Vec::new();
    }
    let mut data = Vec::new();
    let collect = |line: &str| {
        if let Some(entry) = parse_nm_line(line) {
            data.push(entry);
        }
    };
    let result = if cfg!(target_os = "macos") {
        exec::exec_shell_lines(&format!("nm -n {exe} | c++filt"), collect)
    } else {
        exec::exec_lines(
            "nm",
            &[
                "--numeric-sort".to_string(),
                "--demangle".to_string(),
                exe,
            ],
            collect,
        )
    };
    if let Err(e) = result {
        log::warn!("Symbol extraction failed: {e}");
        return Vec::new();
    }
    data
}

/// Returns a snapshot of the symbol table, populating the cache on first
/// use.  A failed extraction yields an empty list, never an error.
pub fn get_symbols() -> Vec<SymbolEntry> {
    let mut cache = SYMBOL_CACHE.lock().unwrap();
    if cache.is_none() {
        *cache = Some(load_symbol_data());
    }
    cache.as_ref().unwrap().clone()
}

/// Drops the cache; the next lookup re-runs the extractor.
pub fn clear_symbols() {
    *SYMBOL_CACHE.lock().unwrap() = None;
}

/// Binary search for the last symbol at or below `address`.  Falls back to
/// the executable itself when the table has no covering entry.
pub(crate) fn lookup_object(address: u64) -> Option<(String, String)> {
    let data = get_symbols();
    if data.is_empty() {
        return None;
    }
    let upper = data.partition_point(|entry| entry.address < address);
    if upper > 0 {
        let entry = &data[upper - 1];
        Some((entry.object.clone(), entry.object_path.clone()))
    } else {
        let executable = get_executable();
        let (name, dir) = split_path(&executable);
        Some((name.to_string(), dir.to_string()))
    }
}

/// Full path of the running executable, empty when the OS will not say.
pub fn get_executable() -> String {
    std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Symbol search path used by the debug-help symbolizer.  Only meaningful
/// on Windows; empty elsewhere.
pub fn get_sym_paths() -> String {
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nm_line() {
        let entry = parse_nm_line("00000000004005d0 T main").unwrap();
        assert_eq!(entry.address, 0x4005d0);
        assert_eq!(entry.kind, 'T');
        assert_eq!(entry.object, "main");
        assert_eq!(entry.object_path, "");
    }

    #[test]
    fn test_parse_nm_line_rejects_undefined() {
        assert!(parse_nm_line("                 U malloc").is_none());
        assert!(parse_nm_line("garbage").is_none());
    }

    #[test]
    fn test_get_executable() {
        let exe = get_executable();
        assert!(!exe.is_empty());
        assert!(std::path::Path::new(&exe).exists());
    }

    #[test]
    fn test_symbol_cache_roundtrip() {
        clear_symbols();
        let first = get_symbols();
        let second = get_symbols();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn test_sym_paths_empty_on_unix() {
        assert_eq!(get_sym_paths(), "");
    }
}
