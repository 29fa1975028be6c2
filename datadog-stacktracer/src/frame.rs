// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A single resolved stack frame with a fixed maximum footprint.
//!
//! Every string field is capped so that a frame always packs into
//! [`FRAME_PACKED_SIZE`] bytes, which lets frames travel between peers as a
//! raw byte copy with no per-frame length bookkeeping.

use crate::shared::constants::{
    FRAME_FILENAME_LEN, FRAME_FILENAME_PATH_LEN, FRAME_FUNCTION_LEN, FRAME_OBJECT_LEN,
    FRAME_OBJECT_PATH_LEN, FRAME_PACKED_SIZE,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackFrame {
    /// Absolute return address.
    pub address: u64,
    /// Address relative to the containing object's load base, or equal to
    /// `address` when the base is unknown.
    pub address2: u64,
    /// Source line, 0 when unknown.
    pub line: u32,
    /// Short object (module) file name.
    pub object: String,
    /// Directory portion of the object, empty when it had none.
    pub object_path: String,
    /// Short source file name.
    pub filename: String,
    /// Directory portion of the source file.
    pub filename_path: String,
    /// Demangled, canonicalized function name.
    pub function: String,
}

/// Caps a label to `cap - 1` bytes of content, marking truncation with a
/// `...` tail the way a fixed buffer would.
fn truncate_label(value: &str, cap: usize) -> String {
    if value.len() < cap {
        return value.to_string();
    }
    let mut end = cap - 4;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}

/// Splits a path into (basename, directory) handling both separators.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind(['/', '\\']) {
        Some(idx) => (&path[idx + 1..], &path[..idx]),
        None => (path, ""),
    }
}

impl StackFrame {
    pub fn new(address: u64) -> Self {
        Self {
            address,
            address2: address,
            ..Default::default()
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Sets object and object_path from a full path, applying the caps.
    pub fn set_object(&mut self, path: &str) {
        let (name, dir) = split_path(path);
        self.object = truncate_label(name, FRAME_OBJECT_LEN);
        self.object_path = truncate_label(dir, FRAME_OBJECT_PATH_LEN);
    }

    /// Sets filename and filename_path from a full path, applying the caps.
    pub fn set_filename(&mut self, path: &str) {
        let (name, dir) = split_path(path);
        self.filename = truncate_label(name, FRAME_FILENAME_LEN);
        self.filename_path = truncate_label(dir, FRAME_FILENAME_PATH_LEN);
    }

    pub fn set_function(&mut self, name: &str) {
        self.function = truncate_label(name, FRAME_FUNCTION_LEN);
    }

    /// Minimum number of hex digits needed to print `address`.
    pub fn address_width(&self) -> usize {
        if self.address <= 0xFFFF {
            4
        } else if self.address <= 0xFFFF_FFFF {
            8
        } else if self.address <= 0xFFFF_FFFF_FFFF {
            12
        } else {
            16
        }
    }

    /// One text line for this frame:
    /// `0x<address>:  <object>  <function>  <filename>:<line>`
    /// Object and function are right-aligned to the given column widths.
    pub fn print(&self, width_address: usize, width_object: usize, width_function: usize) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(64);
        let _ = write!(
            out,
            "0x{:0>w1$x}:  {:>w2$}  {:>w3$}",
            self.address,
            self.object,
            self.function,
            w1 = width_address,
            w2 = width_object,
            w3 = width_function,
        );
        if !self.filename.is_empty() && self.line > 0 {
            let _ = write!(out, "  {}:{}", self.filename, self.line);
        } else if !self.filename.is_empty() {
            let _ = write!(out, "  {}", self.filename);
        } else if self.line > 0 {
            let _ = write!(out, " : {}", self.line);
        }
        out
    }

    pub const fn packed_size(&self) -> usize {
        FRAME_PACKED_SIZE
    }

    /// Appends the fixed-size byte layout of this frame to `out`.
    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_le_bytes());
        out.extend_from_slice(&self.address2.to_le_bytes());
        out.extend_from_slice(&self.line.to_le_bytes());
        pack_str(out, &self.object, FRAME_OBJECT_LEN);
        pack_str(out, &self.object_path, FRAME_OBJECT_PATH_LEN);
        pack_str(out, &self.filename, FRAME_FILENAME_LEN);
        pack_str(out, &self.filename_path, FRAME_FILENAME_PATH_LEN);
        pack_str(out, &self.function, FRAME_FUNCTION_LEN);
    }

    /// Reads one packed frame from `buf` at `*pos`, advancing the cursor.
    pub fn unpack(buf: &[u8], pos: &mut usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            buf.len() - *pos >= FRAME_PACKED_SIZE,
            "Truncated frame: {} bytes left",
            buf.len() - *pos
        );
        let mut frame = Self::default();
        frame.address = read_u64(buf, pos);
        frame.address2 = read_u64(buf, pos);
        frame.line = read_u32(buf, pos);
        frame.object = unpack_str(buf, pos, FRAME_OBJECT_LEN);
        frame.object_path = unpack_str(buf, pos, FRAME_OBJECT_PATH_LEN);
        frame.filename = unpack_str(buf, pos, FRAME_FILENAME_LEN);
        frame.filename_path = unpack_str(buf, pos, FRAME_FILENAME_PATH_LEN);
        frame.function = unpack_str(buf, pos, FRAME_FUNCTION_LEN);
        Ok(frame)
    }
}

/// Frames compare equal when the absolute addresses match, or when the
/// relative addresses and objects both match.  The latter lets identical code
/// in differently-rebased copies of an object collide on purpose.
impl PartialEq for StackFrame {
    fn eq(&self, rhs: &Self) -> bool {
        if self.address == rhs.address {
            return true;
        }
        self.address2 == rhs.address2 && self.object == rhs.object
    }
}

fn pack_str(out: &mut Vec<u8>, value: &str, cap: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(cap - 1);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + (cap - n), 0);
}

fn unpack_str(buf: &[u8], pos: &mut usize, cap: usize) -> String {
    let field = &buf[*pos..*pos + cap];
    *pos += cap;
    let end = field.iter().position(|&b| b == 0).unwrap_or(cap);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn read_u64(buf: &[u8], pos: &mut usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[*pos..*pos + 8]);
    *pos += 8;
    u64::from_le_bytes(raw)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*pos..*pos + 4]);
    *pos += 4;
    u32::from_le_bytes(raw)
}
