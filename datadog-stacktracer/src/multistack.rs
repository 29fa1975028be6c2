// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prefix tree of stack frames with multiplicity counts.
//!
//! Many linear stacks (one per thread, per rank) merge into a single tree
//! keyed by frame equality, so the final report shows each distinct call
//! path once together with how many threads were on it.

use crate::frame::StackFrame;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiStack {
    /// Number of original linear stacks whose prefix ends at this node.
    pub n: i32,
    /// Frame at this node; the default (address 0) frame at the root.
    pub frame: StackFrame,
    /// Child nodes in insertion order.
    pub children: Vec<MultiStack>,
}

impl MultiStack {
    /// Builds a tree from a single linear stack, innermost frame first.
    pub fn from_stack(stack: &[StackFrame]) -> Self {
        let mut out = Self::default();
        if stack.is_empty() {
            return out;
        }
        out.n = 1;
        out.frame = stack[0].clone();
        if stack.len() > 1 {
            out.add(&stack[1..]);
        }
        out
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Installs one linear stack below this node.  The slice is ordered
    /// innermost-first; insertion consumes it from the outermost end,
    /// merging into an existing child when the frame matches.
    pub fn add(&mut self, stack: &[StackFrame]) {
        let Some((outer, rest)) = stack.split_last() else {
            return;
        };
        for child in &mut self.children {
            if child.frame == *outer {
                child.n += 1;
                child.add(rest);
                return;
            }
        }
        let mut child = MultiStack {
            n: 1,
            frame: outer.clone(),
            children: Vec::new(),
        };
        child.add(rest);
        self.children.push(child);
    }

    /// Merges another tree into this one.  Matching children (by frame
    /// equality) fold together; the rest are appended in order.
    pub fn merge(&mut self, rhs: &MultiStack) {
        self.n += rhs.n;
        for x in &rhs.children {
            let mut found = false;
            for child in &mut self.children {
                if child.frame == x.frame {
                    found = true;
                    child.merge(x);
                }
            }
            if !found {
                self.children.push(x.clone());
            }
        }
    }

    /// Bytes needed by [`MultiStack::pack`].
    pub fn packed_size(&self) -> usize {
        let mut bytes = 2 * std::mem::size_of::<i32>() + self.frame.packed_size();
        for child in &self.children {
            bytes += child.packed_size();
        }
        bytes
    }

    /// Depth-first serialization: `N:i32, frame, Nchildren:i32, children...`
    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.n.to_le_bytes());
        self.frame.pack(out);
        out.extend_from_slice(&(self.children.len() as i32).to_le_bytes());
        for child in &self.children {
            child.pack(out);
        }
    }

    pub fn pack_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packed_size());
        self.pack(&mut out);
        out
    }

    /// Exact inverse of [`MultiStack::pack`].
    pub fn unpack(buf: &[u8], pos: &mut usize) -> anyhow::Result<Self> {
        let mut out = Self::default();
        out.n = read_i32(buf, pos)?;
        out.frame = StackFrame::unpack(buf, pos)?;
        let n_children = read_i32(buf, pos)?;
        anyhow::ensure!(n_children >= 0, "Negative child count {n_children}");
        out.children.reserve(n_children as usize);
        for _ in 0..n_children {
            out.children.push(Self::unpack(buf, pos)?);
        }
        Ok(out)
    }

    pub fn unpack_vec(buf: &[u8]) -> anyhow::Result<Self> {
        let mut pos = 0;
        Self::unpack(buf, &mut pos)
    }

    fn address_column_width(&self) -> usize {
        let mut w = self.frame.address_width();
        for child in &self.children {
            w = w.max(child.address_column_width());
        }
        w
    }

    fn object_column_width(&self) -> usize {
        let mut w = (self.frame.object.len() + 1).min(20);
        for child in &self.children {
            w = w.max(child.object_column_width());
        }
        w
    }

    fn function_column_width(&self) -> usize {
        let mut w = (self.frame.function.len() + 1).min(40);
        for child in &self.children {
            w = w.max(child.function_column_width());
        }
        w
    }

    fn print_node(&self, prefix: &mut String, widths: (usize, usize, usize), guide: bool, lines: &mut Vec<String>) {
        let reset = prefix.len();
        if self.frame.address != 0 {
            let line = format!(
                "{}[{}] {}",
                prefix,
                self.n,
                self.frame.print(widths.0, widths.1, widths.2)
            );
            lines.push(line);
            prefix.push(if guide { '|' } else { ' ' });
            prefix.push(' ');
        }
        for (i, child) in self.children.iter().enumerate() {
            let guide_child =
                self.children.len() > 1 && i < self.children.len() - 1 && self.frame.address != 0;
            child.print_node(prefix, widths, guide_child, lines);
        }
        prefix.truncate(reset);
    }

    /// Renders the tree, one line per frame, indented by depth with a `|`
    /// guide column on non-last siblings.
    pub fn print(&self, prefix: &str) -> Vec<String> {
        let widths = (
            self.address_column_width(),
            self.object_column_width(),
            self.function_column_width(),
        );
        let mut lines = Vec::new();
        let mut prefix = prefix.to_string();
        self.print_node(&mut prefix, widths, false, &mut lines);
        lines
    }

    pub fn print_string(&self, prefix: &str) -> String {
        let mut out = String::with_capacity(4096);
        for line in self.print(prefix) {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

fn read_i32(buf: &[u8], pos: &mut usize) -> anyhow::Result<i32> {
    anyhow::ensure!(buf.len() - *pos >= 4, "Truncated stack data");
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*pos..*pos + 4]);
    *pos += 4;
    Ok(i32::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(address: u64, function: &str) -> StackFrame {
        let mut f = StackFrame::new(address);
        f.set_object("app");
        f.set_function(function);
        f
    }

    /// Innermost-first stacks sharing the outer frames `main -> run`.
    fn sample_tree() -> MultiStack {
        let a = vec![frame(0x30, "leaf_a"), frame(0x20, "run"), frame(0x10, "main")];
        let b = vec![frame(0x40, "leaf_b"), frame(0x20, "run"), frame(0x10, "main")];
        let mut tree = MultiStack::default();
        tree.n = 2;
        tree.add(&a);
        tree.add(&b);
        tree
    }

    #[test]
    fn test_add_merges_common_prefix() {
        let tree = sample_tree();
        assert_eq!(tree.children.len(), 1);
        let main = &tree.children[0];
        assert_eq!(main.frame.function, "main");
        assert_eq!(main.n, 2);
        let run = &main.children[0];
        assert_eq!(run.frame.function, "run");
        assert_eq!(run.n, 2);
        assert_eq!(run.children.len(), 2);
        assert_eq!(run.children[0].n, 1);
        assert_eq!(run.children[1].n, 1);
    }

    #[test]
    fn test_merge_with_self_doubles_counts() {
        let mut tree = sample_tree();
        let copy = tree.clone();
        tree.merge(&copy);
        assert_eq!(tree.n, 4);
        assert_eq!(tree.children[0].n, 4);
        assert_eq!(tree.children[0].children[0].children[0].n, 2);
        // Shape unchanged
        assert_eq!(tree.children.len(), copy.children.len());
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let mut tree = sample_tree();
        let before = tree.clone();
        tree.merge(&MultiStack::default());
        assert_eq!(tree, before);
    }

    #[test]
    fn test_pack_roundtrip() -> anyhow::Result<()> {
        let tree = sample_tree();
        let buf = tree.pack_vec();
        assert_eq!(buf.len(), tree.packed_size());
        let back = MultiStack::unpack_vec(&buf)?;
        assert_eq!(back, tree);
        Ok(())
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(MultiStack::unpack_vec(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_print_guides_and_counts() {
        let mut tree = sample_tree();
        // Give leaf_a a callee so the guide column for its sibling shows up.
        let deep = vec![
            frame(0x50, "deep_a"),
            frame(0x30, "leaf_a"),
            frame(0x20, "run"),
            frame(0x10, "main"),
        ];
        tree.n += 1;
        tree.add(&deep);
        let lines = tree.print("");
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("[3] "));
        assert!(lines[0].contains("main"));
        assert!(lines[2].contains("leaf_a"));
        // deep_a is printed under leaf_a while leaf_b is still pending, so
        // its indent carries the guide.
        assert!(lines[3].contains("deep_a"));
        assert!(lines[3].contains('|'));
        assert!(lines[4].contains("leaf_b"));
        assert!(!lines[4].contains('|'));
    }

    #[test]
    fn test_from_stack_roots_innermost_frame() {
        let stack = vec![frame(0x1, "inner"), frame(0x2, "outer")];
        let tree = MultiStack::from_stack(&stack);
        assert_eq!(tree.n, 1);
        assert_eq!(tree.frame.function, "inner");
        assert_eq!(tree.children[0].frame.function, "outer");
    }
}
