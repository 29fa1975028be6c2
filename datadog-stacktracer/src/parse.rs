// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inverse of the multi-stack renderer: parses rendered text back into a
//! tree.  The parser is deliberately lenient: lines without an address are
//! skipped, the `[N]` count is optional, and fields are recovered from the
//! double-space column gaps the renderer emits.

use crate::frame::StackFrame;
use crate::multistack::MultiStack;

/// Parses one rendered line starting at the `0x` address.
fn parse_line(line: &str) -> StackFrame {
    let mut frame = StackFrame::default();
    let bytes = line.as_bytes();
    // Address between the `x` and the `:` that follows it.
    let Some(px) = line.find('x') else {
        return frame;
    };
    let Some(pc_rel) = line[px..].find(':') else {
        return frame;
    };
    let pc = px + pc_rel;
    frame.address = u64::from_str_radix(line[px + 1..pc].trim(), 16).unwrap_or(0);
    frame.address2 = frame.address;

    // Object, function and filename are the double-space separated runs
    // after the address column.
    let mut p3 = pc + 1;
    while p3 < bytes.len() && bytes[p3] == b' ' {
        p3 += 1;
    }
    if p3 >= bytes.len() {
        return frame;
    }
    let mut p4 = find_from(line, p3, "  ");
    let mut p5 = match p4 {
        Some(at) => {
            p4 = Some(skip_spaces(bytes, at));
            find_from(line, p4.unwrap(), "  ").map(|at| skip_spaces(bytes, at))
        }
        None => None,
    };
    // A very wide address gap with a single remaining column means the
    // object column was empty.
    if p5.is_none() && p3 - pc > 20 {
        p5 = p4;
        p4 = Some(p3);
    }
    let end = bytes.len();
    let p4 = p4.unwrap_or(end);
    let p5 = p5.unwrap_or(end);
    // Line number trails the last `:` of the filename column.
    let p6 = line[p5.min(end)..].find(':').map(|i| p5 + i).unwrap_or(end);

    frame.set_object(field(line, p3, p4));
    frame.set_function(field(line, p4, p5));
    frame.set_filename(field(line, p5, p6));
    if p6 < end {
        frame.line = line[p6 + 1..].trim().parse().unwrap_or(0);
    }
    frame
}

fn find_from(line: &str, start: usize, pattern: &str) -> Option<usize> {
    line[start..].find(pattern).map(|i| start + i)
}

fn skip_spaces(bytes: &[u8], mut at: usize) -> usize {
    while at < bytes.len() && bytes[at] == b' ' {
        at += 1;
    }
    at
}

fn field<'a>(line: &'a str, from: usize, to: usize) -> &'a str {
    if from >= to || from >= line.len() {
        return "";
    }
    line[from..to.min(line.len())].trim_end()
}

/// Rebuilds a multi-stack from rendered lines.  Depth relationships are
/// recovered from the indent of the `[` / address column; rising indent
/// descends into the most recent sibling.
pub fn generate_from_lines(text: &[&str]) -> MultiStack {
    let mut entries: Vec<(usize, MultiStack)> = Vec::new();
    for line in text {
        let p1 = line.find('[');
        let p2 = line.find(']');
        let Some(p3) = line.find('x') else {
            continue;
        };
        if p3 == 0 || !line.is_char_boundary(p3 - 1) {
            continue;
        }
        let mut node = MultiStack {
            n: 1,
            ..Default::default()
        };
        if let (Some(p1), Some(p2)) = (p1, p2) {
            if p1 < p2 && p1 < p3 {
                node.n = line[p1 + 1..p2].trim().parse().unwrap_or(1);
            }
        }
        node.frame = parse_line(&line[p3 - 1..]);
        let indent = p1.map_or(p3 - 1, |p| p.min(p3 - 1));
        entries.push((indent, node));
    }

    // Stack of (indent, path-to-children) tracking the insertion parent.
    let mut root = MultiStack::default();
    let mut levels: Vec<(usize, Vec<usize>)> = vec![(0, Vec::new())];
    for (indent, node) in entries {
        while levels.len() > 1 && indent < levels.last().unwrap().0 {
            levels.pop();
        }
        let (level_indent, path) = levels.last().unwrap().clone();
        let siblings = children_at(&mut root, &path);
        if indent == level_indent || siblings.is_empty() {
            siblings.push(node);
        } else {
            let idx = siblings.len() - 1;
            siblings[idx].children.push(node);
            let mut deeper = path;
            deeper.push(idx);
            levels.push((indent, deeper));
        }
    }
    root
}

fn children_at<'a>(root: &'a mut MultiStack, path: &[usize]) -> &'a mut Vec<MultiStack> {
    let mut node = root;
    for &idx in path {
        node = &mut node.children[idx];
    }
    &mut node.children
}

/// Rebuilds a multi-stack from a rendered text blob.
pub fn generate_from_string(text: &str) -> MultiStack {
    let lines: Vec<&str> = text.split('\n').collect();
    generate_from_lines(&lines)
}
