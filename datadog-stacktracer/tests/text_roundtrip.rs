// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Render, parse, render again: symmetry of the multi-stack text format.

#![cfg(unix)]

use datadog_stacktracer::{
    cleanup_stack_trace, generate_from_string, get_all_call_stacks, register_thread, MultiStack,
    StackFrame,
};

fn frame(address: u64, object: &str, function: &str, filename: &str, line: u32) -> StackFrame {
    let mut f = StackFrame::new(address);
    f.set_object(object);
    f.set_function(function);
    if !filename.is_empty() {
        f.set_filename(filename);
    }
    f.line = line;
    f
}

fn synthetic_tree() -> MultiStack {
    let stack_a = vec![
        frame(0x401a30, "app", "engine::step", "step.rs", 12),
        frame(0x401200, "app", "engine::run", "run.rs", 88),
        frame(0x400f00, "app", "main", "main.rs", 4),
    ];
    let stack_b = vec![
        frame(0x7f1405221b40, "libworker.so", "worker::wait", "wait.rs", 51),
        frame(0x401200, "app", "engine::run", "run.rs", 88),
        frame(0x400f00, "app", "main", "main.rs", 4),
    ];
    let stack_c = vec![
        frame(0x401a30, "app", "engine::step", "step.rs", 12),
        frame(0x401200, "app", "engine::run", "run.rs", 88),
        frame(0x400f00, "app", "main", "main.rs", 4),
    ];
    let mut tree = MultiStack::default();
    tree.n = 3;
    tree.add(&stack_a);
    tree.add(&stack_b);
    tree.add(&stack_c);
    tree
}

#[test]
fn test_roundtrip_preserves_text() {
    let tree = synthetic_tree();
    let rendered = tree.print_string("");
    let reparsed = generate_from_string(&rendered);
    assert_eq!(reparsed.print_string(""), rendered);
}

#[test]
fn test_roundtrip_preserves_structure() {
    let tree = synthetic_tree();
    let reparsed = generate_from_string(&tree.print_string(""));
    assert_eq!(reparsed.children.len(), 1);
    let main = &reparsed.children[0];
    assert_eq!(main.frame.function, "main");
    assert_eq!(main.frame.filename, "main.rs");
    assert_eq!(main.frame.line, 4);
    assert_eq!(main.n, 3);
    let run = &main.children[0];
    assert_eq!(run.children.len(), 2);
    assert_eq!(run.children[0].n, 2);
    assert_eq!(run.children[0].frame.function, "engine::step");
    assert_eq!(run.children[1].n, 1);
    assert_eq!(run.children[1].frame.object, "libworker.so");
}

#[test]
fn test_roundtrip_survives_missing_fields() {
    // No filename, no line: the optional columns are simply absent.
    let stack = vec![
        frame(0x1111, "app", "inner", "", 0),
        frame(0x2222, "app", "outer", "", 0),
    ];
    let mut tree = MultiStack::default();
    tree.n = 1;
    tree.add(&stack);
    let rendered = tree.print_string("");
    for line in rendered.lines() {
        assert!(
            line.trim_end().ends_with("inner") || line.trim_end().ends_with("outer"),
            "unexpected trailing columns: {line:?}"
        );
    }
    let reparsed = generate_from_string(&rendered);
    assert_eq!(reparsed.print_string(""), rendered);
}

#[test]
fn test_roundtrip_of_live_capture() {
    register_thread();
    let mut tree = get_all_call_stacks();
    cleanup_stack_trace(&mut tree);
    let rendered = tree.print_string("");
    let reparsed = generate_from_string(&rendered);
    assert_eq!(reparsed.print_string(""), rendered);
}
