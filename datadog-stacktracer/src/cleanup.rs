// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonicalization and pruning of captured stacks.
//!
//! Two passes: per-frame rewrites that collapse library-internal spellings
//! of the same function, and tree pruning that drops frames which only
//! describe the capture machinery or runtime plumbing.  Rule order matters;
//! earlier rewrites expose text that later rewrites match.

use crate::frame::StackFrame;
use crate::multistack::MultiStack;

/// Ordered textual substitutions applied to every demangled name.  The
/// time-ratio and duration tables fold the full template spellings the
/// demanglers emit into their conventional aliases.
const RATIO_REWRITES: &[(&str, &str)] = &[
    ("std::ratio<1l, 1000000000000000000000000l>", "std::yocto"),
    ("std::ratio<1l, 1000000000000000000000l>", "std::zepto"),
    ("std::ratio<1l, 1000000000000000000l>", "std::atto"),
    ("std::ratio<1l, 1000000000000000l>", "std::femto"),
    ("std::ratio<1l, 1000000000000l>", "std::pico"),
    ("std::ratio<1l, 1000000000l>", "std::nano"),
    ("std::ratio<1l, 1000000l>", "std::micro"),
    ("std::ratio<1l, 1000l>", "std::milli"),
    ("std::ratio<1l, 100l>", "std::centi"),
    ("std::ratio<1l, 10l>", "std::deci"),
    ("std::ratio<1l, 1l>", ""),
    ("std::ratio<10l, 1l>", "std::deca"),
    ("std::ratio<60l, 1l>", "std::ratio<60>"),
    ("std::ratio<100l, 1l>", "std::hecto"),
    ("std::ratio<1000l, 1l>", "std::kilo"),
    ("std::ratio<3600l, 1l>", "std::ratio<3600>"),
    ("std::ratio<1000000l, 1l>", "std::mega"),
    ("std::ratio<1000000000l, 1l>", "std::giga"),
    ("std::ratio<1000000000000l, 1l>", "std::tera"),
    ("std::ratio<1000000000000000l, 1l>", "std::peta"),
    ("std::ratio<1000000000000000000l, 1l>", "std::exa"),
    ("std::ratio<1000000000000000000000l, 1l>", "std::zetta"),
    ("std::ratio<1000000000000000000000000l, 1l>", "std::yotta"),
];

const DURATION_REWRITES: &[(&str, &str)] = &[
    ("std::chrono::duration<long, std::nano>", "std::chrono::nanoseconds"),
    ("std::chrono::duration<long, std::micro>", "std::chrono::microseconds"),
    ("std::chrono::duration<long, std::milli>", "std::chrono::milliseconds"),
    ("std::chrono::duration<long>", "std::chrono::seconds"),
    ("std::chrono::duration<long,>", "std::chrono::seconds"),
    ("std::chrono::duration<long, std::ratio<60>>", "std::chrono::minutes"),
    ("std::chrono::duration<long, std::ratio<3600>>", "std::chrono::hours"),
];

const SLEEP_REWRITES: &[(&str, &str)] = &[
    ("::sleep_for<long, std::nano>", "::sleep_for<nanoseconds>"),
    ("::sleep_for<long, std::micro>", "::sleep_for<microseconds>"),
    ("::sleep_for<long, std::milli>", "::sleep_for<milliseconds>"),
    ("::sleep_for<long>", "::sleep_for<seconds>"),
    ("::sleep_for<long,>", "::sleep_for<seconds>"),
    ("::sleep_for<long, std::ratio<60>>", "::sleep_for<minutes>"),
    ("::sleep_for<long, std::ratio<3600>>", "::sleep_for<hours>"),
    (
        "::sleep_for<nanoseconds>(std::chrono::nanoseconds",
        "::sleep_for(std::chrono::nanoseconds",
    ),
    (
        "::sleep_for<microseconds>(std::chrono::microseconds",
        "::sleep_for(std::chrono::microseconds",
    ),
    (
        "::sleep_for<milliseconds>(std::chrono::milliseconds",
        "::sleep_for(std::chrono::milliseconds",
    ),
    (
        "::sleep_for<seconds>(std::chrono::seconds",
        "::sleep_for(std::chrono::seconds",
    ),
];

fn replace_all(name: &mut String, from: &str, to: &str) {
    if name.contains(from) {
        *name = name.replace(from, to);
    }
}

/// Finds the position just past the `>` matching the `<` at `open`.
fn find_matching(name: &str, open: usize) -> usize {
    let bytes = name.as_bytes();
    let mut pos = open + 1;
    let mut count = 1;
    while count != 0 && pos < bytes.len() {
        match bytes[pos] {
            b'<' => count += 1,
            b'>' => count -= 1,
            _ => {}
        }
        pos += 1;
    }
    pos
}

/// Collapses a `basic_string<CharT, ...>` span (matched with a balanced
/// `<>` scan, not field splitting) into the short alias for the char type.
fn rewrite_basic_string(name: &mut String) {
    replace_all(name, "std::__cxx11::basic_string<", "std::basic_string<");
    let mut pos = 0;
    while pos < name.len() {
        let Some(found) = name[pos..].find("std::basic_string<") else {
            break;
        };
        let start = pos + found;
        let open = start + 17;
        let close = find_matching(name, open);
        if close == open {
            break;
        }
        let args = &name[open + 1..];
        let alias = if args.starts_with("char16_t") {
            Some("std::u16string")
        } else if args.starts_with("char32_t") {
            Some("std::u32string")
        } else if args.starts_with("char") {
            Some("std::string")
        } else if args.starts_with("wchar_t") {
            Some("std::wstring")
        } else {
            None
        };
        if let Some(alias) = alias {
            name.replace_range(start..close.min(name.len()), alias);
        }
        pos = start + 1;
    }
}

/// Strips the allocator argument inside a `std::vector<T, std::allocator<T>>`.
fn rewrite_vector_allocator(name: &mut String) {
    if let Some(start) = name.find("std::vector<") {
        if let Some(rel) = name[start..].find(", std::allocator") {
            let cut = start + rel;
            let close = find_matching(name, start + 11);
            if close > cut {
                name.replace_range(cut..close.min(name.len()), ">");
            }
        }
    }
}

/// Collapses `std::make_shared<T, Args...>(` to `std::make_shared<T>(`.
fn rewrite_make_shared(name: &mut String) {
    if let Some(start) = name.find("std::make_shared<") {
        let comma = name[start..].find(',').map(|i| start + i);
        let paren = name[start..].find('(').map(|i| start + i);
        if let (Some(comma), Some(paren)) = (comma, paren) {
            if comma < paren {
                name.replace_range(comma..paren, ">");
            }
        }
    }
}

/// Rewrites one function name in place.
pub fn canonicalize_function_name(name: &mut String) {
    // Template whitespace and ABI-version namespaces first; the tables
    // below assume the collapsed spellings.
    replace_all(name, " >", ">");
    replace_all(name, "< ", "<");
    replace_all(name, "std::__1::", "std::");
    if name.contains("std::ratio<") {
        for (from, to) in RATIO_REWRITES {
            replace_all(name, from, to);
        }
        replace_all(name, " >", ">");
        replace_all(name, "< ", "<");
    }
    if name.contains("std::chrono::duration<") {
        for (from, to) in DURATION_REWRITES {
            replace_all(name, from, to);
        }
        replace_all(name, " >", ">");
        replace_all(name, "< ", "<");
    }
    if name.contains("::sleep_for<") {
        for (from, to) in SLEEP_REWRITES {
            replace_all(name, from, to);
        }
    }
    rewrite_basic_string(name);
    rewrite_make_shared(name);
    rewrite_vector_allocator(name);
    // Rust legacy mangling carries a 17-byte ::h<hash> disambiguator.
    strip_rust_hash_suffix(name);
}

fn strip_rust_hash_suffix(name: &mut String) {
    if let Some(pos) = name.rfind("::h") {
        let tail = &name[pos + 3..];
        if tail.len() == 16 && tail.bytes().all(|b| b.is_ascii_hexdigit()) {
            name.truncate(pos);
        }
    }
}

/// Whitelist of removal conditions: true when the frame is worth showing.
pub(crate) fn keep(frame: &StackFrame) -> bool {
    let object = frame.object.as_str();
    let function = frame.function.as_str();
    let filename = frame.filename.as_str();
    // Capture machinery in this crate
    if filename == "collector.rs" && function.contains("backtrace_thread") {
        return false;
    }
    // libc start-up thunks
    if object.contains("libc.so") && function.contains("__libc_start_main") {
        return false;
    }
    // libstdc++ sleep shims
    if object.contains("libstdc++") && function.contains("std::this_thread::__sleep_for(") {
        return false;
    }
    // Signal trampoline
    if object.contains("libpthread") && function.contains("__restore_rt") {
        return false;
    }
    if filename == "condition_variable"
        && function.contains("std::condition_variable::__wait_until_impl")
    {
        return false;
    }
    if filename == "functional"
        && (function.contains("std::_Function_handler<")
            || function.contains("std::_Bind_simple<")
            || function.contains("_M_invoke"))
    {
        return false;
    }
    if filename == "thread"
        && (function.contains("std::thread::_Impl<") || function.contains("std::thread::_Invoker<"))
    {
        return false;
    }
    if filename == "invoke.h"
        && (function.contains("std::__invoke_impl") || function.contains("std::__invoke_result"))
    {
        return false;
    }
    if function == "__GI___pthread_timedjoin_ex" {
        return false;
    }
    // MPI internals
    if function == "MPIR_Barrier_impl"
        || function == "MPIR_Barrier_intra"
        || function == "MPIC_Sendrecv"
    {
        return false;
    }
    if function == "opal_libevent2022_event_set_log_callback"
        || function == "opal_libevent2022_event_base_loop"
    {
        return false;
    }
    // Vendor runtime objects whose frames never help
    if object == "libmwmcr.so"
        || object == "libmwm_lxe.so"
        || object == "libmwbridge.so"
        || object == "libmwiqm.so"
        || object == "libmwm_dispatcher.so"
        || object == "libmwmvm.so"
        || object.contains("libPocoNetSSL.so")
    {
        return false;
    }
    // Allocator and smart-pointer internals
    if filename == "shared_ptr.h"
        && (function.contains("> std::allocate_shared<")
            || function.contains("std::_Sp_make_shared_tag,"))
    {
        return false;
    }
    if filename == "shared_ptr_base.h"
        || filename == "new_allocator.h"
        || filename == "alloc_traits.h"
        || filename == "gthr-default.h"
    {
        return false;
    }
    // Rust runtime plumbing
    if function.contains("__rust_begin_short_backtrace")
        || function.contains("__rust_end_short_backtrace")
        || function.starts_with("std::rt::lang_start")
        || function.contains("core::ops::function::FnOnce::call_once")
    {
        return false;
    }
    // Nothing useful to show
    if function.is_empty() && filename.is_empty() {
        return false;
    }
    true
}

/// True for frames that exist only because a thread was answering a capture
/// request; their whole subtree is dropped.
fn capture_machinery_root(frame: &StackFrame) -> bool {
    (frame.filename == "collector.rs" || frame.filename == "monitor.rs")
        && (frame.function.contains("backtrace")
            || frame.function.contains("signal_handler")
            || frame.function.contains("call_stack")
            || frame.function.contains("monitor"))
}

/// Prunes and coalesces a multi-stack in place.  A removed node keeps its
/// position when it has several children (removal is best-effort), is
/// spliced out when it has one, and disappears when it has none.  Running
/// the pass twice yields the same tree as running it once.
pub fn cleanup_stack_trace(stack: &mut MultiStack) {
    let mut i = 0;
    while i < stack.children.len() {
        if capture_machinery_root(&stack.children[i].frame) {
            stack.children.remove(i);
            continue;
        }
        // Reading decoder output shows up as fgets under libc; the frames
        // below it belong to the decoder, not the program.
        if stack.children[i].frame.object.contains("libc.so")
            && stack.children[i].frame.function.contains("fgets")
        {
            stack.children[i].children.clear();
        }
        if !keep(&stack.children[i].frame) {
            if stack.children[i].children.is_empty() {
                stack.children.remove(i);
                continue;
            } else if stack.children[i].children.len() == 1 {
                let child = stack.children[i].children.remove(0);
                stack.children[i] = child;
                continue;
            }
        }
        cleanup_stack_trace(&mut stack.children[i]);
        // Coalesce with an earlier sibling that ended up with an equal
        // frame after the removals above.
        let mut merged_into = None;
        for j in 0..i {
            if stack.children[j].frame == stack.children[i].frame {
                merged_into = Some(j);
                break;
            }
        }
        if let Some(j) = merged_into {
            let taken = std::mem::take(&mut stack.children[i].children);
            stack.children[j].n += stack.children[i].n;
            stack.children[j].children.extend(taken);
            cleanup_stack_trace(&mut stack.children[j]);
            stack.children.remove(i);
            continue;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(name: &str) -> String {
        let mut out = name.to_string();
        canonicalize_function_name(&mut out);
        out
    }

    #[test]
    fn test_template_whitespace() {
        assert_eq!(canon("foo<bar<int> >"), "foo<bar<int>>");
        assert_eq!(canon("foo< int>"), "foo<int>");
    }

    #[test]
    fn test_ratio_aliases() {
        assert_eq!(
            canon("f(std::ratio<1l, 1000000000l>)"),
            "f(std::nano)"
        );
        assert_eq!(canon("f(std::ratio<1000l, 1l>)"), "f(std::kilo)");
    }

    #[test]
    fn test_duration_aliases() {
        assert_eq!(
            canon("std::chrono::duration<long, std::ratio<1l, 1000l>>::count()"),
            "std::chrono::milliseconds::count()"
        );
    }

    #[test]
    fn test_sleep_for() {
        assert_eq!(
            canon("void std::this_thread::sleep_for<long, std::ratio<1l, 1000l>>(std::chrono::duration<long, std::ratio<1l, 1000l>> const&)"),
            "void std::this_thread::sleep_for(std::chrono::milliseconds const&)"
        );
    }

    #[test]
    fn test_basic_string_alias() {
        assert_eq!(
            canon("f(std::__cxx11::basic_string<char, std::char_traits<char>, std::allocator<char>> const&)"),
            "f(std::string const&)"
        );
        assert_eq!(
            canon("g(std::basic_string<wchar_t, std::char_traits<wchar_t>, std::allocator<wchar_t>>)"),
            "g(std::wstring)"
        );
    }

    #[test]
    fn test_vector_allocator() {
        assert_eq!(
            canon("f(std::vector<int, std::allocator<int>>)"),
            "f(std::vector<int>)"
        );
    }

    #[test]
    fn test_abi_namespace() {
        assert_eq!(canon("std::__1::mutex::lock()"), "std::mutex::lock()");
    }

    #[test]
    fn test_rust_hash_suffix() {
        assert_eq!(
            canon("engine::run::step::h0123456789abcdef"),
            "engine::run::step"
        );
        // Not a hash: left alone
        assert_eq!(canon("engine::run::help"), "engine::run::help");
    }

    fn frame(function: &str, object: &str, filename: &str) -> StackFrame {
        let mut f = StackFrame::new(function.as_bytes().iter().map(|&b| b as u64).sum::<u64>() + 1);
        f.set_function(function);
        f.set_object(object);
        f.set_filename(filename);
        f
    }

    #[test]
    fn test_keep_rules() {
        assert!(!keep(&frame("__libc_start_main", "libc.so.6", "")));
        assert!(!keep(&frame(
            "std::this_thread::__sleep_for(...)",
            "libstdc++.so.6",
            ""
        )));
        assert!(!keep(&frame("", "", "")));
        assert!(!keep(&frame(
            "backtrace_thread",
            "app",
            "collector.rs"
        )));
        assert!(!keep(&frame(
            "core::ops::function::FnOnce::call_once",
            "app",
            "function.rs"
        )));
        assert!(keep(&frame("engine::run", "app", "run.rs")));
    }

    fn node(function: &str, filename: &str, children: Vec<MultiStack>) -> MultiStack {
        MultiStack {
            n: 1,
            frame: frame(function, "app", filename),
            children,
        }
    }

    #[test]
    fn test_cleanup_splices_single_child() {
        let mut stack = MultiStack {
            n: 1,
            frame: StackFrame::default(),
            children: vec![node("", "", vec![node("engine::run", "run.rs", vec![])])],
        };
        cleanup_stack_trace(&mut stack);
        assert_eq!(stack.children.len(), 1);
        assert_eq!(stack.children[0].frame.function, "engine::run");
    }

    #[test]
    fn test_cleanup_removes_leaf() {
        let mut stack = MultiStack {
            n: 1,
            frame: StackFrame::default(),
            children: vec![
                node("engine::run", "run.rs", vec![node("", "", vec![])]),
            ],
        };
        cleanup_stack_trace(&mut stack);
        assert!(stack.children[0].children.is_empty());
    }

    #[test]
    fn test_cleanup_idempotent() {
        let mut stack = MultiStack {
            n: 2,
            frame: StackFrame::default(),
            children: vec![
                node(
                    "main",
                    "main.rs",
                    vec![
                        node("", "", vec![node("engine::run", "run.rs", vec![])]),
                        node("worker", "worker.rs", vec![node("", "", vec![])]),
                    ],
                ),
            ],
        };
        let mut once = stack.clone();
        cleanup_stack_trace(&mut once);
        let mut twice = once.clone();
        cleanup_stack_trace(&mut twice);
        assert_eq!(once, twice);
        cleanup_stack_trace(&mut stack);
        assert_eq!(stack, once);
    }

    #[test]
    fn test_cleanup_coalesces_equal_siblings() {
        // Two siblings that become equal once the noise child between them
        // is spliced out.
        let target_a = node("engine::run", "run.rs", vec![]);
        let mut wrapper = node("", "", vec![node("engine::run", "run.rs", vec![])]);
        wrapper.frame.address = 999;
        let mut stack = MultiStack {
            n: 2,
            frame: StackFrame::default(),
            children: vec![target_a, wrapper],
        };
        // Align addresses so the spliced child compares equal to the first.
        stack.children[1].children[0].frame.address = stack.children[0].frame.address;
        cleanup_stack_trace(&mut stack);
        assert_eq!(stack.children.len(), 1);
        assert_eq!(stack.children[0].n, 2);
    }
}
