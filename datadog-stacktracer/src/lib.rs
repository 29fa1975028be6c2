// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A cross-process, multi-threaded diagnostic stack-trace engine.
//!
//! When a program dies, one structured report should describe what every
//! thread (on every peer, in a message-passing deployment) was doing.
//! This crate provides the pieces that make that possible:
//!
//! 1. **Capture**: raw return addresses for the calling thread, for an
//!    arbitrary thread (via an asynchronous-signal rendezvous), or for
//!    every registered thread.
//! 2. **Symbolication**: addresses become (object, function, file, line)
//!    by combining dynamic-loader queries, demangling, a lazily-built
//!    executable symbol index, and batched calls to the host line decoder
//!    (`addr2line` / `atos`).
//! 3. **Aggregation**: many linear stacks merge into a prefix tree with
//!    multiplicity counts, get pruned of capture/runtime noise, and render
//!    as stable text that parses back into the same tree.
//! 4. **Cluster gathering**: a per-process monitor task answers stack
//!    requests from peers over an injected communicator, under a strict
//!    deadline, so one rank can assemble the global picture.
//! 5. **Interception**: signal handlers and a panic hook turn fatal events
//!    into an [`AbortError`] carrying the report.
//!
//! Capture paths run under signal-handler constraints where noted.  The
//! symbolication and gather paths degrade to partial data rather than
//! fail, because they are themselves invoked from error contexts.

#![cfg(unix)]

mod api;
mod cleanup;
mod collector;
#[cfg(feature = "cluster")]
mod cluster;
mod error;
mod exec;
mod frame;
mod multistack;
mod parse;
mod registry;
mod shared;
mod signals;
mod symbolicate;
mod symbols;

pub use api::{
    get_all_call_stacks, get_call_stack, get_call_stack_for, get_stack_info, get_stack_info_vec,
};
pub use collector::{
    backtrace, backtrace_all, backtrace_of, rendezvous_signal, set_rendezvous_signal,
};
#[cfg(feature = "cluster")]
pub use cluster::{
    comm::{Communicator, LocalFabric, NullComm, Probe},
    get_global_call_stacks, global_call_stack_finalize, global_call_stack_initialize,
    set_global_deadline,
};
pub use error::handler::{
    clear_error_handler, clear_signal, clear_signals, set_abort_behavior, set_error_handler,
    set_signals, terminate, terminate_signal_handler,
};
pub use error::{
    abort, get_default_stack_type, set_default_stack_type, AbortError, SourceLocation, StackKind,
    TerminateReason,
};
pub use frame::StackFrame;
pub use multistack::MultiStack;
pub use parse::{generate_from_lines, generate_from_string};
pub use registry::{
    register_thread, register_thread_handle, registered_threads, this_thread, unregister_thread,
    ThreadHandle,
};
pub use signals::{all_signals_to_catch, default_signals_to_catch, raise_signal, signal_name};
pub use symbols::{clear_symbols, get_executable, get_sym_paths, get_symbols, SymbolEntry};

/// Applies name canonicalization and frame filtering to a captured tree.
pub use cleanup::{canonicalize_function_name, cleanup_stack_trace};

/// When the cluster feature is off, the global scope degrades to the local
/// all-threads capture.
#[cfg(not(feature = "cluster"))]
pub fn get_global_call_stacks() -> MultiStack {
    get_all_call_stacks()
}
