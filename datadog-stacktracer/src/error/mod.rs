// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fatal-error value type and its report rendering.
//!
//! An [`AbortError`] carries everything needed to print the final
//! diagnostic: what happened, where, how much memory was in use, and a raw
//! stack whose scope is chosen by [`StackKind`].  Symbolication and
//! multi-thread collection happen lazily when the report is rendered, so
//! constructing the error stays cheap in the fault path.

pub mod handler;

use crate::shared::memory::memory_usage;
use crate::{api, cleanup, collector, registry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::SeqCst;

/// What ended the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminateReason {
    Abort,
    Signal,
    Exception,
    Mpi,
    Unknown,
}

/// Which stacks the report should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StackKind {
    None = 0,
    Local = 1,
    Threaded = 2,
    Global = 3,
}

impl StackKind {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StackKind::Local,
            2 => StackKind::Threaded,
            3 => StackKind::Global,
            _ => StackKind::None,
        }
    }
}

static DEFAULT_STACK_KIND: AtomicU8 = AtomicU8::new(StackKind::Global as u8);

pub fn set_default_stack_type(kind: StackKind) {
    DEFAULT_STACK_KIND.store(kind as u8, SeqCst);
}

pub fn get_default_stack_type() -> StackKind {
    StackKind::from_u8(DEFAULT_STACK_KIND.load(SeqCst))
}

/// Where in the source an abort was requested.  Line 0 with an empty file
/// means the caller provided none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub function: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn is_empty(&self) -> bool {
        self.file.is_empty() && self.line == 0
    }
}

/// Captures the call site as a [`SourceLocation`].
#[macro_export]
macro_rules! source_location {
    () => {
        $crate::SourceLocation {
            file: file!().to_string(),
            function: module_path!().to_string(),
            line: line!(),
            column: column!(),
        }
    };
}

/// Builds an [`AbortError`] at the call site and panics with it; the
/// installed error handler receives it as-is.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        std::panic::panic_any($crate::abort(format!($($arg)*), $crate::source_location!()))
    };
}

#[derive(Debug, Clone)]
pub struct AbortError {
    pub message: String,
    pub source: SourceLocation,
    pub reason: TerminateReason,
    pub stack_kind: StackKind,
    pub signal: i32,
    pub bytes_used: u64,
    /// Raw return addresses captured when the error was built.
    pub stack: Vec<u64>,
}

impl Default for AbortError {
    fn default() -> Self {
        Self {
            message: String::new(),
            source: SourceLocation::default(),
            reason: TerminateReason::Unknown,
            stack_kind: StackKind::Local,
            signal: 0,
            bytes_used: 0,
            stack: Vec::new(),
        }
    }
}

/// Builds a fully-populated abort error for an explicit program abort.
/// This is the preferred failure-path primitive for host programs:
/// typically spelled `fatal!(...)` or `return Err(abort(...).into())`.
pub fn abort(message: impl Into<String>, source: SourceLocation) -> AbortError {
    AbortError {
        message: message.into(),
        source,
        reason: TerminateReason::Abort,
        stack_kind: get_default_stack_type(),
        signal: 0,
        bytes_used: memory_usage(),
        stack: collector::backtrace(),
    }
}

impl AbortError {
    /// The full rendered report, as written to stderr on termination.
    pub fn what(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AbortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            TerminateReason::Abort => write!(f, "Program abort called")?,
            TerminateReason::Signal => write!(f, "Unhandled signal ({}) caught", self.signal)?,
            TerminateReason::Exception => write!(f, "Unhandled exception caught")?,
            TerminateReason::Mpi => write!(f, "Error calling MPI routine")?,
            TerminateReason::Unknown => write!(f, "Unknown error called")?,
        }
        if !self.source.file.is_empty() {
            write!(f, " in file '{}'", self.source.file)?;
            if self.source.line > 0 {
                write!(f, " at line {}", self.source.line)?;
            }
        }
        writeln!(f, ":")?;
        writeln!(f, "   {}", self.message)?;
        if self.bytes_used > 0 {
            writeln!(f, "Bytes used = {}", self.bytes_used)?;
        }
        if !self.stack.is_empty() && self.stack_kind != StackKind::None {
            writeln!(f, "Stack Trace:")?;
            match self.stack_kind {
                StackKind::Local => {
                    for frame in api::get_stack_info_vec(&self.stack) {
                        if !cleanup::keep(&frame) {
                            continue;
                        }
                        writeln!(f, " {}", frame.print(16, 20, 32))?;
                    }
                }
                StackKind::Threaded | StackKind::Global => {
                    let mut traces = vec![self.stack.clone()];
                    let me = registry::this_thread();
                    for thread in registry::registered_threads() {
                        if thread != me {
                            traces.push(collector::backtrace_of(thread));
                        }
                    }
                    let mut multistack = api::generate_multi_stack(&traces);
                    #[cfg(feature = "cluster")]
                    if self.stack_kind == StackKind::Global {
                        multistack.merge(&crate::cluster::gather_remote_call_stacks());
                    }
                    cleanup::cleanup_stack_trace(&mut multistack);
                    write!(f, "{}", multistack.print_string(" "))?;
                }
                StackKind::None => {}
            }
        }
        Ok(())
    }
}

impl std::error::Error for AbortError {}
