// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fatal-error interception: signal handlers, the panic hook, and the
//! terminate path.
//!
//! The handler function lives behind an atomic pointer so the asynchronous
//! paths can reach it without taking a lock.  It is always either null or a
//! `Box::into_raw` product, so teardown can reconstitute and drop it.

use super::{get_default_stack_type, AbortError, SourceLocation, StackKind, TerminateReason};
use crate::shared::memory::memory_usage;
use crate::{collector, signals};
use std::panic::PanicHookInfo;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicPtr};
use std::sync::Mutex;

type HandlerFn = Box<dyn Fn(AbortError) + Send + Sync>;

struct HandlerEntry(HandlerFn);

static HANDLER: AtomicPtr<HandlerEntry> = AtomicPtr::new(ptr::null_mut());

/// Tracks which signal numbers currently route to the terminate handler.
const MAX_SIGNALS: usize = 128;
static SIGNALS_SET: [AtomicBool; MAX_SIGNALS] = [const { AtomicBool::new(false) }; MAX_SIGNALS];

/// Serializes the fatal path; a second fatal entry aborts immediately.
static TERMINATE_LOCK: Mutex<()> = Mutex::new(());
static FATAL_ENTRIES: AtomicU32 = AtomicU32::new(0);

/// When set, the installed handler is expected to unwind instead of
/// exiting, and `terminate` skips the fabric abort.
static THROW_EXCEPTION: AtomicBool = AtomicBool::new(false);

/// Configures what the default fatal path does, and the default stack
/// scope attached to new abort errors.
pub fn set_abort_behavior(throw_exception: bool, stack_kind: StackKind) {
    THROW_EXCEPTION.store(throw_exception, SeqCst);
    super::set_default_stack_type(stack_kind);
}

fn swap_handler(new: *mut HandlerEntry) {
    let old = HANDLER.swap(new, SeqCst);
    if !old.is_null() {
        // Safety: non-null values only ever come from Box::into_raw above.
        drop(unsafe { Box::from_raw(old) });
    }
}

/// Routes a fatal error to the installed handler, or to [`terminate`] when
/// none is installed.
pub(crate) fn dispatch(err: AbortError) {
    let entry = HANDLER.load(SeqCst);
    if entry.is_null() {
        terminate(&err);
    }
    // Safety: the pointer is only replaced via swap_handler; the entry is
    // never freed while reachable from here in a handled program.
    let entry = unsafe { &*entry };
    (entry.0)(err);
}

/// The default signal-to-error translation: builds an [`AbortError`] of
/// the requested default scope and hands it to the handler.
pub extern "C" fn terminate_signal_handler(signal: libc::c_int) {
    let err = AbortError {
        message: signals::signal_name(signal),
        source: SourceLocation::default(),
        reason: TerminateReason::Signal,
        stack_kind: get_default_stack_type(),
        signal,
        bytes_used: memory_usage(),
        stack: collector::backtrace(),
    };
    dispatch(err);
}

static ALT_STACK_CREATED: AtomicBool = AtomicBool::new(false);

/// Allocates a dedicated signal stack with a guard page at the low end, so
/// the handler still runs when the fault was a stack overflow.
unsafe fn create_alt_stack() -> anyhow::Result<()> {
    let page_size = page_size::get();
    let stack_size = libc::SIGSTKSZ.max(16 * page_size);
    let stackp = libc::mmap(
        ptr::null_mut(),
        stack_size + page_size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(
        stackp != libc::MAP_FAILED,
        "failed to allocate an alternative stack"
    );
    let guard_result = libc::mprotect(stackp, page_size, libc::PROT_NONE);
    anyhow::ensure!(
        guard_result == 0,
        "failed to set up alternative stack guard page"
    );
    let stack = libc::stack_t {
        ss_sp: stackp.add(page_size),
        ss_flags: 0,
        ss_size: stack_size,
    };
    let rval = libc::sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    Ok(())
}

fn ensure_alt_stack() {
    if ALT_STACK_CREATED
        .compare_exchange(false, true, SeqCst, SeqCst)
        .is_ok()
    {
        // Safety: first caller only; the mapping lives for the process.
        if let Err(e) = unsafe { create_alt_stack() } {
            log::warn!("No alternative signal stack: {e}");
        }
    }
}

/// Installs `handler` for every signal in `signals`.  The previous
/// dispositions are not preserved; [`clear_signal`] restores the default.
pub fn set_signals(signals: &[i32], handler: extern "C" fn(libc::c_int)) {
    ensure_alt_stack();
    for &sig in signals {
        if sig <= 0 || sig as usize >= MAX_SIGNALS {
            continue;
        }
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handler as libc::sighandler_t;
        // SA_ONSTACK is safe even when no altstack exists: the normal
        // stack is used as if the flag were clear.
        action.sa_flags = libc::SA_NODEFER | libc::SA_ONSTACK;
        // Safety: installing a handler for a catchable signal is always
        // permitted; SIGKILL/SIGSTOP simply fail.
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(sig, &action, ptr::null_mut());
        }
        SIGNALS_SET[sig as usize].store(true, SeqCst);
    }
    std::thread::yield_now();
}

/// Restores the default disposition of one signal.
pub fn clear_signal(signal: i32) {
    if signal <= 0 || signal as usize >= MAX_SIGNALS {
        return;
    }
    if SIGNALS_SET[signal as usize].swap(false, SeqCst) {
        // Safety: resetting to SIG_DFL is always permitted.
        unsafe { libc::signal(signal, libc::SIG_DFL) };
    }
}

/// Restores the default disposition of every signal set via [`set_signals`].
pub fn clear_signals() {
    for sig in 1..MAX_SIGNALS as i32 {
        clear_signal(sig);
    }
}

/// Translates a panic into an [`AbortError`], mirroring the exception
/// rethrow-and-classify ladder: an `AbortError` payload passes through
/// untouched, string payloads become the message, anything else reports as
/// an unknown exception.
fn error_from_panic(info: &PanicHookInfo<'_>) -> AbortError {
    let payload = info.payload();
    let mut err = if let Some(err) = payload.downcast_ref::<AbortError>() {
        err.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        AbortError {
            message: msg.to_string(),
            ..Default::default()
        }
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        AbortError {
            message: msg.clone(),
            ..Default::default()
        }
    } else {
        AbortError {
            message: "Unknown exception".to_string(),
            ..Default::default()
        }
    };
    if err.reason == TerminateReason::Unknown {
        err.reason = TerminateReason::Exception;
    }
    if err.source.is_empty() {
        if let Some(location) = info.location() {
            err.source = SourceLocation {
                file: location.file().to_string(),
                function: String::new(),
                line: location.line(),
                column: location.column(),
            };
        }
    }
    if err.bytes_used == 0 {
        err.bytes_used = memory_usage();
    }
    if err.stack.is_empty() {
        err.stack_kind = StackKind::Local;
        err.stack = collector::backtrace();
    }
    err
}

fn panic_hook(info: &PanicHookInfo<'_>) {
    let err = error_from_panic(info);
    clear_signals();
    dispatch(err);
}

/// Installs the fatal-error handler: a panic hook for unhandled panics and
/// a signal handler for each requested signal.
pub fn set_error_handler(handler: HandlerFn, signals: &[i32]) {
    swap_handler(Box::into_raw(Box::new(HandlerEntry(handler))));
    std::panic::set_hook(Box::new(panic_hook));
    set_signals(signals, terminate_signal_handler);
}

/// Removes the handler, the panic hook, and every signal catch.
pub fn clear_error_handler() {
    swap_handler(ptr::null_mut());
    let _ = std::panic::take_hook();
    clear_signals();
}

fn platform_abort() -> ! {
    // Safety: abort has no preconditions.
    unsafe { libc::abort() }
}

/// The default fatal path: print the report to stderr, tear the fabric
/// down when one is attached, and abort the process.  Re-entry (a second
/// fatal error while handling the first) skips straight to the abort.
pub fn terminate(err: &AbortError) -> ! {
    if FATAL_ENTRIES.fetch_add(1, SeqCst) > 0 {
        platform_abort();
    }
    let _lock = TERMINATE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    clear_error_handler();
    eprint!("{err}");
    if !THROW_EXCEPTION.load(SeqCst) {
        #[cfg(feature = "cluster")]
        crate::cluster::abort_fabric();
    }
    platform_abort()
}
