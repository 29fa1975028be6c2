// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The top-level operations: capture, symbolicate, aggregate.
//!
//! These glue the collector, the symbolicator and the multi-stack tree
//! together.  Symbolication is batched: addresses from every thread are
//! deduplicated first so each distinct address is resolved exactly once no
//! matter how many threads share it.

use crate::collector;
use crate::frame::StackFrame;
use crate::multistack::MultiStack;
use crate::registry::{self, ThreadHandle};
use crate::symbolicate;

/// Resolved frame for one address.
pub fn get_stack_info(address: u64) -> StackFrame {
    symbolicate::resolve_one(address)
}

/// Resolved frames for a batch of addresses, in input order.
pub fn get_stack_info_vec(addresses: &[u64]) -> Vec<StackFrame> {
    symbolicate::resolve(addresses)
}

/// Symbolicated call stack of the calling thread, innermost frame first.
pub fn get_call_stack() -> Vec<StackFrame> {
    get_stack_info_vec(&collector::backtrace())
}

/// Symbolicated call stack of another thread; empty when the thread does
/// not answer the rendezvous.
pub fn get_call_stack_for(thread: ThreadHandle) -> Vec<StackFrame> {
    get_stack_info_vec(&collector::backtrace_of(thread))
}

/// Merges raw traces into a multi-stack, resolving each distinct address
/// once.
pub(crate) fn generate_multi_stack(traces: &[Vec<u64>]) -> MultiStack {
    let mut addresses: Vec<u64> = Vec::with_capacity(1024);
    for trace in traces {
        for &address in trace {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
    }
    let resolved = get_stack_info_vec(&addresses);
    let find = |address: u64| {
        let idx = addresses.iter().position(|&a| a == address).unwrap();
        resolved[idx].clone()
    };
    let mut multistack = MultiStack::default();
    multistack.n = traces.len() as i32;
    for trace in traces {
        let stack: Vec<StackFrame> = trace.iter().map(|&a| find(a)).collect();
        multistack.add(&stack);
    }
    multistack
}

/// Multi-stack of the given threads, in registry order.
pub(crate) fn generate_multi_stack_for_threads(threads: &[ThreadHandle]) -> MultiStack {
    let traces: Vec<Vec<u64>> = threads
        .iter()
        .map(|&thread| collector::backtrace_thread(thread))
        .collect();
    generate_multi_stack(&traces)
}

/// Stacks of every registered thread in this process, merged into one tree.
pub fn get_all_call_stacks() -> MultiStack {
    let threads = registry::registered_threads();
    generate_multi_stack_for_threads(&threads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_call_stack_contains_callers() {
        fn innermost_probe() -> Vec<StackFrame> {
            get_call_stack()
        }
        let stack = innermost_probe();
        assert!(!stack.is_empty());
        // Each frame carries the address it was asked about.
        assert!(stack.iter().all(|f| f.address != 0));
    }

    #[test]
    fn test_generate_multi_stack_counts_traces() {
        let trace = collector::backtrace();
        let multistack = generate_multi_stack(&[trace.clone(), trace]);
        assert_eq!(multistack.n, 2);
        // Identical traces collapse into a single child chain.
        assert!(multistack.children.len() <= 1);
        if let Some(child) = multistack.children.first() {
            assert_eq!(child.n, 2);
        }
    }

    #[test]
    fn test_generate_multi_stack_empty_input() {
        let multistack = generate_multi_stack(&[]);
        assert!(multistack.is_empty());
    }

    #[test]
    fn test_get_all_call_stacks_with_registered_thread() {
        registry::register_thread();
        let multistack = get_all_call_stacks();
        assert!(multistack.n >= 1);
        assert!(!multistack.children.is_empty());
        registry::unregister_thread(registry::this_thread());
    }
}
