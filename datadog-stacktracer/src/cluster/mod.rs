// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster-wide stack gathering.
//!
//! Every participating process runs a monitor task answering stack
//! requests (see [`monitor`]).  A requester fans a fresh reply tag out to
//! every other rank, folds the replies into its own multi-stack as they
//! arrive, and gives up on stragglers when the deadline passes: a gather
//! always returns in bounded time, and slow or dead peers simply do not
//! contribute.

pub mod comm;
pub mod monitor;

use crate::multistack::MultiStack;
use crate::shared::constants::{
    GATHER_DEADLINE_BASE, GATHER_DEADLINE_PER_RANK, REPLY_TAG_MAX, REPLY_TAG_MIN, REQUEST_TAG,
};
use crate::shared::deadline::Deadline;
use crate::{api, registry};
use comm::Communicator;
use monitor::StackMonitor;
use rand::Rng;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Mutex;
use std::time::Duration;

struct ClusterState {
    monitor: StackMonitor,
    comm: Box<dyn Communicator>,
}

static CLUSTER: Mutex<Option<ClusterState>> = Mutex::new(None);
static CLUSTER_DISABLED: AtomicBool = AtomicBool::new(false);

/// 0 means "derive from the fabric size".
static GATHER_DEADLINE_MS: AtomicU64 = AtomicU64::new(0);

/// Overrides the gather deadline; `None` restores the size-derived default.
pub fn set_global_deadline(deadline: Option<Duration>) {
    GATHER_DEADLINE_MS.store(
        deadline.map_or(0, |d| d.as_millis().max(1) as u64),
        SeqCst,
    );
}

fn gather_deadline(size: usize) -> Duration {
    let configured = GATHER_DEADLINE_MS.load(SeqCst);
    if configured != 0 {
        return Duration::from_millis(configured);
    }
    GATHER_DEADLINE_BASE + GATHER_DEADLINE_PER_RANK * size as u32
}

/// Verifies that foreign-thread capture actually works on this host: a
/// short-lived registered thread must both appear in the registry and
/// produce a non-empty trace.
fn probe_thread_capture() -> bool {
    let (tx, rx) = std::sync::mpsc::channel();
    let helper = std::thread::spawn(move || {
        registry::register_thread();
        tx.send(registry::this_thread()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
    });
    let handle = rx.recv().unwrap();
    std::thread::yield_now();
    let works = registry::registered_threads().contains(&handle)
        && !crate::collector::backtrace_of(handle).is_empty();
    let _ = helper.join();
    works
}

/// Starts the monitor task for this process.
///
/// Rank 0 first verifies thread capture works and broadcasts the verdict;
/// platforms where the rendezvous is stubbed out disable the feature
/// cluster-wide rather than hanging every gather.
pub fn global_call_stack_initialize(comm: Box<dyn Communicator>) {
    let mut cluster = CLUSTER.lock().unwrap();
    if cluster.is_some() {
        log::warn!("Cluster stack gathering already initialized");
        return;
    }
    let works = if comm.rank() == 0 {
        i32::from(probe_thread_capture())
    } else {
        0
    };
    let works = comm.broadcast_int(0, works);
    if works == 0 {
        if comm.rank() == 0 {
            log::warn!("Foreign-thread capture unavailable; cluster stack gathering disabled");
        }
        CLUSTER_DISABLED.store(true, SeqCst);
        return;
    }
    CLUSTER_DISABLED.store(false, SeqCst);
    let monitor = StackMonitor::start(comm.duplicate());
    *cluster = Some(ClusterState { monitor, comm });
    std::thread::sleep(Duration::from_millis(50));
}

/// Stops the monitor and releases the fabric.
pub fn global_call_stack_finalize() {
    let mut cluster = CLUSTER.lock().unwrap();
    if let Some(mut state) = cluster.take() {
        state.monitor.stop();
    }
    CLUSTER_DISABLED.store(false, SeqCst);
}

/// Requester side of the gather protocol, against an explicit fabric.
pub(crate) fn gather_remote(comm: &dyn Communicator) -> MultiStack {
    let size = comm.size();
    let rank = comm.rank();
    let mut multistack = MultiStack::default();
    if size <= 1 {
        return multistack;
    }
    let reply_tag: i32 = rand::thread_rng().gen_range(REPLY_TAG_MIN..=REPLY_TAG_MAX);
    for dest in 0..size {
        if dest != rank {
            comm.send(dest, REQUEST_TAG, &reply_tag.to_le_bytes());
        }
    }
    let deadline = Deadline::new(gather_deadline(size));
    let mut finished = 1;
    while finished < size && !deadline.expired() {
        let Some(probe) = comm.iprobe(None, reply_tag) else {
            std::thread::yield_now();
            continue;
        };
        let data = comm.recv(probe.source, reply_tag);
        match MultiStack::unpack_vec(&data) {
            Ok(remote) => multistack.merge(&remote),
            Err(e) => log::warn!("Discarding malformed stack reply from rank {}: {e}", probe.source),
        }
        finished += 1;
    }
    multistack
}

/// Stacks of every remote peer, empty when the cluster layer is down.
pub(crate) fn gather_remote_call_stacks() -> MultiStack {
    let cluster = CLUSTER.lock().unwrap();
    match cluster.as_ref() {
        Some(state) => gather_remote(state.comm.as_ref()),
        None => {
            if !CLUSTER_DISABLED.load(SeqCst) {
                log::warn!("Global stack requested without cluster initialization");
            }
            MultiStack::default()
        }
    }
}

/// Stacks of every registered thread on every rank, merged into one tree.
/// Degrades to the local all-threads capture when the fabric is absent.
pub fn get_global_call_stacks() -> MultiStack {
    let threads = registry::registered_threads();
    let mut multistack = api::generate_multi_stack_for_threads(&threads);
    multistack.merge(&gather_remote_call_stacks());
    multistack
}

/// Best-effort fabric teardown from the fatal path.
pub(crate) fn abort_fabric() {
    if let Ok(cluster) = CLUSTER.try_lock() {
        if let Some(state) = cluster.as_ref() {
            state.comm.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comm::{LocalFabric, NullComm};

    // The gather deadline is process-global; tests that touch it are
    // serialized.
    static TEST_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn test_gather_on_single_rank_is_empty() {
        let stack = gather_remote(&NullComm);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_gather_times_out_on_dead_peer() {
        let _guard = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        let mut ranks = LocalFabric::new(2);
        let _r1 = ranks.pop().unwrap();
        let r0 = ranks.pop().unwrap();
        set_global_deadline(Some(Duration::from_millis(100)));
        let start = std::time::Instant::now();
        let stack = gather_remote(&r0);
        set_global_deadline(None);
        assert!(stack.is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_gather_two_ranks() {
        let _guard = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        let mut ranks = LocalFabric::new(2);
        let r1 = ranks.pop().unwrap();
        let r0 = ranks.pop().unwrap();
        registry::register_thread();
        let mut monitor = StackMonitor::start(Box::new(r1));
        let stack = gather_remote(&r0);
        monitor.stop();
        registry::unregister_thread(registry::this_thread());
        assert!(!stack.is_empty());
        assert!(stack.n >= 1);
    }

    #[test]
    fn test_deadline_override() {
        let _guard = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        set_global_deadline(Some(Duration::from_millis(250)));
        assert_eq!(gather_deadline(64), Duration::from_millis(250));
        set_global_deadline(None);
        assert_eq!(
            gather_deadline(2),
            GATHER_DEADLINE_BASE + GATHER_DEADLINE_PER_RANK * 2
        );
    }
}
