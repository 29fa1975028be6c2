// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-process monitor task.
//!
//! One cooperative background thread polls the duplicated communicator for
//! stack requests and answers each with this process's packed multi-stack.
//! The request payload is the reply tag, so concurrent requesters never see
//! each other's replies.

use super::comm::Communicator;
use crate::shared::constants::{MONITOR_POLL, REQUEST_TAG};
use crate::{api, registry};
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::thread::JoinHandle;

pub const STATUS_RUNNING: u8 = 1;
pub const STATUS_STOPPING: u8 = 2;

pub struct StackMonitor {
    status: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl StackMonitor {
    /// Spawns the monitor on its own duplicate of the communicator.
    pub fn start(comm: Box<dyn Communicator>) -> Self {
        let status = Arc::new(AtomicU8::new(STATUS_RUNNING));
        let thread_status = status.clone();
        let handle = std::thread::Builder::new()
            .name("stack-monitor".to_string())
            .spawn(move || monitor_loop(comm, thread_status))
            .expect("failed to spawn stack monitor");
        Self {
            status,
            handle: Some(handle),
        }
    }

    /// Signals the loop to exit and joins it.
    pub fn stop(&mut self) {
        self.status.store(STATUS_STOPPING, SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StackMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(comm: Box<dyn Communicator>, status: Arc<AtomicU8>) {
    while status.load(SeqCst) == STATUS_RUNNING {
        let Some(probe) = comm.iprobe(None, REQUEST_TAG) else {
            std::thread::sleep(MONITOR_POLL);
            continue;
        };
        let request = comm.recv(probe.source, REQUEST_TAG);
        if request.len() < 4 {
            log::warn!("Malformed stack request from rank {}", probe.source);
            continue;
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&request[..4]);
        let reply_tag = i32::from_le_bytes(raw);
        let threads = registry::registered_threads();
        if threads.is_empty() {
            continue;
        }
        let multistack = api::generate_multi_stack_for_threads(&threads);
        comm.send(probe.source, reply_tag, &multistack.pack_vec());
    }
}
