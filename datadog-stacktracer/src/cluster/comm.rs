// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The message-passing fabric as an injected capability.
//!
//! The engine only needs a small verb set, so the fabric is a trait: a real
//! deployment binds it to its MPI-like layer, a single process uses
//! [`NullComm`], and tests use the in-process [`LocalFabric`].

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Result of a successful probe: who sent, and how many bytes are waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub source: usize,
    pub bytes: usize,
}

/// Point-to-point verbs over an ordered, tagged byte transport.
///
/// `send` must not block on the receiver (requests to dead peers are
/// dropped, not retried), and `recv` is only called after a matching
/// `iprobe`, so implementations never need unbounded buffering on the
/// receive side.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Independent communication context over the same peer group.  The
    /// monitor task owns a duplicate so its traffic cannot collide with the
    /// host program's.
    fn duplicate(&self) -> Box<dyn Communicator>;
    fn send(&self, dest: usize, tag: i32, data: &[u8]);
    /// Receives a matching message, blocking until one arrives.
    fn recv(&self, source: usize, tag: i32) -> Vec<u8>;
    /// Non-blocking check for a matching message from any rank (`None`
    /// source) or a specific one.
    fn iprobe(&self, source: Option<usize>, tag: i32) -> Option<Probe>;
    fn barrier(&self);
    /// Broadcasts `value` from `root`; every rank returns the root's value.
    fn broadcast_int(&self, root: usize, value: i32) -> i32;
    /// Best-effort fabric teardown on a fatal error.
    fn abort(&self) {}
}

/// Single-process fabric: rank 0 of 1, no traffic.
pub struct NullComm;

impl Communicator for NullComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn duplicate(&self) -> Box<dyn Communicator> {
        Box::new(NullComm)
    }
    fn send(&self, _dest: usize, _tag: i32, _data: &[u8]) {}
    fn recv(&self, _source: usize, _tag: i32) -> Vec<u8> {
        Vec::new()
    }
    fn iprobe(&self, _source: Option<usize>, _tag: i32) -> Option<Probe> {
        None
    }
    fn barrier(&self) {}
    fn broadcast_int(&self, _root: usize, value: i32) -> i32 {
        value
    }
}

struct Message {
    source: usize,
    tag: i32,
    data: Vec<u8>,
}

struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    arrived: Condvar,
}

struct FabricShared {
    mailboxes: Vec<Mailbox>,
    barrier: std::sync::Barrier,
}

/// In-process fabric connecting `size` pseudo-ranks through shared
/// mailboxes.  Each rank is its own `Communicator`; duplicates share the
/// mailboxes, which is close enough to a communicator duplicate for one
/// process.
pub struct LocalFabric {
    shared: Arc<FabricShared>,
    rank: usize,
}

impl LocalFabric {
    /// Creates the fabric, one communicator per rank.
    pub fn new(size: usize) -> Vec<LocalFabric> {
        let shared = Arc::new(FabricShared {
            mailboxes: (0..size)
                .map(|_| Mailbox {
                    queue: Mutex::new(VecDeque::new()),
                    arrived: Condvar::new(),
                })
                .collect(),
            barrier: std::sync::Barrier::new(size),
        });
        (0..size)
            .map(|rank| LocalFabric {
                shared: shared.clone(),
                rank,
            })
            .collect()
    }
}

impl Communicator for LocalFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    fn duplicate(&self) -> Box<dyn Communicator> {
        Box::new(LocalFabric {
            shared: self.shared.clone(),
            rank: self.rank,
        })
    }

    fn send(&self, dest: usize, tag: i32, data: &[u8]) {
        let Some(mailbox) = self.shared.mailboxes.get(dest) else {
            return;
        };
        let mut queue = mailbox.queue.lock().unwrap();
        queue.push_back(Message {
            source: self.rank,
            tag,
            data: data.to_vec(),
        });
        mailbox.arrived.notify_all();
    }

    fn recv(&self, source: usize, tag: i32) -> Vec<u8> {
        let mailbox = &self.shared.mailboxes[self.rank];
        let mut queue = mailbox.queue.lock().unwrap();
        loop {
            if let Some(idx) = queue
                .iter()
                .position(|m| m.source == source && m.tag == tag)
            {
                return queue.remove(idx).unwrap().data;
            }
            queue = mailbox
                .arrived
                .wait_timeout(queue, Duration::from_millis(50))
                .unwrap()
                .0;
        }
    }

    fn iprobe(&self, source: Option<usize>, tag: i32) -> Option<Probe> {
        let mailbox = &self.shared.mailboxes[self.rank];
        let queue = mailbox.queue.lock().unwrap();
        queue
            .iter()
            .find(|m| m.tag == tag && source.map_or(true, |s| m.source == s))
            .map(|m| Probe {
                source: m.source,
                bytes: m.data.len(),
            })
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn broadcast_int(&self, root: usize, value: i32) -> i32 {
        const BCAST_TAG: i32 = -2;
        if self.rank == root {
            for dest in 0..self.size() {
                if dest != root {
                    self.send(dest, BCAST_TAG, &value.to_le_bytes());
                }
            }
            value
        } else {
            let data = self.recv(root, BCAST_TAG);
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[..4]);
            i32::from_le_bytes(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_comm_is_single_rank() {
        let comm = NullComm;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        assert!(comm.iprobe(None, 1).is_none());
    }

    #[test]
    fn test_local_fabric_send_probe_recv() {
        let mut ranks = LocalFabric::new(2);
        let r1 = ranks.pop().unwrap();
        let r0 = ranks.pop().unwrap();
        r0.send(1, 7, b"hello");
        let probe = r1.iprobe(None, 7).unwrap();
        assert_eq!(probe.source, 0);
        assert_eq!(probe.bytes, 5);
        assert_eq!(r1.recv(0, 7), b"hello");
        assert!(r1.iprobe(None, 7).is_none());
    }

    #[test]
    fn test_local_fabric_tag_filtering() {
        let mut ranks = LocalFabric::new(2);
        let r1 = ranks.pop().unwrap();
        let r0 = ranks.pop().unwrap();
        r0.send(1, 3, b"three");
        r0.send(1, 4, b"four");
        assert!(r1.iprobe(None, 5).is_none());
        assert_eq!(r1.recv(0, 4), b"four");
        assert_eq!(r1.recv(0, 3), b"three");
    }

    #[test]
    fn test_broadcast_int() {
        let mut ranks = LocalFabric::new(2);
        let r1 = ranks.pop().unwrap();
        let r0 = ranks.pop().unwrap();
        let helper = std::thread::spawn(move || r1.broadcast_int(0, 0));
        assert_eq!(r0.broadcast_int(0, 42), 42);
        assert_eq!(helper.join().unwrap(), 42);
    }
}
