//! Message-passing façade for the repartitioning pipeline.
//!
//! The pipeline needs exactly four primitives: rank/size queries, a barrier,
//! an all-reduce sum, and point-to-point delivery of opaque byte buffers.
//! [`LocalComm`] implements them for N ranks inside one process (each rank on
//! its own thread) over a shared mailbox; it is the backend the test suite
//! runs on, and [`LocalComm::serial`] degenerates to a single-rank loopback.
//!
//! Collective calls are synchronous group operations with no timeout: every
//! rank must issue them in the same order and the same number of times, or
//! the group deadlocks. That contract is inherited by everything above this
//! module.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

/// Blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync {
    /// Rank of the calling process within the group.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;
    /// Block until every rank in the group has entered the barrier.
    fn barrier(&self);
    /// Collective sum over one `u64` contribution per rank.
    fn all_reduce_sum(&self, value: u64) -> u64;
    /// Deliver `buf` to `peer`; never blocks on the receiver.
    fn send(&self, peer: usize, tag: u16, buf: &[u8]);
    /// Block until a message from `peer` with `tag` arrives.
    fn recv(&self, peer: usize, tag: u16) -> Vec<u8>;
}

type MailKey = (usize, usize, u16); // (src, dst, tag)

struct BarrierGen {
    arrived: usize,
    generation: u64,
}

struct GroupState {
    size: usize,
    mailbox: DashMap<MailKey, VecDeque<Bytes>>,
    barrier_lock: Mutex<BarrierGen>,
    barrier_cv: Condvar,
    reduce_slots: Mutex<Vec<u64>>,
}

/// In-process communicator: N ranks sharing one mailbox.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    group: Arc<GroupState>,
}

impl LocalComm {
    /// Create a group of `size` communicators, one per rank. Hand each to
    /// its own thread.
    pub fn group(size: usize) -> Vec<LocalComm> {
        assert!(size > 0, "communicator group must have at least one rank");
        let state = Arc::new(GroupState {
            size,
            mailbox: DashMap::new(),
            barrier_lock: Mutex::new(BarrierGen {
                arrived: 0,
                generation: 0,
            }),
            barrier_cv: Condvar::new(),
            reduce_slots: Mutex::new(vec![0; size]),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                group: Arc::clone(&state),
            })
            .collect()
    }

    /// Single-rank loopback communicator.
    pub fn serial() -> LocalComm {
        LocalComm {
            rank: 0,
            group: Arc::new(GroupState {
                size: 1,
                mailbox: DashMap::new(),
                barrier_lock: Mutex::new(BarrierGen {
                    arrived: 0,
                    generation: 0,
                }),
                barrier_cv: Condvar::new(),
                reduce_slots: Mutex::new(vec![0]),
            }),
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn barrier(&self) {
        let mut guard = self.group.barrier_lock.lock();
        guard.arrived += 1;
        if guard.arrived == self.group.size {
            guard.arrived = 0;
            guard.generation += 1;
            self.group.barrier_cv.notify_all();
        } else {
            let entered = guard.generation;
            while guard.generation == entered {
                self.group.barrier_cv.wait(&mut guard);
            }
        }
    }

    fn all_reduce_sum(&self, value: u64) -> u64 {
        self.group.reduce_slots.lock()[self.rank] = value;
        self.barrier();
        let sum = self.group.reduce_slots.lock().iter().sum();
        // nobody may overwrite a slot until every rank has read the sum
        self.barrier();
        sum
    }

    fn send(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        self.group
            .mailbox
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn recv(&self, peer: usize, tag: u16) -> Vec<u8> {
        let key = (peer, self.rank, tag);
        loop {
            if let Some(mut queue) = self.group.mailbox.get_mut(&key) {
                if let Some(bytes) = queue.pop_front() {
                    return bytes.to_vec();
                }
            }
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_loopback_roundtrip() {
        let comm = LocalComm::serial();
        comm.send(0, 7, &[1, 2, 3, 4]);
        assert_eq!(comm.recv(0, 7), vec![1, 2, 3, 4]);
        assert_eq!(comm.all_reduce_sum(5), 5);
    }

    #[test]
    fn two_rank_exchange_and_reduce() {
        let comms = LocalComm::group(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let peer = 1 - comm.rank();
                    comm.send(peer, 3, &[comm.rank() as u8; 2]);
                    let got = comm.recv(peer, 3);
                    assert_eq!(got, vec![peer as u8; 2]);
                    comm.barrier();
                    comm.all_reduce_sum(comm.rank() as u64 + 1)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 3);
        }
    }

    #[test]
    fn barrier_generations_advance_across_rounds() {
        let handles: Vec<_> = LocalComm::group(3)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    for round in 0..16u64 {
                        assert_eq!(comm.all_reduce_sum(round), 3 * round);
                        comm.barrier();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn messages_queue_in_fifo_order() {
        let comm = LocalComm::serial();
        comm.send(0, 1, &[1]);
        comm.send(0, 1, &[2]);
        assert_eq!(comm.recv(0, 1), vec![1]);
        assert_eq!(comm.recv(0, 1), vec![2]);
    }
}
