// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size free-list of reusable packets. The pool never grows past its
//! initial capacity; a caller that empties it is expected to flush pending
//! fds and retry rather than allocate around it (see `Core::checkout_packet`).
//!
//! Pre-fills a fixed region and hands packets out from a lock-free free
//! list, the same shape as `socket::recv::pool::Pool`/`Free`, minus that
//! pool's self-referential raw-pointer layout, which exists there to
//! support zero-copy UDP GRO segments this crate doesn't need.

use crate::packet::Packet;
use crossbeam_queue::ArrayQueue;

/// A process-wide (or test-scoped) pool of reusable packets.
pub(crate) struct Pool {
    free: ArrayQueue<Box<Packet>>,
    capacity: usize,
}

impl Pool {
    pub(crate) fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity.max(1));
        for _ in 0..capacity {
            // capacity was just reserved above; this can't fail.
            let _ = free.push(Box::new(Packet::inline(&[])));
        }
        Self { free, capacity }
    }

    /// Tries to grab a cleared packet from the free list. Returns `None`
    /// when the pool is exhausted; the caller is expected to drive
    /// `flush_all` and retry rather than allocate around this (see
    /// `Core::checkout_packet`).
    #[inline]
    pub(crate) fn try_grab(&self) -> Option<Box<Packet>> {
        self.free.pop()
    }

    /// Returns a packet to the pool. Every packet in circulation was
    /// originally handed out by this same pool, so the free list can never
    /// actually be full at this point; the push failing would mean a packet
    /// was freed twice or came from a different pool.
    #[inline]
    pub(crate) fn free(&self, mut packet: Box<Packet>) {
        packet.reset();
        if self.free.push(packet).is_err() {
            tracing::warn!("packet freed back to a full pool, dropping it");
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of packets currently sitting in the free list.
    #[inline]
    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_and_free_round_trip() {
        let pool = Pool::new(4);
        let mut packets = Vec::new();
        for _ in 0..4 {
            packets.push(pool.try_grab().expect("pool should have capacity"));
        }
        assert!(pool.try_grab().is_none(), "pool should be exhausted");

        let p = packets.pop().unwrap();
        pool.free(p);
        assert!(pool.try_grab().is_some(), "freed packet should be reusable");
    }

    #[test]
    fn exhausted_pool_refuses_further_grabs_until_a_release() {
        let pool = Pool::new(1);
        let held = pool.try_grab().unwrap();
        assert!(pool.try_grab().is_none(), "pool is exhausted, grab must fail");
        pool.free(held);
        assert!(pool.try_grab().is_some(), "a release must unblock the next grab");
    }

    /// Model-based check that the number of live packets (pool free +
    /// outstanding) always equals the number of successful grabs minus
    /// frees, and that a grab against an exhausted pool never succeeds.
    #[test]
    fn model_test() {
        use bolero::{check, TypeGenerator};
        use std::collections::VecDeque;

        #[derive(TypeGenerator, Debug)]
        enum Op {
            Grab,
            Free { idx: u8 },
        }

        check!()
            .with_type::<Vec<Op>>()
            .for_each(|ops| {
                let pool = Pool::new(8);
                let mut outstanding: VecDeque<Box<Packet>> = VecDeque::new();
                let mut grabs = 0usize;
                let mut frees = 0usize;

                for op in ops {
                    match op {
                        Op::Grab => {
                            if let Some(packet) = pool.try_grab() {
                                outstanding.push_back(packet);
                                grabs += 1;
                            }
                        }
                        Op::Free { idx } => {
                            if outstanding.is_empty() {
                                continue;
                            }
                            let idx = *idx as usize % outstanding.len();
                            let packet = outstanding.remove(idx).unwrap();
                            pool.free(packet);
                            frees += 1;
                        }
                    }
                }

                assert_eq!(grabs - frees, outstanding.len());
                assert!(outstanding.len() <= pool.capacity());
            });
    }
}
