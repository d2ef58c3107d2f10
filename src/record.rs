// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-fd record and its state machine.
//!
//! The packet queue is a [`VecDeque`] rather than a linked list: it gives
//! the same O(1) push-front/push-back, and `insert` at a fixed small index
//! (for urgent insertion behind a half-sent head) is O(min(index, len -
//! index)), which is effectively O(1) here since the index is always 0 or 1.

use crate::{handle::Uuid, hook::HookHandle, packet::Packet};
use std::collections::VecDeque;

/// State machine position of a descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum State {
    Open,
    Draining,
    Closed,
}

pub(crate) struct FdRec {
    pub(crate) state: State,
    /// Bytes already emitted from the head packet. Invariant: `sent <=
    /// queue.front().length()` whenever the fd lock is not held.
    pub(crate) sent: usize,
    pub(crate) queue: VecDeque<Box<Packet>>,
    pub(crate) hooks: HookHandle,
}

impl FdRec {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Closed,
            sent: 0,
            queue: VecDeque::new(),
            hooks: crate::hook::default_hook(),
        }
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        matches!(self.state, State::Open | State::Draining)
    }

    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        self.is_open() && !self.queue.is_empty()
    }

    /// Reinitializes the record for reuse: drops the entire queue (running
    /// each packet's `Drop` glue, which is the release step), resets the
    /// flags, and installs the default hooks. Returns the drained packets
    /// and the *outgoing* hook handle -- the caller (which owns the
    /// generation counter) is responsible for calling `hooks.on_clear` with
    /// it after bumping the generation, so a transport never observes
    /// teardown before the handle it was attached to actually invalidates.
    pub(crate) fn clear(&mut self, open: bool) -> (Vec<Box<Packet>>, HookHandle) {
        let drained: Vec<Box<Packet>> = self.queue.drain(..).collect();
        self.sent = 0;
        self.state = if open { State::Open } else { State::Closed };
        let outgoing = std::mem::replace(&mut self.hooks, crate::hook::default_hook());
        (drained, outgoing)
    }

    /// Appends at the tail (the default, non-urgent ordering).
    #[inline]
    pub(crate) fn enqueue_tail(&mut self, uuid: Uuid, packet: Box<Packet>) {
        tracing::trace!(fd = uuid.fd(), len = packet.length(), "enqueue tail");
        self.queue.push_back(packet);
    }

    /// Urgent insertion: insert at head, except when the current head has
    /// already begun emission (`sent > 0`), in which case insert immediately
    /// after it so a half-sent packet is never split.
    #[inline]
    pub(crate) fn enqueue_urgent(&mut self, uuid: Uuid, packet: Box<Packet>) {
        let position = if self.sent > 0 { 1 } else { 0 };
        tracing::trace!(fd = uuid.fd(), len = packet.length(), position, "enqueue urgent");
        self.queue.insert(position, packet);
    }

    /// Rotates the queue after the head packet completes: pops the head and
    /// resets `sent` for the new head.
    #[inline]
    pub(crate) fn rotate(&mut self) -> Option<Box<Packet>> {
        let completed = self.queue.pop_front();
        self.sent = 0;
        completed
    }
}
