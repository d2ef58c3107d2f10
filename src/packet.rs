// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The packet variants and their write strategies.
//!
//! The three payload shapes (inline memory, external memory, file-backed)
//! are modeled as an enum dispatched via `match` rather than a trait
//! object, since the set of variants is closed and known up front. There's
//! no separate "release" step to manage by hand: dropping a [`Payload`]
//! runs Rust's ordinary `Drop` glue, and an owned [`bytes::Bytes`] is
//! itself "external memory with a caller-supplied deallocator" -- its
//! vtable already is the release callback.

use crate::{
    config::{BUFFER_FILE_READ_SIZE, BUFFER_PACKET_SIZE},
    handle::Uuid,
    hook::{Hooks, Status},
};
use bytes::Bytes;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// How a file-backed packet's source fd is owned.
#[derive(Debug)]
enum FileOwnership {
    /// The packet owns the fd and closes it exactly once on release,
    /// whether via normal completion, `clear`, or `force_close`.
    Owned(OwnedFd),
    /// The caller retains ownership; the packet only ever reads from it.
    Borrowed(RawFd),
}

impl FileOwnership {
    #[inline]
    fn raw(&self) -> RawFd {
        match self {
            FileOwnership::Owned(fd) => std::os::unix::io::AsRawFd::as_raw_fd(fd),
            FileOwnership::Borrowed(fd) => *fd,
        }
    }
}

/// The payload of one queued packet.
#[derive(Debug)]
pub(crate) enum Payload {
    /// Payload copied into a small inline buffer -- used whenever the
    /// caller didn't ask to move ownership and the data fits under
    /// [`BUFFER_PACKET_SIZE`]. Only the outer [`Packet::length`] bytes of
    /// the buffer are meaningful; the rest is leftover from a prior use.
    /// A boxed fixed array (rather than an `ArrayVec`) is what lets
    /// `buffer_checkout`/`buffer_send` hand callers a full-capacity `&mut`
    /// slice to fill before the logical length is known.
    Inline(Box<[u8; BUFFER_PACKET_SIZE]>),
    /// Payload is an owned, possibly zero-copy buffer: the move path, the
    /// copy-then-move overflow path, and the caller-supplied-deallocator
    /// path all end up here, since `Bytes`'s own vtable is the
    /// deallocator.
    External(Bytes),
    /// Payload is read on demand from a source fd, starting at `offset`.
    File {
        source: FileOwnership,
        offset: u64,
        scratch: Box<[u8; BUFFER_FILE_READ_SIZE]>,
        /// bytes currently sitting in `scratch`, not yet written out
        scratch_len: usize,
        scratch_pos: usize,
    },
}

/// One queued unit of outbound data.
///
/// `length` is the logical number of bytes still to emit *from this
/// packet's perspective at enqueue time*; the actual "how many of those
/// have gone out" cursor lives on the owning record (`sent`), since only
/// the head of the queue is ever partially emitted.
#[derive(Debug)]
pub(crate) struct Packet {
    payload: Payload,
    length: usize,
}

/// Result of driving one packet's write strategy for one flush step.
#[allow(clippy::large_enum_variant)]
pub(crate) enum WriteResult {
    /// The packet produced `n` more bytes of progress but isn't complete.
    Progress(usize),
    /// The packet is fully emitted; rotate the queue.
    Complete,
    WouldBlock,
    Fatal(std::io::Error),
}

impl Packet {
    #[inline]
    pub(crate) fn inline(data: &[u8]) -> Self {
        let mut packet = Self {
            length: 0,
            payload: Payload::Inline(Box::new([0u8; BUFFER_PACKET_SIZE])),
        };
        packet.reinit_inline(data);
        packet
    }

    #[inline]
    pub(crate) fn external(data: Bytes) -> Self {
        let mut packet = Self {
            length: 0,
            payload: Payload::Inline(Box::new([0u8; BUFFER_PACKET_SIZE])),
        };
        packet.reinit_external(data);
        packet
    }

    #[inline]
    pub(crate) fn file(source: RawFd, owned: bool, offset: u64, length: usize) -> Self {
        let mut packet = Self {
            length: 0,
            payload: Payload::Inline(Box::new([0u8; BUFFER_PACKET_SIZE])),
        };
        packet.reinit_file(source, owned, offset, length);
        packet
    }

    #[inline]
    pub(crate) fn length(&self) -> usize {
        self.length
    }

    /// Refills an already-reset packet (typically one just grabbed from the
    /// pool) with an inline payload, reusing its boxed buffer when it is
    /// already the `Inline` variant.
    #[inline]
    pub(crate) fn reinit_inline(&mut self, data: &[u8]) {
        assert!(
            data.len() <= BUFFER_PACKET_SIZE,
            "caller guarantees data.len() <= BUFFER_PACKET_SIZE"
        );
        if !matches!(self.payload, Payload::Inline(_)) {
            self.payload = Payload::Inline(Box::new([0u8; BUFFER_PACKET_SIZE]));
        }
        if let Payload::Inline(buf) = &mut self.payload {
            buf[..data.len()].copy_from_slice(data);
        }
        self.length = data.len();
    }

    /// The packet's full inline capacity, ready to be filled by a
    /// zero-copy caller. Panics if this packet is not currently the
    /// `Inline` variant -- callers only reach this through
    /// `Core::buffer_checkout`, which guarantees it.
    #[inline]
    pub(crate) fn inline_buffer_mut(&mut self) -> &mut [u8; BUFFER_PACKET_SIZE] {
        match &mut self.payload {
            Payload::Inline(buf) => buf.as_mut(),
            _ => unreachable!("checkout packets are always inline"),
        }
    }

    /// Commits the logical length of a buffer filled via
    /// `inline_buffer_mut`.
    #[inline]
    pub(crate) fn set_inline_length(&mut self, len: usize) {
        debug_assert!(matches!(self.payload, Payload::Inline(_)));
        debug_assert!(len <= BUFFER_PACKET_SIZE);
        self.length = len;
    }

    /// Refills an already-reset packet with an owned external payload.
    #[inline]
    pub(crate) fn reinit_external(&mut self, data: Bytes) {
        self.length = data.len();
        self.payload = Payload::External(data);
    }

    /// Refills an already-reset packet with a file-backed payload.
    #[inline]
    pub(crate) fn reinit_file(&mut self, source: RawFd, owned: bool, offset: u64, length: usize) {
        let source = if owned {
            // SAFETY: caller transfers ownership of `source` to us.
            FileOwnership::Owned(unsafe { OwnedFd::from_raw_fd(source) })
        } else {
            FileOwnership::Borrowed(source)
        };
        self.length = length;
        self.payload = Payload::File {
            source,
            offset,
            scratch: Box::new([0u8; BUFFER_FILE_READ_SIZE]),
            scratch_len: 0,
            scratch_pos: 0,
        };
    }

    /// Reinitializes this packet to an empty, reusable state. Dropping the
    /// old payload is the release step -- `Bytes`, `OwnedFd`, and the boxed
    /// scratch buffer all release themselves. Keeps the existing inline
    /// buffer allocation when there already is one, so pool recycling
    /// doesn't reallocate on every round trip.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.length = 0;
        if !matches!(self.payload, Payload::Inline(_)) {
            self.payload = Payload::Inline(Box::new([0u8; BUFFER_PACKET_SIZE]));
        }
    }

    /// Drives this packet's write strategy for a single step, using `sent`
    /// bytes already emitted from a previous step.
    pub(crate) fn write_step(&mut self, uuid: Uuid, hooks: &dyn Hooks, sent: usize) -> WriteResult {
        debug_assert!(sent <= self.length);
        if sent >= self.length {
            return WriteResult::Complete;
        }

        match &mut self.payload {
            Payload::Inline(buf) => write_buf(uuid, hooks, &buf[sent..self.length]),
            Payload::External(bytes) => write_buf(uuid, hooks, &bytes[sent..self.length]),
            Payload::File {
                source,
                offset,
                scratch,
                scratch_len,
                scratch_pos,
            } => file_write_step(
                uuid,
                hooks,
                source.raw(),
                *offset,
                sent,
                self.length,
                scratch,
                scratch_len,
                scratch_pos,
            ),
        }
    }
}

#[inline]
fn write_buf(uuid: Uuid, hooks: &dyn Hooks, remaining: &[u8]) -> WriteResult {
    match hooks.write(uuid, remaining) {
        Status::Progress(0) => WriteResult::WouldBlock,
        Status::Progress(n) => WriteResult::Progress(n),
        Status::WouldBlock => WriteResult::WouldBlock,
        Status::Fatal(err) => WriteResult::Fatal(err),
    }
}

/// The portable read-then-write loop for file-backed packets. One call
/// performs at most one `pread` refill (if the scratch buffer is empty)
/// followed by one `write`, so that the flush engine's "drive while `> 0`"
/// loop naturally paces this across many calls instead of blocking here
/// until the whole file is sent.
#[allow(clippy::too_many_arguments)]
fn file_write_step(
    uuid: Uuid,
    hooks: &dyn Hooks,
    source_fd: RawFd,
    offset: u64,
    sent: usize,
    length: usize,
    scratch: &mut [u8; BUFFER_FILE_READ_SIZE],
    scratch_len: &mut usize,
    scratch_pos: &mut usize,
) -> WriteResult {
    if *scratch_pos == *scratch_len {
        // scratch is empty (or was fully flushed): refill it.
        let remaining_logical = length - sent;
        let want = remaining_logical.min(scratch.len());
        if want == 0 {
            return WriteResult::Complete;
        }
        let read_offset = (offset + sent as u64) as libc::off_t;
        match nix::sys::uio::pread(&unsafe { borrow_fd(source_fd) }, &mut scratch[..want], read_offset) {
            Ok(0) => {
                // short file: EOF before `length` bytes were available.
                return WriteResult::Complete;
            }
            Ok(n) => {
                *scratch_len = n;
                *scratch_pos = 0;
            }
            Err(nix::errno::Errno::EINTR) => return WriteResult::Progress(0),
            Err(nix::errno::Errno::EAGAIN) => return WriteResult::WouldBlock,
            Err(errno) => return WriteResult::Fatal(std::io::Error::from(errno)),
        }
    }

    match hooks.write(uuid, &scratch[*scratch_pos..*scratch_len]) {
        Status::Progress(0) => WriteResult::WouldBlock,
        Status::Progress(n) => {
            *scratch_pos += n;
            WriteResult::Progress(n)
        }
        Status::WouldBlock => WriteResult::WouldBlock,
        Status::Fatal(err) => WriteResult::Fatal(err),
    }
}

/// Borrows a raw fd for the duration of one `pread` call without taking
/// ownership -- `nix::sys::uio::pread` wants a `&impl AsFd`.
///
/// # Safety
/// The caller must guarantee `fd` stays open and valid for the borrow's
/// lifetime, which holds here: it is either owned by this packet (kept
/// alive by `self`) or borrowed from a caller who promised not to close it
/// mid-flight.
#[inline]
unsafe fn borrow_fd<'a>(fd: RawFd) -> std::os::unix::io::BorrowedFd<'a> {
    std::os::unix::io::BorrowedFd::borrow_raw(fd)
}


impl std::fmt::Debug for WriteResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteResult::Progress(n) => write!(f, "Progress({n})"),
            WriteResult::Complete => write!(f, "Complete"),
            WriteResult::WouldBlock => write!(f, "WouldBlock"),
            WriteResult::Fatal(e) => write!(f, "Fatal({e})"),
        }
    }
}
