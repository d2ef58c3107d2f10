// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pluggable per-connection read/write/flush/on_clear vtable.
//!
//! A `'static + Send + Sync` trait object so a transport (plain TCP, TLS,
//! a test double) can be swapped in behind a trait object. It's
//! synchronous, not `Context`/`Poll`-based: this core never blocks on I/O
//! and has no async tasks of its own, so readiness is always driven by
//! whatever owns the event loop.

use crate::handle::Uuid;
use std::{io, os::unix::io::RawFd, sync::Arc};

/// Outcome of a single read/write/flush attempt.
#[derive(Debug)]
pub enum Status {
    /// Bytes were transferred (read) or emitted (write); `flush` uses this
    /// to mean "call me again".
    Progress(usize),
    /// Transient: would block, was interrupted, or the socket isn't
    /// connected yet. The caller stops draining this fd for this cycle.
    WouldBlock,
    /// Fatal: the caller must force-close the fd.
    Fatal(io::Error),
}

impl Status {
    /// Classifies a raw `io::Result` by errno: `EAGAIN`/`EWOULDBLOCK`/
    /// `EINTR`/`ENOTCONN` are transient, everything else is fatal.
    #[inline]
    pub fn from_io_result(result: io::Result<usize>) -> Self {
        match result {
            Ok(n) => Status::Progress(n),
            Err(err) if is_transient(&err) => Status::WouldBlock,
            Err(err) => Status::Fatal(err),
        }
    }
}

#[inline]
pub(crate) fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(err.kind(), WouldBlock | Interrupted | NotConnected)
        || err.raw_os_error() == Some(libc::ENOTCONN)
}

/// Per-connection read/write/flush/on_clear plug points.
///
/// Implementations must not re-enter the core's API for the same fd from
/// within `read`/`write`/`flush` -- the fd's lock is held across those
/// calls, so doing so would deadlock.
pub trait Hooks: Send + Sync + 'static {
    /// Pass-through read, same contract as the OS `read(2)`.
    fn read(&self, uuid: Uuid, buf: &mut [u8]) -> Status;

    /// Pass-through write, same contract as the OS `write(2)`.
    fn write(&self, uuid: Uuid, buf: &[u8]) -> Status;

    /// Drains any transport-internal buffer (e.g. TLS). Returns
    /// `Progress(_)` if it wants to be called again, `Progress(0)` when
    /// internally drained, `Fatal`/`WouldBlock` otherwise.
    #[inline]
    fn flush(&self, uuid: Uuid) -> Status {
        let _ = uuid;
        Status::Progress(0)
    }

    /// Called after the record has been torn down; the transport owns its
    /// own cleanup (e.g. releasing a TLS session).
    #[inline]
    fn on_clear(&self, uuid: Uuid) {
        let _ = uuid;
    }
}

/// The default hook: reads and writes go straight to the raw OS fd, flush
/// is a no-op, `on_clear` does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl Hooks for DefaultHooks {
    #[inline]
    fn read(&self, uuid: Uuid, buf: &mut [u8]) -> Status {
        let status = Status::from_io_result(raw_read(uuid.fd(), buf));
        if let Status::Fatal(err) = &status {
            tracing::warn!(fd = uuid.fd(), %err, "fatal read, fd will be force-closed");
        }
        status
    }

    #[inline]
    fn write(&self, uuid: Uuid, buf: &[u8]) -> Status {
        let status = Status::from_io_result(raw_write(uuid.fd(), buf));
        if let Status::Fatal(err) = &status {
            tracing::warn!(fd = uuid.fd(), %err, "fatal write, fd will be force-closed");
        }
        status
    }
}

#[inline]
pub(crate) fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    libc_call(|| unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) as isize })
}

#[inline]
pub(crate) fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    libc_call(|| unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) as isize })
}

#[inline]
pub(crate) fn libc_call(call: impl FnOnce() -> isize) -> io::Result<usize> {
    let res = call();
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// The active hook pointer for a record. Reference-counted so `hook_get`
/// can hand callers a cheap clone and `clear` can atomically swap in the
/// default without racing a concurrent reader.
pub type HookHandle = Arc<dyn Hooks>;

#[inline]
pub(crate) fn default_hook() -> HookHandle {
    Arc::new(DefaultHooks)
}

/// Fills an absent hook with the default before installing. A boxed trait
/// object has no null state, so "unset" is normally just "caller never
/// called `hook_set`"; this exists for callers that want to override only
/// part of the vtable by wrapping [`DefaultHooks`] for the rest.
#[inline]
pub fn install(hooks: Option<HookHandle>) -> HookHandle {
    hooks.unwrap_or_else(default_hook)
}
