// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Non-blocking, user-land socket buffering core.
//!
//! [`Core`] owns the three pieces of process-wide mutable state the rest of
//! this crate needs: the packet pool, the descriptor table, and (via
//! [`reactor`]) the external readiness collaborator. Construct one per
//! process (or per test) and drive it through its methods; [`global()`]
//! hands out a lazily-initialized, process-wide instance for callers that
//! just want a single shared handle rather than threading a `Core` through
//! their own state.

pub mod config;
pub mod error;
pub mod hook;
pub mod reactor;

mod flush;
mod handle;
mod packet;
mod pool;
mod record;
mod table;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Error, Kind, Result};
pub use handle::Uuid;
pub use hook::{HookHandle, Hooks, Status};
pub use reactor::Reactor;

use bytes::Bytes;
use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn},
};
use std::{
    io,
    net::{Ipv4Addr, SocketAddrV4},
    os::unix::io::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
    sync::OnceLock,
};

/// The payload half of [`Core::write2`]'s options. `uuid`, `urgent`, and the
/// (memory-only) `length <= BUFFER_PACKET_SIZE` cutoff are separate
/// arguments / derived values rather than fields here, since Rust's enum +
/// slice types already make a dedicated options struct redundant.
pub enum WriteData<'a> {
    /// Copy path: the bytes are copied into a pool packet. Data longer than
    /// [`config::BUFFER_PACKET_SIZE`] takes the "copy-then-move" branch
    /// transparently (an intermediate heap buffer is allocated here).
    Copy(&'a [u8]),
    /// Move path: an already-owned buffer. `Bytes`'s own `Drop` glue frees
    /// it -- construct it with `Bytes::from(vec)`, a custom
    /// `Bytes::from_static`, or an unsafe custom vtable for an arbitrary
    /// caller-supplied deallocator.
    Owned(Bytes),
    /// File path: `source` is reinterpreted as a source fd. `owned` governs
    /// whether `source` is closed exactly once on packet release. `offset`
    /// is validated against the `range` error before it is ever turned into
    /// an owned handle.
    File {
        source: RawFd,
        owned: bool,
        offset: i64,
        length: usize,
    },
}

/// A checked-out inline buffer for the zero-copy write path. Writing
/// directly into [`Checkout::buffer_mut`] and then calling
/// [`Core::buffer_send`] avoids the extra copy [`WriteData::Copy`] performs.
///
/// Dropping a `Checkout` without sending or freeing it explicitly still runs
/// the packet's normal `Drop` glue -- no resource is leaked, the only cost is
/// that the packet doesn't return to the pool.
pub struct Checkout(Option<Box<packet::Packet>>);

impl Checkout {
    /// The packet's full inline capacity, ready to be filled by the caller.
    pub fn buffer_mut(&mut self) -> &mut [u8; config::BUFFER_PACKET_SIZE] {
        self.0
            .as_mut()
            .expect("checkout already consumed")
            .inline_buffer_mut()
    }
}

/// Bundles the packet pool and the descriptor table -- the two pieces of
/// process-wide state owned directly by `Core`. The reactor hooks are a
/// pure external collaborator and live in their own [`OnceLock`] in
/// [`reactor`] instead.
pub struct Core {
    table: table::DescriptorTable,
    pool: pool::Pool,
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

impl Core {
    pub fn new() -> Self {
        Self {
            table: table::DescriptorTable::new(),
            pool: pool::Pool::new(config::BUFFER_PACKET_POOL),
        }
    }

    // -- listen / accept / connect / open ----------------------------------

    /// Non-blocking listening TCP socket, `SO_REUSEADDR`, backlog = system max.
    pub fn listen(&self, addr: &str, port: u16) -> io::Result<Uuid> {
        let ip = parse_ipv4(addr)?;
        let sock = socket::socket(AddressFamily::Inet, SockType::Stream, SockFlag::empty(), None)?;
        socket::setsockopt(&sock, socket::sockopt::ReuseAddr, &true)?;
        set_nonblocking(&sock)?;

        let sockaddr = SockaddrIn::from(SocketAddrV4::new(ip, port));
        socket::bind(&sock, &sockaddr)?;

        let backlog = Backlog::new(libc::SOMAXCONN)
            .unwrap_or_else(|_| Backlog::new(128).expect("128 is a valid backlog"));
        socket::listen(&sock, backlog)?;

        self.open_raw(sock.into_raw_fd())
    }

    /// Non-blocking accepted socket.
    pub fn accept(&self, srv: Uuid) -> io::Result<Uuid> {
        let fd = self.validated_fd(srv)?;
        match socket::accept4(&fd_ref(fd), SockFlag::SOCK_NONBLOCK) {
            Ok(client_fd) => self.open_raw(client_fd.into_raw_fd()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    /// Non-blocking connect; `EINPROGRESS` is success.
    pub fn connect(&self, addr: &str, port: u16) -> io::Result<Uuid> {
        let ip = parse_ipv4(addr)?;
        let sock = socket::socket(AddressFamily::Inet, SockType::Stream, SockFlag::empty(), None)?;
        set_nonblocking(&sock)?;

        let sockaddr = SockaddrIn::from(SocketAddrV4::new(ip, port));
        match socket::connect(&sock, &sockaddr) {
            Ok(()) => {}
            Err(nix::errno::Errno::EINPROGRESS) => {}
            Err(errno) => return Err(io::Error::from(errno)),
        }

        self.open_raw(sock.into_raw_fd())
    }

    /// Adopts a caller-provided fd, reinitializing its record.
    pub fn open(&self, fd: RawFd) -> io::Result<Uuid> {
        self.open_raw(fd)
    }

    fn open_raw(&self, fd: RawFd) -> io::Result<Uuid> {
        self.table.clear(fd, true, &self.pool).map_err(Into::into)
    }

    fn validated_fd(&self, uuid: Uuid) -> io::Result<RawFd> {
        if !self.table.validate(uuid) {
            return Err(Kind::BadDescriptor.err().into());
        }
        Ok(uuid.fd())
    }

    // -- handle queries -----------------------------------------------------

    /// Handle validates and the record is open.
    pub fn isvalid(&self, uuid: Uuid) -> bool {
        self.table.validate(uuid) && self.table.with_record(uuid, |rec| rec.is_open()).unwrap_or(false)
    }

    /// Latest handle for a raw fd, or `None` if not open.
    pub fn fd2uuid(&self, fd: RawFd) -> Option<Uuid> {
        self.table.fd2uuid(fd)
    }

    /// Open and queue non-empty.
    pub fn has_pending(&self, uuid: Uuid) -> bool {
        self.table.with_record(uuid, |rec| rec.has_pending()).unwrap_or(false)
    }

    // -- read -----------------------------------------------------------

    /// Pass-through read via the hook; transient errno maps to `Ok(0)`,
    /// fatal errno force-closes the fd and surfaces the error. A graceful
    /// OS EOF is itself mapped to fatal `ConnectionReset`, so the caller
    /// always observes closure through an error, never a silent `0`.
    pub fn read(&self, uuid: Uuid, buf: &mut [u8]) -> io::Result<usize> {
        let outcome = self.table.with_record(uuid, |rec| rec.hooks.read(uuid, buf));
        match outcome {
            Ok(Status::Progress(0)) => {
                tracing::debug!(fd = uuid.fd(), "peer EOF, force-closing");
                finalize_closed(&self.table, &self.pool, uuid);
                Err(io::Error::from(io::ErrorKind::ConnectionReset))
            }
            Ok(Status::Progress(n)) => Ok(n),
            Ok(Status::WouldBlock) => Ok(0),
            Ok(Status::Fatal(err)) => {
                finalize_closed(&self.table, &self.pool, uuid);
                Err(err)
            }
            Err(bad) => Err(bad.into()),
        }
    }

    // -- write2 / enqueue ----------------------------------------------------

    /// Enqueues a packet, then synchronously invokes `flush`. `urgent`
    /// selects the insertion point (tail, or head unless the current head
    /// has already begun emission).
    pub fn write2(&self, uuid: Uuid, data: WriteData<'_>, urgent: bool) -> io::Result<()> {
        let mut packet = Some(self.build_packet(data)?);

        let enqueued = self.table.with_record(uuid, |rec| {
            if !rec.is_open() {
                return Err(Kind::BadDescriptor.err());
            }
            let packet = packet.take().expect("packet checked out above");
            if urgent {
                rec.enqueue_urgent(uuid, packet);
            } else {
                rec.enqueue_tail(uuid, packet);
            }
            Ok(())
        });

        // Either `with_record` failed fast on a stale/invalid handle, or the
        // closure's own `!rec.is_open()` branch fired -- either way the
        // packet never reached a queue and must go back to the pool instead
        // of leaking.
        if let Some(packet) = packet.take() {
            self.pool.free(packet);
        }

        match enqueued {
            Ok(Ok(())) => self.flush(uuid),
            Ok(Err(err)) => Err(err.into()),
            Err(bad) => Err(bad.into()),
        }
    }

    fn build_packet(&self, data: WriteData<'_>) -> io::Result<Box<packet::Packet>> {
        match data {
            WriteData::Copy(buf) if buf.len() <= config::BUFFER_PACKET_SIZE => {
                let mut packet = self.checkout_packet();
                packet.reinit_inline(buf);
                Ok(packet)
            }
            WriteData::Copy(buf) => {
                // copy-then-move: buf.len() > BUFFER_PACKET_SIZE
                let mut packet = self.checkout_packet();
                packet.reinit_external(Bytes::copy_from_slice(buf));
                Ok(packet)
            }
            WriteData::Owned(bytes) => {
                let mut packet = self.checkout_packet();
                packet.reinit_external(bytes);
                Ok(packet)
            }
            WriteData::File {
                source,
                owned,
                offset,
                length,
            } => {
                if offset < 0 {
                    if owned {
                        // ownership was transferred even on this failure path
                        // (spec.md §4.G): dispose of it exactly once here.
                        drop(unsafe { OwnedFd::from_raw_fd(source) });
                    }
                    return Err(Kind::Range.err().into());
                }
                let mut packet = self.checkout_packet();
                packet.reinit_file(source, owned, offset as u64, length);
                Ok(packet)
            }
        }
    }

    /// Checks out a packet, driving global progress when the pool is
    /// exhausted: grab, and if that fails, flush every fd with pending data
    /// and try again. This loop is the pool's only backpressure mechanism --
    /// a caller enqueueing faster than the pool drains simply blocks here
    /// until something frees a packet, which bounds worst-case memory to the
    /// pool's fixed capacity and keeps the whole system self-clocking under
    /// load instead of growing an unbounded queue of heap allocations.
    fn checkout_packet(&self) -> Box<packet::Packet> {
        loop {
            if let Some(packet) = self.pool.try_grab() {
                tracing::trace!(available = self.pool.available(), "packet grabbed");
                return packet;
            }
            tracing::debug!("pool exhausted, flushing all pending fds before retrying grab");
            flush::flush_all(&self.table, &self.pool);
        }
    }

    /// Checks out a packet's inline buffer for the zero-copy write path.
    pub fn buffer_checkout(&self) -> Checkout {
        Checkout(Some(self.checkout_packet()))
    }

    /// Commits a [`Checkout`]: the first `len` bytes written into
    /// [`Checkout::buffer_mut`] become the packet's payload, then it is
    /// enqueued exactly as [`Core::write2`] would.
    pub fn buffer_send(&self, uuid: Uuid, mut checkout: Checkout, len: usize, urgent: bool) -> io::Result<()> {
        let mut packet = checkout.0.take().expect("checkout already consumed");
        packet.set_inline_length(len);
        let mut packet = Some(packet);

        let enqueued = self.table.with_record(uuid, |rec| {
            if !rec.is_open() {
                return Err(Kind::BadDescriptor.err());
            }
            let packet = packet.take().expect("packet checked out above");
            if urgent {
                rec.enqueue_urgent(uuid, packet);
            } else {
                rec.enqueue_tail(uuid, packet);
            }
            Ok(())
        });

        // Same reclaim as `write2`: a stale handle or a closed record must
        // not strand this packet outside the pool.
        if let Some(packet) = packet.take() {
            self.pool.free(packet);
        }

        match enqueued {
            Ok(Ok(())) => self.flush(uuid),
            Ok(Err(err)) => Err(err.into()),
            Err(bad) => Err(bad.into()),
        }
    }

    /// Releases a [`Checkout`] back to the pool without sending it.
    pub fn buffer_free(&self, mut checkout: Checkout) {
        if let Some(packet) = checkout.0.take() {
            self.pool.free(packet);
        }
    }

    // -- flush family --------------------------------------------------------

    pub fn flush(&self, uuid: Uuid) -> io::Result<()> {
        flush::flush(&self.table, &self.pool, uuid)
    }

    /// Busy-loops `flush` until the queue fully drains and stays idle, or
    /// the fd closes. See `flush::flush_strong`'s doc comment for the
    /// termination conditions in detail.
    pub fn flush_strong(&self, uuid: Uuid) -> io::Result<()> {
        flush::flush_strong(&self.table, &self.pool, uuid)
    }

    pub fn flush_all(&self) {
        flush::flush_all(&self.table, &self.pool)
    }

    // -- close / force_close --------------------------------------------------

    /// Marks the record draining and calls `flush`. `flush` itself finishes
    /// the DRAINING -> CLOSED teardown (spec.md §9 open question #2) the
    /// moment the queue goes empty, whether that happens during this call or
    /// during some later, independent `flush`/`flush_all` once more data has
    /// drained -- see `flush::flush_probe`.
    pub fn close(&self, uuid: Uuid) -> io::Result<()> {
        let marked = self.table.with_record(uuid, |rec| {
            if rec.is_open() {
                rec.state = record::State::Draining;
                Ok(())
            } else {
                Err(Kind::BadDescriptor.err())
            }
        });
        match marked {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(bad) => return Err(bad.into()),
        }

        self.flush(uuid)
    }

    /// `shutdown(RDWR)`, close raw fd, clear record.
    ///
    /// Operates on the raw fd named by `uuid`; like the original, this
    /// crate cannot protect against two independent `force_close` calls
    /// racing after the OS has already reused the fd for an unrelated
    /// connection. Callers are expected to serialize teardown per handle.
    pub fn force_close(&self, uuid: Uuid) -> io::Result<()> {
        if !self.table.validate(uuid) {
            return Err(Kind::BadDescriptor.err().into());
        }
        finalize_closed(&self.table, &self.pool, uuid);
        Ok(())
    }

    // -- hooks --------------------------------------------------------------

    pub fn hook_get(&self, uuid: Uuid) -> io::Result<HookHandle> {
        self.table.hook_get(uuid).map_err(Into::into)
    }

    pub fn hook_set(&self, uuid: Uuid, hooks: HookHandle) -> io::Result<HookHandle> {
        self.table.hook_set(uuid, hooks).map_err(Into::into)
    }

    /// Diagnostic accessor mirroring the original's `sock_max_capacity`.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Number of packets currently idle in the pool's free list.
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    /// Resets the idle timer an external timeout manager may be keeping for
    /// `uuid`, by forwarding to the registered [`reactor::Reactor`]. A
    /// no-op if nothing is registered. Mirrors the original's weakly-linked
    /// `sock_touch`; the core never times out a connection on its own.
    pub fn touch(&self, uuid: Uuid) -> io::Result<()> {
        if !self.table.validate(uuid) {
            return Err(Kind::BadDescriptor.err().into());
        }
        reactor::get().touch(uuid);
        Ok(())
    }

    /// The local address a listening or connected socket is bound to.
    /// Mainly useful for discovering the ephemeral port after `listen`ing on
    /// port 0 -- the demo/self-test program this crate's core deliberately
    /// excludes would need exactly this to report where it's listening.
    pub fn local_addr(&self, uuid: Uuid) -> io::Result<SocketAddrV4> {
        let fd = self.validated_fd(uuid)?;
        let sockaddr: SockaddrIn = socket::getsockname(&fd_ref(fd))?;
        Ok(SocketAddrV4::new(sockaddr.ip(), sockaddr.port()))
    }
}

/// The real teardown behind every close path: best-effort detach from the
/// reactor's readiness source, `shutdown(RDWR)` and raw-close the fd, clear
/// the table slot (bumping its generation so the handle invalidates), and
/// notify the reactor. Shared by `Core::force_close` and by `flush::flush`'s
/// own DRAINING -> CLOSED completion, so a connection closed by draining its
/// queue gets exactly the same teardown as one closed explicitly.
pub(crate) fn finalize_closed(table: &table::DescriptorTable, pool: &pool::Pool, uuid: Uuid) {
    let _ = reactor::get().remove(uuid);
    let fd = uuid.fd();
    let _ = socket::shutdown(&fd_ref(fd), socket::Shutdown::Both);
    // raw fd close, not nix::unistd::close: the table's bookkeeping treats
    // `fd` as a bare integer it owns outright, not an `OwnedFd` value.
    unsafe {
        libc::close(fd);
    }
    if table.clear(fd, false, pool).is_ok() {
        tracing::debug!(fd, "record torn down");
        reactor::get().on_close(uuid);
    }
}

/// Borrows a raw fd held in the descriptor table for the duration of one nix
/// socket call, which (since nix's I/O-safety-oriented socket API) wants an
/// `AsFd` rather than a bare `RawFd`. The table, not this borrow, is what
/// actually owns the descriptor's lifetime.
#[inline]
fn fd_ref(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

fn parse_ipv4(addr: &str) -> io::Result<Ipv4Addr> {
    addr.parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "expected a dotted-quad IPv4 address"))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// The process-wide instance backing the free-function-shaped API this
/// crate's spec is modeled on (spec.md §9 "Global mutable state": "a single
/// initialized-on-first-use module-level value").
static GLOBAL: OnceLock<Core> = OnceLock::new();

pub fn global() -> &'static Core {
    GLOBAL.get_or_init(Core::new)
}
