// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The descriptor table: a growable index from raw fd to per-fd record.
//!
//! A slot array behind a `parking_lot::RwLock` lets reads (the common case:
//! looking up an existing fd) proceed without contending with the rare
//! capacity-growth write, while each slot's own `parking_lot::Mutex` keeps
//! per-fd critical sections short and independent of each other. The per-fd
//! `generation` is kept as a free-standing `AtomicU8` next to the lock, not
//! inside it, so a cheap pre-check can read it without taking the lock at
//! all, at the cost of having to re-validate once the lock is held.

use crate::{error::Kind, handle::Uuid, hook::HookHandle, pool::Pool, record::FdRec};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::{
    os::unix::io::RawFd,
    sync::atomic::{AtomicU8, Ordering},
};

pub(crate) struct Slot {
    generation: AtomicU8,
    rec: Mutex<FdRec>,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: AtomicU8::new(0),
            rec: Mutex::new(FdRec::new()),
        }
    }

    #[inline]
    pub(crate) fn generation(&self) -> u8 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, FdRec> {
        self.rec.lock()
    }
}

/// A minimal default fallback when `getrlimit` isn't available or fails;
/// doubled from there as needed.
const INITIAL_CAPACITY_FALLBACK: usize = 1024;

pub(crate) struct DescriptorTable {
    slots: RwLock<Vec<std::sync::Arc<Slot>>>,
}

impl DescriptorTable {
    pub(crate) fn new() -> Self {
        raise_fd_limit();
        Self::with_test_capacity(initial_capacity())
    }

    /// Builds a table with an explicit initial capacity, bypassing the
    /// `getrlimit`-derived sizing in [`DescriptorTable::new`]. Used by
    /// tests so behavior doesn't depend on the sandbox's fd ulimit.
    pub(crate) fn with_test_capacity(initial: usize) -> Self {
        let mut slots = Vec::with_capacity(initial);
        slots.resize_with(initial, || std::sync::Arc::new(Slot::new()));
        Self {
            slots: RwLock::new(slots),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    #[inline]
    fn get(&self, fd: RawFd) -> Option<std::sync::Arc<Slot>> {
        if fd < 0 {
            return None;
        }
        self.slots.read().get(fd as usize).cloned()
    }

    /// Doubles capacity until `fd` is in range.
    fn ensure_capacity(&self, fd: RawFd) -> crate::error::Result<std::sync::Arc<Slot>> {
        if fd < 0 {
            return Err(Kind::BadDescriptor.err());
        }
        let fd = fd as usize;

        if let Some(slot) = self.get(fd as RawFd) {
            return Ok(slot);
        }

        let mut slots = self.slots.write();
        let mut target = slots.len().max(1);
        while target <= fd {
            target = target
                .checked_mul(2)
                .ok_or_else(|| Kind::CapacityExhausted.err())?;
        }
        slots.resize_with(target, || std::sync::Arc::new(Slot::new()));
        Ok(slots[fd].clone())
    }

    /// Reinitializes the record at `fd`: bumps the generation, drains the
    /// queue, invokes the outgoing hook's `on_clear`, and reinstalls the
    /// default hook. Any packets still queued when this happens (e.g. a
    /// `force_close` mid-flight) are handed back to `pool` rather than
    /// simply dropped, so forcibly tearing down a connection with pending
    /// writes doesn't permanently shrink the pool.
    pub(crate) fn clear(&self, fd: RawFd, open: bool, pool: &Pool) -> crate::error::Result<Uuid> {
        let slot = self.ensure_capacity(fd)?;
        let (drained, outgoing_hooks, generation) = {
            let mut rec = slot.lock();
            let (drained, outgoing) = rec.clear(open);
            // bump generation while still holding the lock, so a
            // concurrent racy pre-check that then takes the lock always
            // observes a consistent pairing of (generation, record state).
            let generation = slot.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            (drained, outgoing, generation)
        };

        for packet in drained {
            pool.free(packet);
        }

        let uuid = Uuid::new(fd, generation);
        outgoing_hooks.on_clear(uuid);
        Ok(uuid)
    }

    /// Validates a handle: `ok` if its fd is in range and its generation
    /// matches the record's current generation. This is a fast, racy
    /// pre-check; callers that then act on the record must re-validate
    /// after acquiring its lock (see `with_record`).
    #[inline]
    pub(crate) fn validate(&self, uuid: Uuid) -> bool {
        match self.get(uuid.fd()) {
            Some(slot) => slot.generation() == uuid.generation(),
            None => false,
        }
    }

    /// Looks up the latest handle for a raw fd, if it is currently open.
    pub(crate) fn fd2uuid(&self, fd: RawFd) -> Option<Uuid> {
        let slot = self.get(fd)?;
        let generation = slot.generation();
        if slot.lock().is_open() {
            Some(Uuid::new(fd, generation))
        } else {
            None
        }
    }

    /// Runs `f` with the locked record for `uuid`, re-validating the
    /// generation under the lock first. Returns `BadDescriptor` without
    /// calling `f` if the handle doesn't (or no longer) validates.
    pub(crate) fn with_record<T>(
        &self,
        uuid: Uuid,
        f: impl FnOnce(&mut FdRec) -> T,
    ) -> crate::error::Result<T> {
        let slot = self.get(uuid.fd()).ok_or_else(|| Kind::BadDescriptor.err())?;
        if slot.generation() != uuid.generation() {
            return Err(Kind::BadDescriptor.err());
        }
        let mut rec = slot.lock();
        if slot.generation() != uuid.generation() {
            return Err(Kind::BadDescriptor.err());
        }
        Ok(f(&mut rec))
    }

    /// Installs a new hook for `uuid`, returning the previous one.
    pub(crate) fn hook_set(&self, uuid: Uuid, hooks: HookHandle) -> crate::error::Result<HookHandle> {
        self.with_record(uuid, |rec| std::mem::replace(&mut rec.hooks, hooks))
    }

    pub(crate) fn hook_get(&self, uuid: Uuid) -> crate::error::Result<HookHandle> {
        self.with_record(uuid, |rec| rec.hooks.clone())
    }

    /// Iterates every slot currently holding an open fd with pending data.
    /// Used by `flush_all`; does not hold any lock across the callback.
    pub(crate) fn for_each_pending(&self, mut f: impl FnMut(Uuid)) {
        let snapshot: Vec<(RawFd, std::sync::Arc<Slot>)> = self
            .slots
            .read()
            .iter()
            .enumerate()
            .map(|(fd, slot)| (fd as RawFd, slot.clone()))
            .collect();

        for (fd, slot) in snapshot {
            let generation = slot.generation();
            let has_pending = slot.lock().has_pending();
            if has_pending {
                f(Uuid::new(fd, generation));
            }
        }
    }
}

fn initial_capacity() -> usize {
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) if soft > 0 => (soft as usize).min(1 << 20),
        _ => INITIAL_CAPACITY_FALLBACK,
    }
}

/// Raises the process's soft `RLIMIT_NOFILE` to the hard limit on first use,
/// so a long-running process isn't capped by whatever default limit its
/// shell happened to inherit.
fn raise_fd_limit() {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    if let Ok((soft, hard)) = getrlimit(Resource::RLIMIT_NOFILE) {
        if hard > soft {
            if let Err(err) = setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
                tracing::debug!(?err, "failed to raise RLIMIT_NOFILE");
            }
        }
    }
}
