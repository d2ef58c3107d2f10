// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The flush engine: drains a record's packet queue through its hooks,
//! handling partial writes and translating transient/fatal errors.

use crate::{
    error::Kind,
    handle::Uuid,
    hook::Status,
    packet::WriteResult,
    pool::Pool,
    record::{FdRec, State},
    table::DescriptorTable,
};
use std::io;

/// Drives `uuid`'s queue through its hooks until the queue is empty, a
/// hook/packet reports it would block, or a fatal error force-closes the
/// fd.
pub(crate) fn flush(table: &DescriptorTable, pool: &Pool, uuid: Uuid) -> io::Result<()> {
    flush_probe(table, pool, uuid).map(|_| ())
}

/// Same as [`flush`], but also reports whether there was anything queued to
/// drive: `Ok(true)` if the queue was non-empty on entry (regardless of how
/// far this call got before stalling), `Ok(false)` if it was already empty
/// or the record wasn't open. An invalid handle is still a hard error here,
/// same as every other operation on a bad descriptor.
fn flush_probe(table: &DescriptorTable, pool: &Pool, uuid: Uuid) -> io::Result<bool> {
    let outcome = table.with_record(uuid, |rec| flush_locked(rec, pool, uuid));

    match outcome {
        Ok(Ok((drove_queue, just_closed))) => {
            // `finalize_closed` re-locks this same fd slot (via
            // `table.clear`), so it must run after `with_record` above has
            // released the lock, not from inside `flush_locked`.
            if just_closed {
                crate::finalize_closed(table, pool, uuid);
            }
            Ok(drove_queue)
        }
        Ok(Err(err)) => {
            tracing::warn!(fd = uuid.fd(), %err, "fatal write, force-closing");
            crate::finalize_closed(table, pool, uuid);
            Err(err)
        }
        Err(_bad_descriptor) => Err(Kind::BadDescriptor.err().into()),
    }
}

/// The locked portion of one `flush` call. Returns `(drove_queue,
/// just_closed)`: `drove_queue` is `true` if the queue had anything to
/// drive, `just_closed` is `true` if this call just finished a DRAINING ->
/// CLOSED transition (and so the caller must run the real teardown).
/// `Err(fatal)` when the fd must be force-closed by the caller instead.
fn flush_locked(rec: &mut FdRec, pool: &Pool, uuid: Uuid) -> io::Result<(bool, bool)> {
    if !rec.is_open() {
        return Ok((false, false));
    }
    if rec.queue.is_empty() {
        // Nothing to drive now, but a `close()` call may be waiting on
        // exactly this emptiness to finish its DRAINING -> CLOSED
        // transition (spec.md §9 open question #2) -- most likely because
        // the queue was already empty when `close` was called, so this is
        // the only chance `flush` gets to notice.
        return Ok((false, maybe_complete_drain(rec)));
    }

    // Drive the transport's internal buffer (e.g. TLS record layer) while it
    // reports progress.
    loop {
        match rec.hooks.flush(uuid) {
            Status::Progress(n) if n > 0 => {
                tracing::trace!(fd = uuid.fd(), n, "hook flush progress");
                continue;
            }
            Status::Progress(_) => break,
            Status::WouldBlock => return Ok((true, false)),
            Status::Fatal(err) => return Err(err),
        }
    }

    // Drive the queue head's write strategy while it reports progress,
    // rotating completed packets back to the pool.
    while let Some(head) = rec.queue.front_mut() {
        match head.write_step(uuid, rec.hooks.as_ref(), rec.sent) {
            WriteResult::Progress(n) => {
                rec.sent += n;
                debug_assert!(rec.sent <= head.length());
                tracing::trace!(fd = uuid.fd(), n, sent = rec.sent, "write step progress");
            }
            WriteResult::Complete => {
                tracing::trace!(fd = uuid.fd(), "packet complete, freeing to pool");
                if let Some(completed) = rec.rotate() {
                    pool.free(completed);
                }
            }
            WriteResult::WouldBlock => return Ok((true, false)),
            WriteResult::Fatal(err) => return Err(err),
        }
    }

    Ok((true, maybe_complete_drain(rec)))
}

/// Finishes the DRAINING -> CLOSED transition in-memory: if the queue has
/// just gone empty while draining, flips the record to `Closed` and reports
/// that the caller must now run the real teardown (`crate::finalize_closed`)
/// once this slot's lock is released -- the generation bump, raw fd close,
/// and reactor notification can't happen while still holding it.
fn maybe_complete_drain(rec: &mut FdRec) -> bool {
    if rec.state == State::Draining && rec.queue.is_empty() {
        rec.state = State::Closed;
        true
    } else {
        false
    }
}

/// Busy-loops `flush` until there's nothing left to do: either the queue
/// drains and stays empty, or the fd closes (a fatal write force-closed it,
/// or the handle was already invalid). Exactly one of those always happens
/// within a finite number of iterations as long as the peer keeps making
/// progress; if the peer never becomes writable again this call never
/// returns, which is why it's named `_strong` and most callers should
/// prefer a single `flush` driven by their own readiness loop instead.
pub(crate) fn flush_strong(table: &DescriptorTable, pool: &Pool, uuid: Uuid) -> io::Result<()> {
    loop {
        match flush_probe(table, pool, uuid) {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(_) => return Ok(()),
        }
    }
}

/// Iterates every fd with an open, non-empty queue and flushes it.
pub(crate) fn flush_all(table: &DescriptorTable, pool: &Pool) {
    let mut pending = Vec::new();
    table.for_each_pending(|uuid| pending.push(uuid));
    for uuid in pending {
        let _ = flush(table, pool, uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::Hooks;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// A hook that records every byte slice handed to `write`, always
    /// reporting full progress -- used to assert emission order/content
    /// without a real socket.
    #[derive(Default)]
    struct RecordingHooks {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Hooks for RecordingHooks {
        fn read(&self, uuid: Uuid, buf: &mut [u8]) -> Status {
            let _ = (uuid, buf);
            Status::WouldBlock
        }

        fn write(&self, _uuid: Uuid, buf: &[u8]) -> Status {
            self.written.lock().extend_from_slice(buf);
            Status::Progress(buf.len())
        }
    }

    #[test]
    fn enqueue_and_flush_emits_bytes_in_order() {
        let table = crate::table::DescriptorTable::with_test_capacity(8);
        let pool = Pool::new(8);
        let uuid = table.clear(4, true, &pool).unwrap();

        let hooks = RecordingHooks::default();
        let written = hooks.written.clone();
        table.hook_set(uuid, Arc::new(hooks)).unwrap();

        table
            .with_record(uuid, |rec| {
                rec.enqueue_tail(uuid, Box::new(crate::packet::Packet::external(Bytes::from_static(
                    b"PING",
                ))));
            })
            .unwrap();

        flush(&table, &pool, uuid).unwrap();
        assert_eq!(&*written.lock(), b"PING");
    }

    #[test]
    fn flush_on_empty_queue_is_a_no_op() {
        let table = crate::table::DescriptorTable::with_test_capacity(8);
        let pool = Pool::new(8);
        let uuid = table.clear(7, true, &pool).unwrap();
        assert!(!table.with_record(uuid, |rec| rec.has_pending()).unwrap());
        flush(&table, &pool, uuid).unwrap();
        assert!(table.validate(uuid), "clean flush must not force-close");
    }

    #[test]
    fn flush_probe_reports_whether_anything_was_queued() {
        let table = crate::table::DescriptorTable::with_test_capacity(8);
        let pool = Pool::new(8);
        let uuid = table.clear(10, true, &pool).unwrap();
        table.hook_set(uuid, Arc::new(RecordingHooks::default())).unwrap();

        assert!(!flush_probe(&table, &pool, uuid).unwrap(), "nothing queued yet");

        table
            .with_record(uuid, |rec| {
                rec.enqueue_tail(uuid, Box::new(crate::packet::Packet::external(Bytes::from_static(
                    b"X",
                ))));
            })
            .unwrap();
        assert!(flush_probe(&table, &pool, uuid).unwrap(), "queue had data to drive");
        assert!(!flush_probe(&table, &pool, uuid).unwrap(), "queue drained by the previous call");
    }

    #[test]
    fn flush_strong_returns_once_the_queue_drains_and_stays_open() {
        let table = crate::table::DescriptorTable::with_test_capacity(8);
        let pool = Pool::new(8);
        let uuid = table.clear(12, true, &pool).unwrap();
        table.hook_set(uuid, Arc::new(RecordingHooks::default())).unwrap();

        table
            .with_record(uuid, |rec| {
                rec.enqueue_tail(uuid, Box::new(crate::packet::Packet::external(Bytes::from_static(
                    b"Y",
                ))));
            })
            .unwrap();

        flush_strong(&table, &pool, uuid).unwrap();
        assert!(table.validate(uuid), "a clean drain must not force-close the fd");
        assert!(!table.with_record(uuid, |rec| rec.has_pending()).unwrap());
    }

    #[test]
    fn fatal_write_force_closes_fd() {
        struct FatalHooks;
        impl Hooks for FatalHooks {
            fn read(&self, _uuid: Uuid, _buf: &mut [u8]) -> Status {
                Status::WouldBlock
            }
            fn write(&self, _uuid: Uuid, _buf: &[u8]) -> Status {
                Status::Fatal(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }

        let table = crate::table::DescriptorTable::with_test_capacity(8);
        let pool = Pool::new(8);
        let uuid = table.clear(9, true, &pool).unwrap();
        table.hook_set(uuid, Arc::new(FatalHooks)).unwrap();
        table
            .with_record(uuid, |rec| {
                rec.enqueue_tail(uuid, Box::new(crate::packet::Packet::external(Bytes::from_static(
                    b"X",
                ))));
            })
            .unwrap();

        let err = flush(&table, &pool, uuid).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!table.validate(uuid), "fatal write must force-close the fd");
    }
}
