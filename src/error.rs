// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{fmt, panic::Location};

/// An error raised by the buffering core.
///
/// Carries the call site so logs and `Debug` output can point at the
/// operation that failed without needing a backtrace.
#[derive(Clone, Copy)]
pub struct Error {
    kind: Kind,
    location: &'static Location<'static>,
}

impl Error {
    #[track_caller]
    #[inline]
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            location: Location::caller(),
        }
    }

    #[inline]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[inline]
    fn file(&self) -> &'static str {
        self.location
            .file()
            .trim_start_matches(concat!(env!("CARGO_MANIFEST_DIR"), "/src/"))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("file", &self.file())
            .field("line", &self.location.line())
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[sockbuf-core:{}:{}]: {}",
            self.file(),
            self.location.line(),
            self.kind
        )
    }
}

impl std::error::Error for Error {}

impl From<Kind> for Error {
    #[track_caller]
    #[inline]
    fn from(kind: Kind) -> Self {
        Self::new(kind)
    }
}

/// Semantic error kinds the buffering core can raise.
///
/// `pool-exhaustion` is deliberately absent: it is never surfaced to a
/// caller, it is absorbed by the grab-then-`flush_all`-then-retry loop.
/// `Fatal` carries the raw `io::ErrorKind` rather than a full
/// [`std::io::Error`] so that `Kind` (and `Error`) stay `Copy`.
#[derive(Clone, Copy, Debug, thiserror::Error)]
pub enum Kind {
    /// The handle is invalid, or the record it refers to is not open.
    #[error("bad descriptor")]
    BadDescriptor,
    /// A negative offset was supplied to an enqueue.
    #[error("offset out of range")]
    Range,
    /// A fatal I/O error occurred; the fd has been force-closed.
    #[error("fatal I/O error: {0}")]
    Fatal(std::io::ErrorKind),
    /// Growing the descriptor table failed (allocation failure).
    #[error("failed to grow descriptor table")]
    CapacityExhausted,
}

impl Kind {
    #[inline]
    #[track_caller]
    pub(crate) fn err(self) -> Error {
        Error::new(self)
    }
}

impl From<Error> for std::io::Error {
    #[inline]
    #[track_caller]
    fn from(error: Error) -> Self {
        Self::new(error.kind.into(), error)
    }
}

impl From<Kind> for std::io::ErrorKind {
    #[inline]
    fn from(kind: Kind) -> Self {
        use std::io::ErrorKind;
        match kind {
            Kind::BadDescriptor => ErrorKind::NotConnected,
            Kind::Range => ErrorKind::InvalidInput,
            Kind::Fatal(kind) => kind,
            Kind::CapacityExhausted => ErrorKind::OutOfMemory,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
