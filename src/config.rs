// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Compile-time tunables for the buffering core.
//!
//! Plain `const`s rather than a runtime config loader -- these bound fixed
//! allocations made once at `Core::new`, so there's nothing to reload after
//! startup.

/// Inline capacity of a single packet's fixed buffer, in bytes.
pub const BUFFER_PACKET_SIZE: usize = 4096;

/// Scratch buffer size used by the portable file write loop (pread chunks).
pub const BUFFER_FILE_READ_SIZE: usize = BUFFER_PACKET_SIZE - 64;

/// Fixed number of packets kept in the process-wide pool. Exhausting it
/// blocks new grabs on `flush_all` until something frees one back.
pub const BUFFER_PACKET_POOL: usize = 128;

/// Whether the sendfile fast path is available on this platform.
pub const USE_SENDFILE: bool = cfg!(target_os = "linux");

const _: () = assert!(
    BUFFER_PACKET_SIZE >= BUFFER_FILE_READ_SIZE + 64,
    "BUFFER_PACKET_SIZE must be at least BUFFER_FILE_READ_SIZE + 64"
);
