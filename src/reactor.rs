// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! External collaborator hooks for readiness and idle-timeout notification.
//!
//! A caller that never cares about these events pays nothing: the default
//! implementation is a no-op, installed once via [`OnceLock`] so only the
//! first registration (if any) takes effect.

use crate::handle::Uuid;
use std::sync::OnceLock;

/// External collaborator notified about readiness and idle-timeout events.
///
/// None of these are called by the core to drive its own behavior -- they
/// are pure notifications for an event loop / timeout manager that lives
/// outside this crate.
pub trait Reactor: Send + Sync + 'static {
    /// A record has been torn down (transitioned to CLOSED).
    fn on_close(&self, uuid: Uuid) {
        let _ = uuid;
    }

    /// Best-effort detach from a readiness source. Returns `false` if there
    /// was nothing registered for this handle.
    fn remove(&self, uuid: Uuid) -> bool {
        let _ = uuid;
        false
    }

    /// Reset an idle timer associated with this handle, if any.
    fn touch(&self, uuid: Uuid) {
        let _ = uuid;
    }
}

struct NoopReactor;
impl Reactor for NoopReactor {}

static REACTOR: OnceLock<Box<dyn Reactor>> = OnceLock::new();

/// Registers the process-wide reactor. Intended to be called once at
/// startup; subsequent calls are ignored (the first registration wins).
pub fn set(reactor: impl Reactor) {
    let _ = REACTOR.set(Box::new(reactor));
}

#[inline]
pub(crate) fn get() -> &'static dyn Reactor {
    REACTOR.get_or_init(|| Box::new(NoopReactor)).as_ref()
}
