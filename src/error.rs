// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Error taxonomy for the world runtime.
//
// Low-level primitives hand errors straight back to the immediate caller;
// there is no automatic retry anywhere in the crate. `Bug` means an invariant
// was violated (down past zero, double destroy of live state, corrupted shm
// header) — those are logged at error level where they are detected and are
// never silently repaired.

use std::io;

use thiserror::Error;

/// Errors surfaced by world, pool, lock, refcount, reactor and call operations.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Backing store unavailable or world bootstrap failed. Fatal to the
    /// joining/creating process.
    #[error("world init failed: {0}")]
    Init(String),

    /// Unknown name, object, serial or world.
    #[error("not found: {0}")]
    NotFound(String),

    /// A non-blocking acquire hit a held lock, or a teardown found the
    /// resource still in use.
    #[error("busy")]
    Busy,

    /// The object, counter, call or pool has already been torn down. The
    /// caller must drop its reference.
    #[error("destroyed")]
    Destroyed,

    /// Invariant violation. Logged loudly at the detection site.
    #[error("invariant violated: {0}")]
    Bug(String),

    /// Shared pool (or a fixed shm table) is exhausted.
    #[error("out of shared memory")]
    OutOfMemory,

    /// A robust lock was acquired, but its previous holder died while holding
    /// it. The lock IS held by the caller at this point; protected state may
    /// need validation before reuse.
    #[error("previous lock holder died")]
    OwnerDied,

    /// A timed wait expired.
    #[error("timed out")]
    Timeout,

    /// Caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

pub type Result<T> = std::result::Result<T, WorldError>;

impl WorldError {
    /// Wrap a failed syscall/pthread op that can only mean corrupted shared
    /// state or a programming error. Logs at error level.
    pub(crate) fn os_bug(op: &str, err: io::Error) -> Self {
        tracing::error!(%op, %err, "unexpected OS error on shared primitive");
        WorldError::Bug(format!("{op}: {err}"))
    }

    /// Same, from a raw errno value.
    pub(crate) fn errno_bug(op: &str, eno: i32) -> Self {
        Self::os_bug(op, io::Error::from_raw_os_error(eno))
    }
}
