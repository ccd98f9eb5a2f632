// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors

#[cfg(unix)]
pub mod posix;

#[cfg(unix)]
pub(crate) use posix::{
    cond_broadcast, cond_init, cond_wait, mutex_init, mutex_lock, mutex_trylock, mutex_unlock,
    pid_alive, LockAcquire, RawCond, RawMutex, Segment, SegmentMode,
};
