// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors

//! Multi-process coordination over shared memory.
//!
//! A [`World`] is a named session that cooperating processes create or join.
//! Inside it live shared pools of allocatable memory addressed by
//! [`SharedRef`] instead of raw pointers, plus the primitives built on top:
//!
//! - [`Skirmish`] — robust distributed mutexes that survive holder death,
//! - [`RefCounter`] — reference counters with a one-shot zero watch,
//! - [`Reactor`] — event fan-out to reactions in any participant,
//! - [`Call`] — synchronous invocation of another participant's handler,
//! - [`ObjectPool`] — reference-counted shared objects with coordinated
//!   teardown (terminal notification strictly before the destructor).
//!
//! Cross-participant traffic travels through per-participant mailbox rings
//! in the world segment; each participant drains its own with
//! [`World::process_pending`]. Liveness is pid-based throughout: dead
//! participants are detected, their locks recovered and their reactions
//! pruned, instead of wedging the session.
//!
//! Unix only: the recovery story is anchored on robust process-shared
//! pthread mutexes.

pub mod call;
pub mod error;
mod mailbox;
pub mod object;
mod platform;
pub mod reactor;
pub mod refs;
mod shm_name;
pub mod shm_pool;
pub mod skirmish;
pub mod world;

pub use call::{call_return, Call, CallRequest, CallResult, CALL_ONESHOT, CALL_ONEWAY};
pub use error::{Result, WorldError};
pub use mailbox::{MAIL_DATA, MAIL_SLOTS};
pub use object::{ObjectNotice, ObjectPool, ObjectState, SharedObject};
pub use platform::posix::largest_tmpfs;
pub use reactor::{GlobalReactionFn, Reaction, ReactionResult, Reactor, MAX_REACTIONS};
pub use refs::RefCounter;
pub use shm_pool::{SharedPool, SharedRef};
pub use skirmish::{Skirmish, SkirmishGuard};
pub use world::{World, WorldConfig, MAX_PARTICIPANTS};

/// Copy a string into a fixed nul-padded shm name field, truncating to fit.
pub(crate) fn copy_name(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    for b in dst[n..].iter_mut() {
        *b = 0;
    }
}

/// Read a nul-padded shm name field back as a str.
pub(crate) fn name_str(raw: &[u8]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}
