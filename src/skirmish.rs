// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Skirmish — distributed mutual exclusion over shared memory.
//
// A skirmish is a robust process-shared pthread mutex living inside a
// shared pool, usable by any attached process. A holder dying does not
// wedge other waiters: the kernel flags the mutex owner-dead, the next
// acquirer makes it consistent, and the recovery is surfaced to that
// acquirer as `Err(OwnerDied)` (the lock IS held at that point) instead of
// being silently swallowed. Not reentrant.

use std::ptr::addr_of_mut;

use crate::error::{Result, WorldError};
use crate::platform::{self, LockAcquire, RawMutex};
use crate::shm_pool::{SharedPool, SharedRef};
use crate::world::World;

const SKIRMISH_ALIVE: u32 = 0x534b_524d; // "SKRM"
const SKIRMISH_DEAD: u32 = 0xdead_524d;

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

/// Skirmish state in shared memory. Embedded directly by pool headers and
/// object pools; standalone skirmishes allocate one from a shared pool.
#[repr(C)]
pub(crate) struct SkirmishData {
    magic: u32,
    /// Participant currently prevailing (diagnostic only; correctness of
    /// recovery rests on the robust mutex, not on this field).
    owner: u32,
    mutex: RawMutex,
}

// ---------------------------------------------------------------------------
// Raw operations on an embedded SkirmishData
// ---------------------------------------------------------------------------

/// # Safety
/// `d` must point to writable shared memory of `size_of::<SkirmishData>()`.
pub(crate) unsafe fn raw_init(d: *mut SkirmishData) -> Result<()> {
    platform::mutex_init(addr_of_mut!((*d).mutex))?;
    (*d).owner = 0;
    (*d).magic = SKIRMISH_ALIVE;
    Ok(())
}

/// # Safety
/// `d` must point to an initialised SkirmishData.
pub(crate) unsafe fn raw_prevail(
    d: *mut SkirmishData,
    me: u32,
    timeout_ms: Option<u64>,
) -> Result<()> {
    match platform::mutex_lock(addr_of_mut!((*d).mutex), timeout_ms)? {
        LockAcquire::Acquired => {
            (*d).owner = me;
            Ok(())
        }
        LockAcquire::Recovered => {
            let dead = (*d).owner;
            (*d).owner = me;
            tracing::warn!(previous = dead, "skirmish holder died, lock recovered");
            Err(WorldError::OwnerDied)
        }
        LockAcquire::Unavailable => Err(WorldError::Timeout),
    }
}

/// # Safety
/// `d` must point to an initialised SkirmishData.
pub(crate) unsafe fn raw_try_prevail(d: *mut SkirmishData, me: u32) -> Result<()> {
    match platform::mutex_trylock(addr_of_mut!((*d).mutex))? {
        LockAcquire::Acquired => {
            (*d).owner = me;
            Ok(())
        }
        LockAcquire::Recovered => {
            let dead = (*d).owner;
            (*d).owner = me;
            tracing::warn!(previous = dead, "skirmish holder died, lock recovered");
            Err(WorldError::OwnerDied)
        }
        LockAcquire::Unavailable => Err(WorldError::Busy),
    }
}

/// # Safety
/// `d` must point to a SkirmishData held by the calling thread.
pub(crate) unsafe fn raw_dismiss(d: *mut SkirmishData) -> Result<()> {
    (*d).owner = 0;
    platform::mutex_unlock(addr_of_mut!((*d).mutex))
}

/// Prevail for internal bookkeeping paths (free lists, object sets):
/// owner-death recovery is logged and the lock is used anyway, since those
/// structures are re-validated by their own invariant checks.
///
/// # Safety
/// `d` must point to an initialised SkirmishData.
pub(crate) unsafe fn raw_prevail_recovering(d: *mut SkirmishData, me: u32) -> Result<()> {
    match raw_prevail(d, me, None) {
        Err(WorldError::OwnerDied) => Ok(()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to a skirmish in a shared pool. Cheap to copy; every operation
/// takes the world so the offset can be translated in the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skirmish {
    data: SharedRef,
}

impl Skirmish {
    /// Allocate and initialise a new skirmish inside `pool`.
    pub fn init(world: &World, pool: &SharedPool) -> Result<Self> {
        let data = pool.allocate(world, std::mem::size_of::<SkirmishData>())?;
        let ptr = world.translate(data, std::mem::size_of::<SkirmishData>())? as *mut SkirmishData;
        unsafe { raw_init(ptr)? };
        Ok(Self { data })
    }

    /// Initialise a skirmish at an existing location (embedding).
    pub fn init_at(world: &World, data: SharedRef) -> Result<Self> {
        let ptr = world.translate(data, std::mem::size_of::<SkirmishData>())? as *mut SkirmishData;
        unsafe { raw_init(ptr)? };
        Ok(Self { data })
    }

    /// Handle to an existing skirmish published by another process.
    pub fn from_ref(data: SharedRef) -> Self {
        Self { data }
    }

    /// Location of the skirmish state.
    pub fn shared_ref(&self) -> SharedRef {
        self.data
    }

    fn ptr(&self, world: &World) -> Result<*mut SkirmishData> {
        let p = world.translate(self.data, std::mem::size_of::<SkirmishData>())?
            as *mut SkirmishData;
        match unsafe { (*p).magic } {
            SKIRMISH_ALIVE => Ok(p),
            SKIRMISH_DEAD => Err(WorldError::Destroyed),
            other => Err(WorldError::Bug(format!(
                "skirmish magic {other:#x} at {:?}",
                self.data
            ))),
        }
    }

    /// Acquire, blocking until the lock is free.
    ///
    /// `Err(OwnerDied)` means the previous holder died; the caller holds the
    /// lock and should validate whatever the skirmish protects.
    pub fn prevail(&self, world: &World) -> Result<()> {
        let p = self.ptr(world)?;
        unsafe { raw_prevail(p, world.participant_id(), None) }
    }

    /// Acquire with a deadline. `Err(Timeout)` when it expires.
    pub fn prevail_timeout(&self, world: &World, timeout_ms: u64) -> Result<()> {
        let p = self.ptr(world)?;
        unsafe { raw_prevail(p, world.participant_id(), Some(timeout_ms)) }
    }

    /// Acquire without blocking. `Err(Busy)` if held elsewhere.
    pub fn try_prevail(&self, world: &World) -> Result<()> {
        let p = self.ptr(world)?;
        unsafe { raw_try_prevail(p, world.participant_id()) }
    }

    /// Release.
    pub fn dismiss(&self, world: &World) -> Result<()> {
        let p = self.ptr(world)?;
        unsafe { raw_dismiss(p) }
    }

    /// Tear down. Refuses with `Busy` while held; `Destroyed` when already
    /// torn down. Storage is returned to the pool by whoever allocated it.
    pub fn destroy(&self, world: &World) -> Result<()> {
        let p = match self.ptr(world) {
            Err(WorldError::Destroyed) => return Err(WorldError::Destroyed),
            other => other?,
        };
        unsafe {
            match raw_try_prevail(p, world.participant_id()) {
                Ok(()) | Err(WorldError::OwnerDied) => {}
                Err(WorldError::Busy) => return Err(WorldError::Busy),
                Err(e) => return Err(e),
            }
            (*p).magic = SKIRMISH_DEAD;
            raw_dismiss(p)?;
        }
        Ok(())
    }
}

/// RAII guard: prevails on construction, dismisses on drop.
pub struct SkirmishGuard<'a> {
    world: &'a World,
    skirmish: Skirmish,
}

impl<'a> SkirmishGuard<'a> {
    /// Prevail on `skirmish`, surfacing holder death like [`Skirmish::prevail`].
    pub fn new(world: &'a World, skirmish: Skirmish) -> Result<Self> {
        skirmish.prevail(world)?;
        Ok(Self { world, skirmish })
    }
}

impl Drop for SkirmishGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.skirmish.dismiss(self.world) {
            tracing::error!(%err, "skirmish dismiss failed in guard drop");
        }
    }
}
