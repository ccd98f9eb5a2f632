// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Reference counters in shared memory.
//
// A counter tracks local (per-process) and global references separately and
// supports a one-shot zero watch: a call that fires exactly once when the
// combined count reaches zero. The counter is sealed at that instant, so the
// count is guaranteed to stay at zero while the watch completes — late `up`
// calls get `Destroyed` instead of resurrecting the counter.
//
// Guarded by a robust mutex + condvar pair so `zero_lock` can wait for the
// zero transition and steal the inspection lock from a dead holder.

use std::ptr::addr_of_mut;

use crate::call::{Call, CALL_ONEWAY};
use crate::error::{Result, WorldError};
use crate::platform::{self, LockAcquire, RawCond, RawMutex};
use crate::shm_pool::{SharedPool, SharedRef};
use crate::world::World;
use crate::{copy_name, name_str};

const REF_ALIVE: u32 = 0x5245_4643; // "REFC"
const REF_DEAD: u32 = 0xdead_4643;

pub(crate) const REF_NAME_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

/// Counter state in shared memory. Embedded by object headers; standalone
/// counters allocate one from a shared pool.
#[repr(C)]
pub(crate) struct RefData {
    magic: u32,
    /// Participant holding the zero lock, 0 = none.
    locked_by: u32,
    local: i32,
    global: i32,
    watch_pool: u32,
    watch_offset: u32,
    watch_arg: i32,
    has_watch: u32,
    name: [u8; REF_NAME_LEN],
    lock: RawMutex,
    cond: RawCond,
}

/// A zero watch snapshotted under the counter lock, to be fired after the
/// lock is released.
struct PendingWatch {
    call: SharedRef,
    arg: i32,
}

/// # Safety
/// `d` must point to writable shared memory of `size_of::<RefData>()`.
pub(crate) unsafe fn raw_init(d: *mut RefData) -> Result<()> {
    platform::mutex_init(addr_of_mut!((*d).lock))?;
    platform::cond_init(addr_of_mut!((*d).cond))?;
    (*d).locked_by = 0;
    (*d).local = 0;
    (*d).global = 0;
    (*d).watch_pool = 0;
    (*d).watch_offset = 0;
    (*d).watch_arg = 0;
    (*d).has_watch = 0;
    (*d).name = [0; REF_NAME_LEN];
    (*d).magic = REF_ALIVE;
    Ok(())
}

unsafe fn lock(d: *mut RefData) -> Result<()> {
    if let LockAcquire::Recovered = platform::mutex_lock(addr_of_mut!((*d).lock), None)? {
        // Counter ops are short critical sections; the count fields are
        // consistent after recovery, so continue under the lock.
        tracing::warn!("refcounter lock holder died, recovered");
    }
    Ok(())
}

unsafe fn unlock(d: *mut RefData) -> Result<()> {
    platform::mutex_unlock(addr_of_mut!((*d).lock))
}

unsafe fn check_alive(d: *mut RefData) -> Result<()> {
    match (*d).magic {
        REF_ALIVE => Ok(()),
        REF_DEAD => Err(WorldError::Destroyed),
        other => Err(WorldError::Bug(format!("refcounter magic {other:#x}"))),
    }
}

/// Handle the zero transition while holding the counter lock. Seals the
/// counter when a watch is armed; otherwise wakes `zero_lock` waiters.
unsafe fn note_zero(d: *mut RefData) -> Result<Option<PendingWatch>> {
    if (*d).has_watch != 0 {
        let watch = PendingWatch {
            call: SharedRef {
                pool: (*d).watch_pool,
                offset: (*d).watch_offset,
            },
            arg: (*d).watch_arg,
        };
        (*d).has_watch = 0;
        (*d).magic = REF_DEAD;
        platform::cond_broadcast(addr_of_mut!((*d).cond))?;
        Ok(Some(watch))
    } else {
        platform::cond_broadcast(addr_of_mut!((*d).cond))?;
        Ok(None)
    }
}

/// Wait (holding the counter lock) until no other live participant holds the
/// zero lock. A dead holder's lock is stolen.
unsafe fn wait_unlocked(world: &World, d: *mut RefData) -> Result<()> {
    loop {
        let holder = (*d).locked_by;
        if holder == 0 || holder == world.participant_id() {
            return Ok(());
        }
        if !world.participant_alive(holder) {
            tracing::warn!(holder, "zero lock holder died, stealing");
            (*d).locked_by = 0;
            return Ok(());
        }
        // Timed wait so holder death is noticed even without a signal.
        platform::cond_wait(addr_of_mut!((*d).cond), addr_of_mut!((*d).lock), Some(200))?;
        check_alive(d)?;
    }
}

// Raw operations shared with the object module, which embeds RefData in
// object headers.

/// # Safety
/// `d` must point to an initialised RefData.
pub(crate) unsafe fn raw_up(world: &World, d: *mut RefData, global: bool) -> Result<()> {
    lock(d)?;
    let r = (|| {
        check_alive(d)?;
        wait_unlocked(world, d)?;
        if global {
            (*d).global += 1;
        } else {
            (*d).local += 1;
        }
        Ok(())
    })();
    unlock(d)?;
    r
}

/// # Safety
/// `d` must point to an initialised RefData.
pub(crate) unsafe fn raw_down(world: &World, d: *mut RefData, global: bool) -> Result<()> {
    lock(d)?;
    let r = (|| {
        check_alive(d)?;
        wait_unlocked(world, d)?;
        let count = if global {
            &mut (*d).global
        } else {
            &mut (*d).local
        };
        if *count <= 0 {
            tracing::error!(
                name = name_str(&(*d).name),
                global,
                "refcounter down past zero"
            );
            return Err(WorldError::Bug("refcounter down past zero".into()));
        }
        *count -= 1;
        if (*d).local + (*d).global == 0 {
            return note_zero(d);
        }
        Ok(None)
    })();
    unlock(d)?;
    match r? {
        Some(watch) => fire_watch(world, watch),
        None => Ok(()),
    }
}

/// # Safety
/// `d` must point to an initialised RefData.
pub(crate) unsafe fn raw_stat(d: *mut RefData) -> Result<i32> {
    lock(d)?;
    let r = check_alive(d).map(|_| (*d).local + (*d).global);
    unlock(d)?;
    r
}

/// # Safety
/// `d` must point to an initialised RefData.
pub(crate) unsafe fn raw_watch(d: *mut RefData, call: SharedRef, arg: i32) -> Result<()> {
    lock(d)?;
    let r = (|| {
        check_alive(d)?;
        if (*d).has_watch != 0 {
            return Err(WorldError::Busy);
        }
        if (*d).local + (*d).global == 0 {
            return Err(WorldError::Invalid("watch on a zero counter"));
        }
        (*d).watch_pool = call.pool;
        (*d).watch_offset = call.offset;
        (*d).watch_arg = arg;
        (*d).has_watch = 1;
        Ok(())
    })();
    unlock(d)?;
    r
}

/// Tear down an embedded counter, waking any waiters.
///
/// # Safety
/// `d` must point to an initialised RefData.
pub(crate) unsafe fn raw_destroy(d: *mut RefData) -> Result<()> {
    lock(d)?;
    let r = match (*d).magic {
        REF_ALIVE => {
            (*d).magic = REF_DEAD;
            platform::cond_broadcast(addr_of_mut!((*d).cond))
        }
        REF_DEAD => Err(WorldError::Destroyed),
        other => Err(WorldError::Bug(format!("refcounter magic {other:#x}"))),
    };
    unlock(d)?;
    r
}

fn fire_watch(world: &World, watch: PendingWatch) -> Result<()> {
    Call::from_ref(watch.call).execute(world, CALL_ONEWAY, watch.arg, &[])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to a reference counter in a shared pool. Cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefCounter {
    data: SharedRef,
}

impl RefCounter {
    /// Allocate and initialise a new counter inside `pool`.
    pub fn init(world: &World, pool: &SharedPool) -> Result<Self> {
        let data = pool.allocate(world, std::mem::size_of::<RefData>())?;
        Self::init_at(world, data)
    }

    /// Initialise a counter at an existing location (embedding).
    pub fn init_at(world: &World, data: SharedRef) -> Result<Self> {
        let ptr = world.translate(data, std::mem::size_of::<RefData>())? as *mut RefData;
        unsafe { raw_init(ptr)? };
        Ok(Self { data })
    }

    /// Handle to an existing counter published by another process.
    pub fn from_ref(data: SharedRef) -> Self {
        Self { data }
    }

    pub fn shared_ref(&self) -> SharedRef {
        self.data
    }

    fn ptr(&self, world: &World) -> Result<*mut RefData> {
        Ok(world.translate(self.data, std::mem::size_of::<RefData>())? as *mut RefData)
    }

    /// Increment. `Destroyed` once torn down or after the zero watch fired.
    pub fn up(&self, world: &World, global: bool) -> Result<()> {
        unsafe { raw_up(world, self.ptr(world)?, global) }
    }

    /// Decrement. Fires the zero watch on the transition to zero; going past
    /// zero is a `Bug`.
    pub fn down(&self, world: &World, global: bool) -> Result<()> {
        unsafe { raw_down(world, self.ptr(world)?, global) }
    }

    /// Combined local + global count.
    pub fn stat(&self, world: &World) -> Result<i32> {
        unsafe { raw_stat(self.ptr(world)?) }
    }

    /// Arm the one-shot zero watch: `call` is executed one-way with `arg`
    /// when the count reaches zero. `Busy` when a watch is already armed,
    /// `Invalid` on a counter already at zero.
    pub fn watch(&self, world: &World, call: &Call, arg: i32) -> Result<()> {
        unsafe { raw_watch(self.ptr(world)?, call.shared_ref(), arg) }
    }

    /// Block until the count is zero, then hold it there: `up`/`down` from
    /// other participants wait until [`unlock`](Self::unlock). A holder whose
    /// process died is stolen from.
    pub fn zero_lock(&self, world: &World) -> Result<()> {
        let d = self.ptr(world)?;
        unsafe {
            lock(d)?;
            let r = (|| loop {
                check_alive(d)?;
                wait_unlocked(world, d)?;
                if (*d).local + (*d).global == 0 {
                    (*d).locked_by = world.participant_id();
                    return Ok(());
                }
                platform::cond_wait(addr_of_mut!((*d).cond), addr_of_mut!((*d).lock), Some(200))?;
            })();
            unlock(d)?;
            r
        }
    }

    /// Like [`zero_lock`](Self::zero_lock) without blocking; `Busy` when the
    /// count is non-zero or the lock is held by a live participant.
    pub fn zero_trylock(&self, world: &World) -> Result<()> {
        let d = self.ptr(world)?;
        unsafe {
            lock(d)?;
            let r = (|| {
                check_alive(d)?;
                let holder = (*d).locked_by;
                if holder != 0 && holder != world.participant_id() {
                    if world.participant_alive(holder) {
                        return Err(WorldError::Busy);
                    }
                    tracing::warn!(holder, "zero lock holder died, stealing");
                }
                if (*d).local + (*d).global != 0 {
                    return Err(WorldError::Busy);
                }
                (*d).locked_by = world.participant_id();
                Ok(())
            })();
            unlock(d)?;
            r
        }
    }

    /// Release the zero lock.
    pub fn unlock(&self, world: &World) -> Result<()> {
        let d = self.ptr(world)?;
        unsafe {
            lock(d)?;
            let r = (|| {
                check_alive(d)?;
                if (*d).locked_by != world.participant_id() {
                    return Err(WorldError::Invalid("zero lock not held by caller"));
                }
                (*d).locked_by = 0;
                platform::cond_broadcast(addr_of_mut!((*d).cond))
            })();
            unlock(d)?;
            r
        }
    }

    /// Move the accumulated local count of `from` onto this counter. Both
    /// counters are locked in ascending location order so concurrent
    /// inherits cannot deadlock. If `from` drops to zero its watch fires.
    pub fn inherit(&self, world: &World, from: &RefCounter) -> Result<()> {
        if self.data == from.data {
            return Err(WorldError::Invalid("inherit from self"));
        }
        let a = self.ptr(world)?;
        let b = from.ptr(world)?;
        let (first, second) = if (self.data.pool, self.data.offset) < (from.data.pool, from.data.offset)
        {
            (a, b)
        } else {
            (b, a)
        };
        unsafe {
            lock(first)?;
            lock(second)?;
            let r = (|| {
                check_alive(a)?;
                check_alive(b)?;
                let moved = (*b).local;
                (*b).local = 0;
                (*a).local += moved;
                tracing::trace!(moved, "refcounter inherited local references");
                if moved != 0 && (*b).local + (*b).global == 0 {
                    return note_zero(b);
                }
                Ok(None)
            })();
            unlock(second)?;
            unlock(first)?;
            match r? {
                Some(watch) => fire_watch(world, watch),
                None => Ok(()),
            }
        }
    }

    /// Attach a diagnostic name (shows up in logs).
    pub fn set_name(&self, world: &World, name: &str) -> Result<()> {
        let d = self.ptr(world)?;
        unsafe {
            lock(d)?;
            let r = check_alive(d).map(|_| copy_name(&mut (*d).name, name));
            unlock(d)?;
            r
        }
    }

    /// Tear down, waking any `zero_lock` waiters with `Destroyed`. Storage
    /// is returned to the pool by whoever allocated it.
    pub fn destroy(&self, world: &World) -> Result<()> {
        unsafe { raw_destroy(self.ptr(world)?) }
    }
}
