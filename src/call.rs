// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Remote calls — synchronous invocation of a handler owned by one
// participant from any participant.
//
// The call state in shared memory records the owner and the number of
// outstanding replies; the handler itself is a closure in the owner
// process's slab. Executing against the owner's own call invokes the
// handler directly; otherwise a request (stamped with a world-unique
// serial) is posted to the owner's mailbox and the caller blocks until the
// matching reply arrives, draining its own mailbox while it waits so
// nested traffic cannot deadlock it.
//
// Handlers may defer completion by returning `Retain`; the retained serial
// is completed later with `call_return`.

use std::ptr::addr_of_mut;

use crate::error::{Result, WorldError};
use crate::mailbox::{Message, REPLY_DESTROYED, REPLY_OK};
use crate::platform::{self, LockAcquire, RawMutex};
use crate::shm_pool::{SharedPool, SharedRef};
use crate::world::World;

const CALL_ALIVE: u32 = 0x4341_4c4c; // "CALL"
const CALL_DEAD: u32 = 0xdead_4c4c;

/// Execute-time flag: do not wait for (or send) a reply.
pub const CALL_ONEWAY: u32 = 1;

/// Init-time flag: the call tears itself down after its first completed
/// request.
pub const CALL_ONESHOT: u32 = 2;

/// What a handler wants done with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    /// Reply now with this value.
    Reply(i32),
    /// Keep the request open; complete it later via [`call_return`].
    Retain,
}

/// A decoded request as seen by the handler.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// World-unique serial, needed for [`call_return`] after `Retain`.
    pub serial: u32,
    /// Participant id of the caller.
    pub caller: u32,
    pub arg: i32,
    pub data: Vec<u8>,
}

/// A call handler. Runs in the owning process only.
pub type CallHandler = Box<dyn FnMut(&World, CallRequest) -> CallResult + Send>;

/// Owner-side bookkeeping for a request kept open by `Retain`.
pub(crate) struct RetainedCall {
    pub(crate) call: SharedRef,
    pub(crate) caller: u32,
    pub(crate) oneway: bool,
}

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

#[repr(C)]
pub(crate) struct CallData {
    magic: u32,
    owner: u32,
    /// Requests accepted but not yet replied to.
    pending: u32,
    flags: u32,
    /// Handler slab key, meaningful only in the owner process.
    handler_index: u32,
    lock: RawMutex,
}

unsafe fn lock(d: *mut CallData) -> Result<()> {
    if let LockAcquire::Recovered = platform::mutex_lock(addr_of_mut!((*d).lock), None)? {
        tracing::warn!("call lock holder died, recovered");
    }
    Ok(())
}

unsafe fn unlock(d: *mut CallData) -> Result<()> {
    platform::mutex_unlock(addr_of_mut!((*d).lock))
}

unsafe fn check_alive(d: *mut CallData) -> Result<()> {
    match (*d).magic {
        CALL_ALIVE => Ok(()),
        CALL_DEAD => Err(WorldError::Destroyed),
        other => Err(WorldError::Bug(format!("call magic {other:#x}"))),
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to a call in a shared pool. Cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    data: SharedRef,
}

impl Call {
    /// Allocate a call in `pool` and bind `handler` to the calling
    /// participant, which becomes the owner.
    pub fn init(
        world: &World,
        pool: &SharedPool,
        flags: u32,
        handler: impl FnMut(&World, CallRequest) -> CallResult + Send + 'static,
    ) -> Result<Self> {
        let data = pool.allocate(world, std::mem::size_of::<CallData>())?;
        let d = world.translate(data, std::mem::size_of::<CallData>())? as *mut CallData;
        let key = world.register_handler(Box::new(handler));
        unsafe {
            platform::mutex_init(addr_of_mut!((*d).lock))?;
            (*d).owner = world.participant_id();
            (*d).pending = 0;
            (*d).flags = flags;
            (*d).handler_index = key as u32;
            (*d).magic = CALL_ALIVE;
        }
        Ok(Self { data })
    }

    /// Handle to an existing call published by another process.
    pub fn from_ref(data: SharedRef) -> Self {
        Self { data }
    }

    pub fn shared_ref(&self) -> SharedRef {
        self.data
    }

    fn ptr(&self, world: &World) -> Result<*mut CallData> {
        Ok(world.translate(self.data, std::mem::size_of::<CallData>())? as *mut CallData)
    }

    /// Invoke the call with `arg` and `data`.
    ///
    /// Without `CALL_ONEWAY` this blocks until the handler (or a later
    /// `call_return`) replies, and returns the reply value. A dead owner or
    /// a torn-down call yields `Destroyed`.
    pub fn execute(&self, world: &World, flags: u32, arg: i32, data: &[u8]) -> Result<i32> {
        let d = self.ptr(world)?;
        let oneway = flags & CALL_ONEWAY != 0;
        let serial = world.next_serial();

        let owner = unsafe {
            lock(d)?;
            let r = (|| {
                check_alive(d)?;
                let owner = (*d).owner;
                if !oneway {
                    (*d).pending += 1;
                }
                Ok(owner)
            })();
            unlock(d)?;
            r?
        };

        if owner == world.participant_id() {
            return self.execute_direct(world, d, serial, flags, arg, data, oneway);
        }

        let msg = Message::CallRequest {
            call: self.data,
            serial,
            caller: world.participant_id(),
            flags,
            arg,
            payload: data.to_vec(),
        };
        if let Err(e) = world.post(owner, &msg) {
            if !oneway {
                unsafe {
                    lock(d)?;
                    (*d).pending = (*d).pending.saturating_sub(1);
                    unlock(d)?;
                }
            }
            // An owner that is gone means the call can never complete.
            return Err(match e {
                WorldError::NotFound(_) => WorldError::Destroyed,
                other => other,
            });
        }
        if oneway {
            return Ok(0);
        }

        let (status, value) = world.wait_reply(serial, owner)?;
        match status {
            REPLY_OK => Ok(value),
            REPLY_DESTROYED => Err(WorldError::Destroyed),
            other => Err(WorldError::Bug(format!("call reply status {other}"))),
        }
    }

    fn execute_direct(
        &self,
        world: &World,
        d: *mut CallData,
        serial: u32,
        _flags: u32,
        arg: i32,
        data: &[u8],
        oneway: bool,
    ) -> Result<i32> {
        let index = unsafe { (*d).handler_index } as usize;
        let req = CallRequest {
            serial,
            caller: world.participant_id(),
            arg,
            data: data.to_vec(),
        };
        match world.run_handler(index, req) {
            None => {
                if !oneway {
                    unsafe { dec_pending(d)? };
                }
                Err(WorldError::Destroyed)
            }
            Some(CallResult::Reply(v)) => {
                if !oneway {
                    unsafe { dec_pending(d)? };
                }
                finish_oneshot(world, self.data, d)?;
                Ok(v)
            }
            Some(CallResult::Retain) => {
                world.retain_call(
                    serial,
                    RetainedCall {
                        call: self.data,
                        caller: world.participant_id(),
                        oneway,
                    },
                );
                if oneway {
                    return Ok(0);
                }
                // Another thread of this process completes the serial.
                let (status, value) = world.wait_reply(serial, world.participant_id())?;
                match status {
                    REPLY_OK => Ok(value),
                    REPLY_DESTROYED => Err(WorldError::Destroyed),
                    other => Err(WorldError::Bug(format!("call reply status {other}"))),
                }
            }
        }
    }

    /// Tear the call down. `Busy` while replies are outstanding. Storage is
    /// returned to the pool by whoever allocated it.
    pub fn destroy(&self, world: &World) -> Result<()> {
        let d = self.ptr(world)?;
        unsafe {
            lock(d)?;
            let r = (|| {
                check_alive(d)?;
                if (*d).pending > 0 {
                    // A dead owner can never reply; the blocked callers get
                    // `Destroyed` from their own liveness re-check.
                    if world.participant_alive((*d).owner) {
                        return Err(WorldError::Busy);
                    }
                    tracing::warn!(
                        owner = (*d).owner,
                        pending = (*d).pending,
                        "owner died with replies outstanding, dropping them"
                    );
                    (*d).pending = 0;
                }
                let handler = ((*d).owner == world.participant_id())
                    .then_some((*d).handler_index as usize);
                (*d).magic = CALL_DEAD;
                Ok(handler)
            })();
            unlock(d)?;
            if let Some(key) = r? {
                world.remove_handler(key);
            }
        }
        Ok(())
    }
}

unsafe fn dec_pending(d: *mut CallData) -> Result<()> {
    lock(d)?;
    (*d).pending = (*d).pending.saturating_sub(1);
    unlock(d)
}

/// Self-destruct a `CALL_ONESHOT` call after its first completed request.
fn finish_oneshot(world: &World, call: SharedRef, d: *mut CallData) -> Result<()> {
    unsafe {
        lock(d)?;
        let key = (|| {
            if (*d).magic != CALL_ALIVE || (*d).flags & CALL_ONESHOT == 0 {
                return None;
            }
            (*d).magic = CALL_DEAD;
            ((*d).owner == world.participant_id()).then_some((*d).handler_index as usize)
        })();
        unlock(d)?;
        if let Some(key) = key {
            world.remove_handler(key);
            tracing::debug!(?call, "oneshot call retired");
        }
    }
    Ok(())
}

/// Owner-side entry point for a request arriving by mailbox. Called from
/// `World::process_pending`.
pub(crate) fn handle_request(
    world: &World,
    call: SharedRef,
    serial: u32,
    caller: u32,
    flags: u32,
    arg: i32,
    payload: Vec<u8>,
) -> Result<()> {
    let d = world.translate(call, std::mem::size_of::<CallData>())? as *mut CallData;
    let oneway = flags & CALL_ONEWAY != 0;

    let index = unsafe {
        lock(d)?;
        let r = match (*d).magic {
            CALL_ALIVE => Ok((*d).handler_index as usize),
            _ => Err(WorldError::Destroyed),
        };
        unlock(d)?;
        r
    };

    let index = match index {
        Ok(i) => i,
        Err(_) => {
            reply_to(world, caller, serial, REPLY_DESTROYED, 0, oneway);
            return Ok(());
        }
    };

    let req = CallRequest {
        serial,
        caller,
        arg,
        data: payload,
    };
    match world.run_handler(index, req) {
        None => {
            reply_to(world, caller, serial, REPLY_DESTROYED, 0, oneway);
            if !oneway {
                unsafe { dec_pending(d)? };
            }
        }
        Some(CallResult::Reply(v)) => {
            reply_to(world, caller, serial, REPLY_OK, v, oneway);
            if !oneway {
                unsafe { dec_pending(d)? };
            }
            finish_oneshot(world, call, d)?;
        }
        Some(CallResult::Retain) => {
            world.retain_call(
                serial,
                RetainedCall {
                    call,
                    caller,
                    oneway,
                },
            );
        }
    }
    Ok(())
}

/// Post a reply, dropping it if the caller died (the pending bookkeeping is
/// still cleared by the caller of this function).
fn reply_to(world: &World, caller: u32, serial: u32, status: u32, value: i32, oneway: bool) {
    if oneway {
        return;
    }
    if caller == world.participant_id() {
        world.deliver_reply(serial, status, value);
        return;
    }
    let msg = Message::CallReply {
        serial,
        status,
        value,
    };
    if let Err(err) = world.post(caller, &msg) {
        tracing::warn!(caller, serial, %err, "dropping reply to dead caller");
    }
}

/// Complete a request previously kept open with [`CallResult::Retain`].
/// `NotFound` for unknown or already-completed serials.
pub fn call_return(world: &World, serial: u32, value: i32) -> Result<()> {
    let retained = world
        .take_retained(serial)
        .ok_or_else(|| WorldError::NotFound(format!("retained call serial {serial}")))?;

    let d = world.translate(retained.call, std::mem::size_of::<CallData>())? as *mut CallData;
    reply_to(world, retained.caller, serial, REPLY_OK, value, retained.oneway);
    if !retained.oneway {
        unsafe { dec_pending(d)? };
    }
    finish_oneshot(world, retained.call, d)?;
    Ok(())
}
