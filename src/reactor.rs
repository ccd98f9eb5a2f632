// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Reactors — per-object event fan-out across participants.
//
// The reaction table lives in shared memory: each entry records which
// participant attached, in attachment order (monotonic tokens). What runs is
// process-local: a local reaction is a closure in the attaching World's slab,
// a global reaction is an index into a function table the program passes to
// `dispatch` (identical in every process, so the index is meaningful
// everywhere).
//
// Dispatch runs the dispatcher's own local reactions and all global
// reactions synchronously, and posts exactly one mailbox notification per
// other participant that has local reactions attached; those are delivered
// by that participant's `World::process_pending`. Entries of dead
// participants are pruned lazily at dispatch time.
//
// `dispatch_count` tracks notifications posted but not yet delivered, and
// `pending` splits it per receiving participant; the delivery that drops it
// to zero reports the reactor idle, which the object layer uses to drain
// zombies. A receiver that dies with notifications queued never delivers
// them, so `reap_dead` discounts its share and lets the reactor drain.

use std::ptr::addr_of_mut;
use std::sync::{Arc, Mutex};

use crate::error::{Result, WorldError};
use crate::mailbox::{Message, MAIL_DATA};
use crate::platform::{self, LockAcquire, RawMutex};
use crate::shm_pool::{SharedPool, SharedRef};
use crate::world::{World, MAX_PARTICIPANTS};

const REACTOR_ALIVE: u32 = 0x5243_5452; // "RCTR"
const REACTOR_DEAD: u32 = 0xdead_5452;

/// Reaction table slots per reactor.
pub const MAX_REACTIONS: usize = 32;

const KIND_LOCAL: u32 = 1;
const KIND_GLOBAL: u32 = 2;

/// What a reaction wants done after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionResult {
    /// Stay attached.
    Keep,
    /// Detach this reaction.
    Remove,
    /// Detach this reaction and stop delivering this event to reactions
    /// attached after it.
    Stop,
}

/// A local reaction body. Runs in the process that attached it.
pub type ReactionFn = Box<dyn FnMut(&[u8]) -> ReactionResult + Send>;

pub(crate) type SharedReaction = Arc<Mutex<ReactionFn>>;

/// A global reaction body. The table passed to `dispatch` must be the same
/// in every process of the program; entries are addressed by index.
pub type GlobalReactionFn = fn(&World, SharedRef, &[u8]) -> ReactionResult;

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy)]
struct ReactionEntry {
    token: u32, // 0 = free slot
    participant: u32,
    kind: u32,
    index: u32, // local: slab key in the attaching process; global: table index
    ctx_pool: u32,
    ctx_offset: u32,
}

/// Reactor state in shared memory. Embedded by object headers; standalone
/// reactors allocate one from a shared pool.
#[repr(C)]
pub(crate) struct ReactorData {
    magic: u32,
    /// Mailbox notifications posted but not yet delivered.
    dispatch_count: u32,
    next_token: u32,
    /// Per-participant share of `dispatch_count` (index = id - 1), so the
    /// deliveries of a participant that died can be discounted.
    pending: [u32; MAX_PARTICIPANTS],
    entries: [ReactionEntry; MAX_REACTIONS],
    lock: RawMutex,
}

/// # Safety
/// `d` must point to writable shared memory of `size_of::<ReactorData>()`.
pub(crate) unsafe fn raw_init(d: *mut ReactorData) -> Result<()> {
    platform::mutex_init(addr_of_mut!((*d).lock))?;
    (*d).dispatch_count = 0;
    (*d).next_token = 0;
    (*d).pending = [0; MAX_PARTICIPANTS];
    for e in (*d).entries.iter_mut() {
        e.token = 0;
    }
    (*d).magic = REACTOR_ALIVE;
    Ok(())
}

unsafe fn lock(d: *mut ReactorData) -> Result<()> {
    if let LockAcquire::Recovered = platform::mutex_lock(addr_of_mut!((*d).lock), None)? {
        // Entries are validated by their tokens; continue under the lock.
        tracing::warn!("reactor lock holder died, recovered");
    }
    Ok(())
}

unsafe fn unlock(d: *mut ReactorData) -> Result<()> {
    platform::mutex_unlock(addr_of_mut!((*d).lock))
}

unsafe fn check_alive(d: *mut ReactorData) -> Result<()> {
    match (*d).magic {
        REACTOR_ALIVE => Ok(()),
        REACTOR_DEAD => Err(WorldError::Destroyed),
        other => Err(WorldError::Bug(format!("reactor magic {other:#x}"))),
    }
}

/// Drop the undelivered share of every dead participant, pruning its table
/// entries along the way. Caller holds the reactor lock.
unsafe fn discount_dead(world: &World, d: *mut ReactorData) {
    for idx in 0..MAX_PARTICIPANTS {
        let id = idx as u32 + 1;
        if (*d).pending[idx] == 0 || world.participant_alive(id) {
            continue;
        }
        tracing::warn!(
            participant = id,
            undelivered = (*d).pending[idx],
            "discounting notifications of dead participant"
        );
        (*d).dispatch_count = (*d).dispatch_count.saturating_sub((*d).pending[idx]);
        (*d).pending[idx] = 0;
        for e in (*d).entries.iter_mut() {
            if e.token != 0 && e.participant == id {
                e.token = 0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to an attached reaction, used to detach it again.
#[derive(Debug, Clone, Copy)]
pub struct Reaction {
    reactor: SharedRef,
    token: u32,
    slab_key: Option<usize>,
}

/// Handle to a reactor in a shared pool. Cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reactor {
    data: SharedRef,
}

impl Reactor {
    /// Allocate and initialise a new reactor inside `pool`.
    pub fn init(world: &World, pool: &SharedPool) -> Result<Self> {
        let data = pool.allocate(world, std::mem::size_of::<ReactorData>())?;
        Self::init_at(world, data)
    }

    /// Initialise a reactor at an existing location (embedding).
    pub fn init_at(world: &World, data: SharedRef) -> Result<Self> {
        let ptr = world.translate(data, std::mem::size_of::<ReactorData>())? as *mut ReactorData;
        unsafe { raw_init(ptr)? };
        Ok(Self { data })
    }

    /// Handle to an existing reactor published by another process.
    pub fn from_ref(data: SharedRef) -> Self {
        Self { data }
    }

    pub fn shared_ref(&self) -> SharedRef {
        self.data
    }

    fn ptr(&self, world: &World) -> Result<*mut ReactorData> {
        Ok(world.translate(self.data, std::mem::size_of::<ReactorData>())? as *mut ReactorData)
    }

    fn claim_entry(
        &self,
        world: &World,
        kind: u32,
        index: u32,
        ctx: SharedRef,
    ) -> Result<u32> {
        let d = self.ptr(world)?;
        unsafe {
            lock(d)?;
            let r = (|| {
                check_alive(d)?;
                let slot = (*d).entries.iter_mut().find(|e| e.token == 0);
                match slot {
                    Some(e) => {
                        (*d).next_token += 1;
                        let token = (*d).next_token;
                        *e = ReactionEntry {
                            token,
                            participant: world.participant_id(),
                            kind,
                            index,
                            ctx_pool: ctx.pool,
                            ctx_offset: ctx.offset,
                        };
                        Ok(token)
                    }
                    None => Err(WorldError::OutOfMemory),
                }
            })();
            unlock(d)?;
            r
        }
    }

    /// Attach a local reaction: `f` runs in THIS process whenever the
    /// reactor dispatches, whichever participant dispatched.
    pub fn attach(
        &self,
        world: &World,
        f: impl FnMut(&[u8]) -> ReactionResult + Send + 'static,
    ) -> Result<Reaction> {
        let key = world.register_reaction(Box::new(f));
        match self.claim_entry(world, KIND_LOCAL, key as u32, SharedRef::NULL) {
            Ok(token) => Ok(Reaction {
                reactor: self.data,
                token,
                slab_key: Some(key),
            }),
            Err(e) => {
                world.remove_reaction(key);
                Err(e)
            }
        }
    }

    /// Attach a global reaction by index into the program's global reaction
    /// table. `ctx` is handed to the function on every delivery.
    pub fn attach_global(&self, world: &World, index: u32, ctx: SharedRef) -> Result<Reaction> {
        let token = self.claim_entry(world, KIND_GLOBAL, index, ctx)?;
        Ok(Reaction {
            reactor: self.data,
            token,
            slab_key: None,
        })
    }

    /// Detach a reaction. Idempotent: detaching one already removed (e.g. by
    /// returning `Remove`) is a no-op.
    pub fn detach(&self, world: &World, reaction: &Reaction) -> Result<()> {
        if reaction.reactor != self.data {
            return Err(WorldError::Invalid("reaction belongs to another reactor"));
        }
        let d = self.ptr(world)?;
        unsafe {
            lock(d)?;
            let r = (|| {
                check_alive(d)?;
                if let Some(e) = (*d)
                    .entries
                    .iter_mut()
                    .find(|e| e.token == reaction.token)
                {
                    e.token = 0;
                }
                Ok(())
            })();
            unlock(d)?;
            r?;
        }
        if let Some(key) = reaction.slab_key {
            world.remove_reaction(key);
        }
        Ok(())
    }

    /// Dispatch `payload` to every attached reaction: the caller's own local
    /// reactions and all global reactions run synchronously in attachment
    /// order; each other participant with local reactions gets one mailbox
    /// notification. Entries of dead participants are pruned first.
    ///
    /// Returns `true` when the reactor is idle afterwards (no notification
    /// still awaiting delivery).
    pub fn dispatch(
        &self,
        world: &World,
        payload: &[u8],
        globals: &[GlobalReactionFn],
    ) -> Result<bool> {
        // A mailbox slot holds the whole payload or nothing; remote
        // listeners must see the same bytes as local ones.
        if payload.len() > MAIL_DATA {
            return Err(WorldError::Invalid("payload exceeds a mailbox slot"));
        }
        let d = self.ptr(world)?;
        let me = world.participant_id();

        let (snapshot, remotes) = unsafe {
            lock(d)?;
            let r = (|| {
                check_alive(d)?;
                for e in (*d).entries.iter_mut() {
                    if e.token != 0 && !world.participant_alive(e.participant) {
                        tracing::warn!(
                            participant = e.participant,
                            "pruning reaction of dead participant"
                        );
                        e.token = 0;
                    }
                }
                let mut snapshot: Vec<ReactionEntry> = (*d)
                    .entries
                    .iter()
                    .filter(|e| e.token != 0)
                    .copied()
                    .collect();
                snapshot.sort_by_key(|e| e.token);

                let mut remotes: Vec<u32> = snapshot
                    .iter()
                    .filter(|e| e.kind == KIND_LOCAL && e.participant != me)
                    .map(|e| e.participant)
                    .collect();
                remotes.sort_unstable();
                remotes.dedup();
                (*d).dispatch_count += remotes.len() as u32;
                for p in &remotes {
                    (*d).pending[*p as usize - 1] += 1;
                }
                discount_dead(world, d);
                Ok((snapshot, remotes))
            })();
            unlock(d)?;
            r?
        };

        // Synchronous deliveries, outside the reactor lock.
        for entry in &snapshot {
            let result = match entry.kind {
                KIND_GLOBAL => {
                    let idx = entry.index as usize;
                    match globals.get(idx) {
                        Some(f) => f(
                            world,
                            SharedRef {
                                pool: entry.ctx_pool,
                                offset: entry.ctx_offset,
                            },
                            payload,
                        ),
                        None => {
                            tracing::error!(index = idx, "global reaction index out of table");
                            ReactionResult::Keep
                        }
                    }
                }
                KIND_LOCAL if entry.participant == me => {
                    match world.run_reaction(entry.index as usize, payload) {
                        Some(r) => r,
                        None => ReactionResult::Remove, // closure already gone
                    }
                }
                _ => continue,
            };
            match result {
                ReactionResult::Keep => {}
                ReactionResult::Remove | ReactionResult::Stop => {
                    self.detach(
                        world,
                        &Reaction {
                            reactor: self.data,
                            token: entry.token,
                            slab_key: (entry.kind == KIND_LOCAL && entry.participant == me)
                                .then_some(entry.index as usize),
                        },
                    )?;
                    if result == ReactionResult::Stop {
                        break;
                    }
                }
            }
        }

        // One notification per remote participant with local reactions.
        let mut failed = Vec::new();
        for p in &remotes {
            let msg = Message::Notification {
                reactor: self.data,
                payload: payload.to_vec(),
            };
            if world.post(*p, &msg).is_err() {
                failed.push(*p);
            }
        }

        unsafe {
            lock(d)?;
            for p in failed {
                (*d).dispatch_count = (*d).dispatch_count.saturating_sub(1);
                let slot = &mut (*d).pending[p as usize - 1];
                *slot = slot.saturating_sub(1);
            }
            let idle = (*d).dispatch_count == 0;
            unlock(d)?;
            Ok(idle)
        }
    }

    /// Re-check receiver liveness and discount notifications that can never
    /// be delivered. Returns `true` when that left the reactor idle.
    pub(crate) fn reap_dead(&self, world: &World) -> Result<bool> {
        let d = self.ptr(world)?;
        unsafe {
            lock(d)?;
            let idle = if (*d).magic == REACTOR_ALIVE {
                discount_dead(world, d);
                (*d).dispatch_count == 0
            } else {
                false
            };
            unlock(d)?;
            Ok(idle)
        }
    }

    /// Tear down the reactor. Local closures of this process are dropped;
    /// queued notifications for it are ignored on delivery.
    pub fn destroy(&self, world: &World) -> Result<()> {
        let d = self.ptr(world)?;
        let me = world.participant_id();
        unsafe {
            lock(d)?;
            let r = (|| {
                check_alive(d)?;
                for e in (*d).entries.iter_mut() {
                    if e.token != 0 {
                        if e.kind == KIND_LOCAL && e.participant == me {
                            world.remove_reaction(e.index as usize);
                        }
                        e.token = 0;
                    }
                }
                (*d).magic = REACTOR_DEAD;
                Ok(())
            })();
            unlock(d)?;
            r
        }
    }
}

/// Deliver a queued notification to this process's local reactions of
/// `reactor`. Called from `World::process_pending`.
///
/// Returns `true` when this delivery made the reactor idle.
pub(crate) fn deliver_local(world: &World, reactor: SharedRef, payload: &[u8]) -> Result<bool> {
    let d = world.translate(reactor, std::mem::size_of::<ReactorData>())? as *mut ReactorData;
    let me = world.participant_id();

    unsafe {
        lock(d)?;
        let snapshot = match check_alive(d) {
            Ok(()) => {
                let mut s: Vec<ReactionEntry> = (*d)
                    .entries
                    .iter()
                    .filter(|e| e.token != 0 && e.kind == KIND_LOCAL && e.participant == me)
                    .copied()
                    .collect();
                s.sort_by_key(|e| e.token);
                s
            }
            Err(WorldError::Destroyed) => Vec::new(),
            Err(e) => {
                unlock(d)?;
                return Err(e);
            }
        };
        unlock(d)?;

        for entry in &snapshot {
            let result = match world.run_reaction(entry.index as usize, payload) {
                Some(r) => r,
                None => ReactionResult::Remove,
            };
            match result {
                ReactionResult::Keep => {}
                ReactionResult::Remove | ReactionResult::Stop => {
                    Reactor::from_ref(reactor).detach(
                        world,
                        &Reaction {
                            reactor,
                            token: entry.token,
                            slab_key: Some(entry.index as usize),
                        },
                    )?;
                    if result == ReactionResult::Stop {
                        break;
                    }
                }
            }
        }

        lock(d)?;
        (*d).dispatch_count = (*d).dispatch_count.saturating_sub(1);
        let slot = &mut (*d).pending[me as usize - 1];
        *slot = slot.saturating_sub(1);
        let idle = (*d).dispatch_count == 0 && (*d).magic == REACTOR_ALIVE;
        unlock(d)?;
        Ok(idle)
    }
}
