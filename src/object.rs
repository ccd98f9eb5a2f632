// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Object pools — reference-counted, event-dispatching shared objects with
// coordinated teardown.
//
// Every object carries an embedded reference counter and reactor. The
// counter's zero watch is wired to the pool's internal teardown call (owned
// by the creating participant), so the final `unref` — wherever it happens —
// funnels teardown through the owner:
//
//   count hits zero  →  pool call (one-way)  →  owner dispatches the
//   terminal notification  →  reactor idle?  →  destructor, unlink, free
//
// If notifications are still in flight the object lingers as a zombie; the
// delivery that makes its reactor idle re-fires the pool call, and the owner
// finalizes it then. The destructor runs exactly once, strictly after the
// terminal notification was dispatched.
//
// The pool's live-object list is guarded by an embedded skirmish. Lock
// order: pool skirmish, then object reactor/counter, then mailboxes.

use std::mem::{offset_of, size_of};
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::call::{Call, CallRequest, CallResult, CALL_ONEWAY};
use crate::error::{Result, WorldError};
use crate::mailbox::MAIL_DATA;
use crate::reactor::{self, GlobalReactionFn, Reaction, ReactionResult, Reactor};
use crate::refs::{self, RefData};
use crate::shm_pool::{SharedPool, SharedRef};
use crate::skirmish::{self, SkirmishData};
use crate::world::{World, NAME_LEN};
use crate::{copy_name, name_str};

const OBJ_POOL_MAGIC: u32 = 0x4f42_504c; // "OBPL"
const OBJ_POOL_DEAD: u32 = 0xdead_504c;
const OBJ_MAGIC: u32 = 0x4f42_4a48; // "OBJH"

/// Lifecycle of a shared object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectState {
    /// Created but not yet activated; invisible to `enumerate`.
    Creating = 1,
    Active = 2,
    /// Count reached zero, terminal notification sent, reactor not yet idle.
    Zombie = 3,
    Destroyed = 4,
}

impl ObjectState {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Creating),
            2 => Some(Self::Active),
            3 => Some(Self::Zombie),
            4 => Some(Self::Destroyed),
            _ => None,
        }
    }
}

/// The built-in terminal notification dispatched when an object dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectNotice {
    pub id: u32,
    pub state: u32,
}

impl ObjectNotice {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        Some(Self {
            id: u32::from_ne_bytes(payload[0..4].try_into().ok()?),
            state: u32::from_ne_bytes(payload[4..8].try_into().ok()?),
        })
    }

    fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.id.to_ne_bytes());
        out[4..8].copy_from_slice(&self.state.to_ne_bytes());
        out
    }
}

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct ObjectPoolData {
    magic: u32,
    call_pool: u32,
    call_offset: u32,
    object_size: u32,
    notification_size: u32,
    limit: u32,
    count: u32,
    /// Offset of the first object header, 0 = empty list.
    first: u32,
    next_id: u32,
    name: [u8; NAME_LEN],
    lock: SkirmishData,
}

#[repr(C)]
struct ObjectHeader {
    magic: u32,
    id: u32,
    next: u32,
    /// Offset of the owning ObjectPoolData in the same shared pool.
    pool_offset: u32,
    state: AtomicU32,
    terminal_sent: AtomicU32,
    refs: RefData,
    reactor: reactor::ReactorData,
}

fn header_size() -> usize {
    (size_of::<ObjectHeader>() + 7) / 8 * 8
}

// ---------------------------------------------------------------------------
// SharedObject
// ---------------------------------------------------------------------------

/// Handle to one object in an object pool. Cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedObject {
    header: SharedRef,
}

impl SharedObject {
    pub fn from_ref(header: SharedRef) -> Self {
        Self { header }
    }

    pub fn shared_ref(&self) -> SharedRef {
        self.header
    }

    /// Location of the object's user bytes.
    pub fn contents_ref(&self) -> SharedRef {
        SharedRef {
            pool: self.header.pool,
            offset: self.header.offset + header_size() as u32,
        }
    }

    fn ptr(&self, world: &World) -> Result<*mut ObjectHeader> {
        let p = world.translate(self.header, size_of::<ObjectHeader>())? as *mut ObjectHeader;
        if unsafe { (*p).magic } != OBJ_MAGIC {
            return Err(WorldError::Destroyed);
        }
        Ok(p)
    }

    pub fn id(&self, world: &World) -> Result<u32> {
        Ok(unsafe { (*self.ptr(world)?).id })
    }

    pub fn state(&self, world: &World) -> Result<ObjectState> {
        let raw = unsafe { (*self.ptr(world)?).state.load(Ordering::Acquire) };
        ObjectState::from_u32(raw)
            .ok_or_else(|| WorldError::Bug(format!("object state {raw}")))
    }

    fn reactor_ref(&self) -> SharedRef {
        SharedRef {
            pool: self.header.pool,
            offset: self.header.offset + offset_of!(ObjectHeader, reactor) as u32,
        }
    }

    fn refs_ptr(&self, world: &World) -> Result<*mut RefData> {
        let p = self.ptr(world)?;
        Ok(unsafe { addr_of_mut!((*p).refs) })
    }
}

// ---------------------------------------------------------------------------
// ObjectPool
// ---------------------------------------------------------------------------

/// Handle to an object pool. Cheap to copy; share it with other
/// participants via the world registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectPool {
    data: SharedRef,
}

impl ObjectPool {
    /// Create an object pool inside `pool`. The calling participant owns the
    /// internal teardown call: terminal notifications and destructors run on
    /// its `process_pending` (or synchronously when it drops the last
    /// reference itself). `globals` is the program's global reaction table,
    /// used when dispatching terminal notifications.
    pub fn create(
        world: &World,
        pool: &SharedPool,
        name: &str,
        object_size: usize,
        notification_size: usize,
        globals: &'static [GlobalReactionFn],
        mut destructor: impl FnMut(&World, SharedObject) + Send + 'static,
    ) -> Result<Self> {
        if name.len() >= NAME_LEN {
            return Err(WorldError::Invalid("object pool name too long"));
        }
        if notification_size > MAIL_DATA {
            return Err(WorldError::Invalid("notification size exceeds mail slot"));
        }

        let data = pool.allocate(world, size_of::<ObjectPoolData>())?;
        let handle = Self { data };
        let teardown_call = Call::init(world, pool, 0, move |w, req: CallRequest| {
            if let Err(err) = teardown_step(w, data, req.arg as u32, globals, &mut destructor) {
                tracing::error!(%err, offset = req.arg, "object teardown failed");
            }
            CallResult::Reply(0)
        })?;

        let d = handle.ptr_unchecked(world)?;
        unsafe {
            (*d).call_pool = teardown_call.shared_ref().pool;
            (*d).call_offset = teardown_call.shared_ref().offset;
            (*d).object_size = object_size as u32;
            (*d).notification_size = notification_size as u32;
            (*d).limit = world.object_limit();
            (*d).count = 0;
            (*d).first = 0;
            (*d).next_id = 0;
            copy_name(&mut (*d).name, name);
            skirmish::raw_init(addr_of_mut!((*d).lock))?;
            (*d).magic = OBJ_POOL_MAGIC;
        }
        tracing::debug!(name, object_size, "object pool created");
        Ok(handle)
    }

    /// Handle to an existing object pool published by another process.
    pub fn from_ref(data: SharedRef) -> Self {
        Self { data }
    }

    pub fn shared_ref(&self) -> SharedRef {
        self.data
    }

    fn ptr_unchecked(&self, world: &World) -> Result<*mut ObjectPoolData> {
        Ok(world.translate(self.data, size_of::<ObjectPoolData>())? as *mut ObjectPoolData)
    }

    fn ptr(&self, world: &World) -> Result<*mut ObjectPoolData> {
        let d = self.ptr_unchecked(world)?;
        match unsafe { (*d).magic } {
            OBJ_POOL_MAGIC => Ok(d),
            OBJ_POOL_DEAD => Err(WorldError::Destroyed),
            other => Err(WorldError::Bug(format!("object pool magic {other:#x}"))),
        }
    }

    pub fn name(&self, world: &World) -> Result<String> {
        let d = self.ptr(world)?;
        Ok(unsafe { name_str(&(*d).name).to_owned() })
    }

    fn teardown_call(&self, world: &World) -> Result<Call> {
        let d = self.ptr_unchecked(world)?;
        Ok(Call::from_ref(SharedRef {
            pool: unsafe { (*d).call_pool },
            offset: unsafe { (*d).call_offset },
        }))
    }

    /// Allocate a new object in `Creating` state, holding one local
    /// reference for the caller. `OutOfMemory` once the configured object
    /// limit is reached.
    pub fn create_object(&self, world: &World) -> Result<SharedObject> {
        let d = self.ptr(world)?;
        let shm = SharedPool::from_id(self.data.pool);

        unsafe {
            skirmish::raw_prevail_recovering(addr_of_mut!((*d).lock), world.participant_id())?;
            let r = (|| {
                if (*d).count >= (*d).limit {
                    return Err(WorldError::OutOfMemory);
                }
                let total = header_size() + (*d).object_size as usize;
                let obj_ref = shm.allocate(world, total)?;
                let h = world.translate(obj_ref, total)? as *mut ObjectHeader;

                (*d).next_id += 1;
                (*h).id = (*d).next_id;
                (*h).next = (*d).first;
                (*h).pool_offset = self.data.offset;
                (*h).state = AtomicU32::new(ObjectState::Creating as u32);
                (*h).terminal_sent = AtomicU32::new(0);
                refs::raw_init(addr_of_mut!((*h).refs))?;
                reactor::raw_init(addr_of_mut!((*h).reactor))?;
                (*h).magic = OBJ_MAGIC;
                (*d).first = obj_ref.offset;
                (*d).count += 1;
                Ok((obj_ref, h))
            })();
            skirmish::raw_dismiss(addr_of_mut!((*d).lock))?;
            let (obj_ref, h) = r?;

            // One reference for the creator, zero watch wired to the pool's
            // teardown call with the object's location as argument.
            refs::raw_up(world, addr_of_mut!((*h).refs), false)?;
            refs::raw_watch(
                addr_of_mut!((*h).refs),
                SharedRef {
                    pool: (*d).call_pool,
                    offset: (*d).call_offset,
                },
                obj_ref.offset as i32,
            )?;

            tracing::trace!(id = (*h).id, offset = obj_ref.offset, "object created");
            Ok(SharedObject { header: obj_ref })
        }
    }

    /// Make a freshly created object visible. Anything but
    /// `Creating → Active` is a `Bug`.
    pub fn activate(&self, world: &World, obj: &SharedObject) -> Result<()> {
        let h = obj.ptr(world)?;
        let prev = unsafe {
            (*h).state.compare_exchange(
                ObjectState::Creating as u32,
                ObjectState::Active as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
        };
        match prev {
            Ok(_) => Ok(()),
            Err(was) => {
                tracing::error!(state = was, "activate on non-creating object");
                Err(WorldError::Bug(format!("activate in state {was}")))
            }
        }
    }

    /// Take a local reference on `obj`.
    pub fn ref_(&self, world: &World, obj: &SharedObject) -> Result<()> {
        unsafe { refs::raw_up(world, obj.refs_ptr(world)?, false) }
    }

    /// Drop a local reference. The last one anywhere starts teardown.
    pub fn unref(&self, world: &World, obj: &SharedObject) -> Result<()> {
        unsafe { refs::raw_down(world, obj.refs_ptr(world)?, false) }
    }

    /// Current combined reference count of `obj`.
    pub fn ref_stat(&self, world: &World, obj: &SharedObject) -> Result<i32> {
        unsafe { refs::raw_stat(obj.refs_ptr(world)?) }
    }

    /// Attach a local reaction to `obj`'s reactor. It also receives the
    /// terminal notification when the object dies.
    pub fn attach(
        &self,
        world: &World,
        obj: &SharedObject,
        f: impl FnMut(&[u8]) -> ReactionResult + Send + 'static,
    ) -> Result<Reaction> {
        obj.ptr(world)?;
        Reactor::from_ref(obj.reactor_ref()).attach(world, f)
    }

    /// Attach a global reaction to `obj`'s reactor.
    pub fn attach_global(
        &self,
        world: &World,
        obj: &SharedObject,
        index: u32,
        ctx: SharedRef,
    ) -> Result<Reaction> {
        obj.ptr(world)?;
        Reactor::from_ref(obj.reactor_ref()).attach_global(world, index, ctx)
    }

    /// Detach a reaction from `obj`'s reactor.
    pub fn detach(&self, world: &World, obj: &SharedObject, reaction: &Reaction) -> Result<()> {
        Reactor::from_ref(obj.reactor_ref()).detach(world, reaction)
    }

    /// Dispatch an application notification on `obj`'s reactor. Payload must
    /// fit the pool's configured notification size.
    pub fn dispatch(
        &self,
        world: &World,
        obj: &SharedObject,
        payload: &[u8],
        globals: &[GlobalReactionFn],
    ) -> Result<()> {
        let d = self.ptr(world)?;
        if payload.len() > unsafe { (*d).notification_size } as usize {
            return Err(WorldError::Invalid("notification payload too large"));
        }
        let h = obj.ptr(world)?;
        let idle = Reactor::from_ref(obj.reactor_ref()).dispatch(world, payload, globals)?;
        if idle
            && unsafe { (*h).state.load(Ordering::Acquire) } == ObjectState::Zombie as u32
        {
            self.teardown_call(world)?
                .execute(world, CALL_ONEWAY, obj.header.offset as i32, &[])?;
        }
        Ok(())
    }

    /// Visit every `Active` and `Zombie` object under the pool lock. `cb`
    /// returning `false` stops the walk early.
    pub fn enumerate(
        &self,
        world: &World,
        mut cb: impl FnMut(&SharedObject) -> bool,
    ) -> Result<()> {
        let d = self.ptr(world)?;
        unsafe {
            skirmish::raw_prevail_recovering(addr_of_mut!((*d).lock), world.participant_id())?;
            let r = (|| {
                let mut off = (*d).first;
                while off != 0 {
                    let obj = SharedObject {
                        header: SharedRef {
                            pool: self.data.pool,
                            offset: off,
                        },
                    };
                    let h = world.translate(obj.header, size_of::<ObjectHeader>())?
                        as *mut ObjectHeader;
                    let state = (*h).state.load(Ordering::Acquire);
                    if state == ObjectState::Active as u32
                        || state == ObjectState::Zombie as u32
                    {
                        if !cb(&obj) {
                            break;
                        }
                    }
                    off = (*h).next;
                }
                Ok(())
            })();
            skirmish::raw_dismiss(addr_of_mut!((*d).lock))?;
            r
        }
    }

    /// Objects that can still be created before the limit is hit.
    pub fn free_count(&self, world: &World) -> Result<u32> {
        let d = self.ptr(world)?;
        unsafe {
            skirmish::raw_prevail_recovering(addr_of_mut!((*d).lock), world.participant_id())?;
            let free = (*d).limit - (*d).count;
            skirmish::raw_dismiss(addr_of_mut!((*d).lock))?;
            Ok(free)
        }
    }

    /// Tear the pool down. `Busy` while any object is `Creating` or
    /// `Active`; remaining zombies are finalized first.
    pub fn destroy(&self, world: &World) -> Result<()> {
        let d = self.ptr(world)?;
        let me = world.participant_id();

        let zombies = unsafe {
            skirmish::raw_prevail_recovering(addr_of_mut!((*d).lock), me)?;
            let r = (|| {
                let mut zombies = Vec::new();
                let mut off = (*d).first;
                while off != 0 {
                    let h = world.translate(
                        SharedRef {
                            pool: self.data.pool,
                            offset: off,
                        },
                        size_of::<ObjectHeader>(),
                    )? as *mut ObjectHeader;
                    match (*h).state.load(Ordering::Acquire) {
                        s if s == ObjectState::Zombie as u32 => zombies.push(off),
                        s if s == ObjectState::Destroyed as u32 => {}
                        _ => return Err(WorldError::Busy),
                    }
                    off = (*h).next;
                }
                Ok(zombies)
            })();
            skirmish::raw_dismiss(addr_of_mut!((*d).lock))?;
            r?
        };

        let call = self.teardown_call(world)?;
        for off in zombies {
            call.execute(world, CALL_ONEWAY, off as i32, &[])?;
        }

        unsafe {
            skirmish::raw_prevail_recovering(addr_of_mut!((*d).lock), me)?;
            let r = if (*d).count != 0 {
                Err(WorldError::Busy)
            } else {
                (*d).magic = OBJ_POOL_DEAD;
                Ok(())
            };
            skirmish::raw_dismiss(addr_of_mut!((*d).lock))?;
            r?;
        }

        call.destroy(world)?;
        let shm = SharedPool::from_id(self.data.pool);
        shm.free(world, call.shared_ref())?;
        shm.free(world, self.data)?;
        tracing::debug!("object pool destroyed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Teardown machinery
// ---------------------------------------------------------------------------

/// One step of the teardown protocol, running in the pool owner (as the
/// handler of the pool call). The first step sends the terminal
/// notification; the object is finalized as soon as its reactor is idle.
fn teardown_step(
    world: &World,
    pool_data: SharedRef,
    obj_offset: u32,
    globals: &'static [GlobalReactionFn],
    destructor: &mut (impl FnMut(&World, SharedObject) + Send + 'static),
) -> Result<()> {
    let d = world.translate(pool_data, size_of::<ObjectPoolData>())? as *mut ObjectPoolData;
    let obj = SharedObject {
        header: SharedRef {
            pool: pool_data.pool,
            offset: obj_offset,
        },
    };
    let h = world.translate(obj.header, size_of::<ObjectHeader>())? as *mut ObjectHeader;
    unsafe {
        if (*h).magic != OBJ_MAGIC
            || (*h).state.load(Ordering::Acquire) == ObjectState::Destroyed as u32
        {
            return Ok(());
        }

        let first_step = (*h)
            .terminal_sent
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if first_step {
            (*h).state.store(ObjectState::Zombie as u32, Ordering::Release);
            let notice = ObjectNotice {
                id: (*h).id,
                state: ObjectState::Destroyed as u32,
            };
            let idle = Reactor::from_ref(obj.reactor_ref())
                .dispatch(world, &notice.encode(), globals)?;
            if !idle {
                world.watch_zombie(obj.header);
                tracing::trace!(id = (*h).id, "object lingering as zombie");
                return Ok(());
            }
        }
        let r = finalize(world, d, obj, destructor);
        world.unwatch_zombie(obj.header);
        r
    }
}

/// Remove a zombie from the live list, run its destructor and free its
/// storage. Exactly one caller gets past the state transition.
unsafe fn finalize(
    world: &World,
    d: *mut ObjectPoolData,
    obj: SharedObject,
    destructor: &mut (impl FnMut(&World, SharedObject) + Send + 'static),
) -> Result<()> {
    let h = world.translate(obj.header, size_of::<ObjectHeader>())? as *mut ObjectHeader;

    skirmish::raw_prevail_recovering(addr_of_mut!((*d).lock), world.participant_id())?;
    let unlinked = (|| {
        let prev = (*h).state.swap(ObjectState::Destroyed as u32, Ordering::AcqRel);
        if prev == ObjectState::Destroyed as u32 {
            return Ok(false);
        }
        // Unlink from the singly linked live list.
        let mut cur = (*d).first;
        let mut prev_off = 0u32;
        while cur != 0 {
            if cur == obj.header.offset {
                let nxt = (*h).next;
                if prev_off == 0 {
                    (*d).first = nxt;
                } else {
                    let p = world.translate(
                        SharedRef {
                            pool: obj.header.pool,
                            offset: prev_off,
                        },
                        size_of::<ObjectHeader>(),
                    )? as *mut ObjectHeader;
                    (*p).next = nxt;
                }
                (*d).count -= 1;
                return Ok(true);
            }
            let c = world.translate(
                SharedRef {
                    pool: obj.header.pool,
                    offset: cur,
                },
                size_of::<ObjectHeader>(),
            )? as *mut ObjectHeader;
            prev_off = cur;
            cur = (*c).next;
        }
        tracing::error!(offset = obj.header.offset, "zombie not on the live list");
        Err(WorldError::Bug("object missing from live list".into()))
    })();
    skirmish::raw_dismiss(addr_of_mut!((*d).lock))?;

    if !unlinked? {
        return Ok(());
    }

    let id = (*h).id;
    destructor(world, obj);
    match Reactor::from_ref(obj.reactor_ref()).destroy(world) {
        Ok(()) | Err(WorldError::Destroyed) => {}
        Err(e) => return Err(e),
    }
    (*h).magic = 0;
    SharedPool::from_id(obj.header.pool).free(world, obj.header)?;
    tracing::trace!(id, "object destroyed");
    Ok(())
}

/// Walk this participant's zombie watch list: discount notifications queued
/// to listeners that have since died, and re-fire the teardown call for any
/// object whose reactor that left idle. Called from `World::process_pending`.
pub(crate) fn sweep_zombies(world: &World) -> Result<()> {
    for header in world.zombie_watches() {
        let h = match world.translate(header, size_of::<ObjectHeader>()) {
            Ok(p) => p as *mut ObjectHeader,
            Err(_) => {
                world.unwatch_zombie(header);
                continue;
            }
        };
        unsafe {
            if (*h).magic != OBJ_MAGIC
                || (*h).state.load(Ordering::Acquire) != ObjectState::Zombie as u32
            {
                world.unwatch_zombie(header);
                continue;
            }
            let obj = SharedObject { header };
            if Reactor::from_ref(obj.reactor_ref()).reap_dead(world)? {
                let pool_data = SharedRef {
                    pool: header.pool,
                    offset: (*h).pool_offset,
                };
                ObjectPool::from_ref(pool_data)
                    .teardown_call(world)?
                    .execute(world, CALL_ONEWAY, header.offset as i32, &[])?;
            }
        }
    }
    Ok(())
}

/// Called when a notification delivery left a reactor idle: if that reactor
/// belongs to a zombie object, re-fire the pool's teardown call so the owner
/// finalizes it.
pub(crate) fn note_reactor_idle(world: &World, reactor: SharedRef) -> Result<()> {
    let rel = offset_of!(ObjectHeader, reactor) as u32;
    if reactor.offset < rel {
        return Ok(());
    }
    let header = SharedRef {
        pool: reactor.pool,
        offset: reactor.offset - rel,
    };
    let h = match world.translate(header, size_of::<ObjectHeader>()) {
        Ok(p) => p as *mut ObjectHeader,
        Err(_) => return Ok(()),
    };
    unsafe {
        if (*h).magic != OBJ_MAGIC
            || (*h).state.load(Ordering::Acquire) != ObjectState::Zombie as u32
        {
            return Ok(());
        }
        let pool_data = SharedRef {
            pool: header.pool,
            offset: (*h).pool_offset,
        };
        ObjectPool::from_ref(pool_data)
            .teardown_call(world)?
            .execute(world, CALL_ONEWAY, header.offset as i32, &[])
            .map(|_| ())
    }
}
