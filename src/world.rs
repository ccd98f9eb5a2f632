// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// The world — one multi-process coordination session.
//
// A world is a named shared memory segment holding the participant table,
// the named-field registry and the shared-pool directory, all guarded by a
// robust world lock. One process creates the world (the master); others
// join it. Everything else in the crate hangs off a `World` value: pool
// translation caches, the local reaction/handler slabs, and this
// participant's mailbox draining.
//
// Participant liveness is pid-based: a slot whose pid no longer exists is
// considered free and may be reclaimed by a joiner. A stale world (master
// dead) found during create is unlinked and rebuilt.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::call::{self, CallHandler, CallRequest, CallResult, RetainedCall};
use crate::error::{Result, WorldError};
use crate::mailbox::{MailRing, Message};
use crate::object;
use crate::platform::{self, LockAcquire, RawCond, RawMutex, Segment, SegmentMode};
use crate::reactor::{self, ReactionFn, ReactionResult, SharedReaction};
use crate::shm_name;
use crate::shm_pool::{self, SharedPool, SharedRef};
use crate::{copy_name, name_str};

/// Length of names in shm tables (registry fields, pools), nul included.
pub(crate) const NAME_LEN: usize = 64;

/// Participant slots per world.
pub const MAX_PARTICIPANTS: usize = 64;

const MAX_FIELDS: usize = 32;
const MAX_POOLS: usize = 16;

const WORLD_MAGIC: u32 = 0x574f_524c; // "WORL"

/// How long a joiner waits for a world segment that exists but is still
/// being initialised.
const JOIN_SPIN_MS: u64 = 2000;

/// Cap on blocking for a slot in a full mailbox.
const POST_TIMEOUT_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct ParticipantEntry {
    /// Slot index + 1, 0 = free.
    id: u32,
    pid: i32,
    lock: RawMutex,
    cond: RawCond,
    mailbox: MailRing,
}

#[repr(C)]
struct FieldEntry {
    used: u32,
    pool: u32,
    offset: u32,
    name: [u8; NAME_LEN],
}

#[repr(C)]
struct PoolDirEntry {
    /// Pool id, 0 = free.
    id: u32,
    size: u32,
    name: [u8; NAME_LEN],
}

#[repr(C)]
struct WorldHeader {
    magic: u32,
    session: u32,
    master_pid: i32,
    alive: u32,
    next_serial: AtomicU32,
    next_pool_id: u32,
    default_pool: u32,
    lock: RawMutex,
    fields: [FieldEntry; MAX_FIELDS],
    pools: [PoolDirEntry; MAX_POOLS],
    participants: [ParticipantEntry; MAX_PARTICIPANTS],
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Bootstrap parameters for creating or joining a world.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Session id, part of every segment name. Processes meet by agreeing
    /// on it.
    pub session: u32,
    /// File-backed segments under this directory instead of POSIX shm.
    /// `platform::largest_tmpfs()` picks a sensible default directory.
    pub backing_dir: Option<PathBuf>,
    /// Byte size of the default shared pool, created with the world.
    pub pool_size: usize,
    /// Per-object-pool live object limit.
    pub object_limit: u32,
    /// Deadline for blocking call execution; `None` waits indefinitely.
    pub call_timeout_ms: Option<u64>,
}

impl WorldConfig {
    pub fn new(session: u32) -> Self {
        Self {
            session,
            backing_dir: None,
            pool_size: 1 << 20,
            object_limit: 1024,
            call_timeout_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Process-local state
// ---------------------------------------------------------------------------

type SharedHandler = Arc<Mutex<CallHandler>>;

#[derive(Default)]
struct LocalState {
    reactions: Mutex<Slab<SharedReaction>>,
    handlers: Mutex<Slab<SharedHandler>>,
    retained: Mutex<HashMap<u32, RetainedCall>>,
    replies: Mutex<HashMap<u32, (u32, i32)>>,
    parked: Mutex<VecDeque<Message>>,
    /// Zombie objects this participant owes a finalization, swept by
    /// `process_pending` so a dead listener cannot wedge them.
    zombies: Mutex<Vec<SharedRef>>,
}

fn lock_mx<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One process's connection to a world session.
pub struct World {
    cfg: WorldConfig,
    segment: Segment,
    participant: u32,
    is_master: bool,
    mappings: Mutex<HashMap<u32, Arc<Segment>>>,
    local: LocalState,
}

impl World {
    // -- bootstrap ---------------------------------------------------------

    /// Create the world for `cfg.session` and become its master
    /// (participant 1). A leftover world whose master died is unlinked and
    /// rebuilt; a live one fails with `Init`.
    pub fn create(cfg: WorldConfig) -> Result<Self> {
        let name = shm_name::world_segment(cfg.session);
        let dir = cfg.backing_dir.clone();

        let segment = match Segment::acquire(
            &name,
            size_of::<WorldHeader>(),
            SegmentMode::Create,
            dir.as_deref(),
        ) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Self::reclaim_stale(&name, dir.as_deref())?;
                Segment::acquire(
                    &name,
                    size_of::<WorldHeader>(),
                    SegmentMode::Create,
                    dir.as_deref(),
                )
                .map_err(|e| WorldError::Init(format!("world segment {name}: {e}")))?
            }
            Err(e) => return Err(WorldError::Init(format!("world segment {name}: {e}"))),
        };

        let h = segment.as_mut_ptr() as *mut WorldHeader;
        unsafe {
            platform::mutex_init(addr_of_mut!((*h).lock))?;
            (*h).session = cfg.session;
            (*h).master_pid = platform::posix::current_pid();
            (*h).alive = 1;
            (*h).next_serial = AtomicU32::new(0);
            (*h).next_pool_id = 0;
            (*h).default_pool = 0;

            // Claim slot 0 as participant 1 (the master).
            let e = addr_of_mut!((*h).participants) as *mut ParticipantEntry;
            platform::mutex_init(addr_of_mut!((*e).lock))?;
            platform::cond_init(addr_of_mut!((*e).cond))?;
            (*e).pid = platform::posix::current_pid();
            (*e).mailbox.reset();
            (*e).id = 1;

            std::sync::atomic::fence(Ordering::Release);
            (*h).magic = WORLD_MAGIC;
        }

        let world = Self {
            cfg,
            segment,
            participant: 1,
            is_master: true,
            mappings: Mutex::new(HashMap::new()),
            local: LocalState::default(),
        };

        let pool = SharedPool::create(&world, "default", world.cfg.pool_size)?;
        unsafe { (*world.hdr()).default_pool = pool.id() };

        tracing::debug!(session = world.cfg.session, "world created");
        Ok(world)
    }

    /// If a world segment exists but its master is gone, remove it so
    /// create can start over. A live world is an `Init` error.
    fn reclaim_stale(name: &str, dir: Option<&Path>) -> Result<()> {
        match Segment::acquire(name, size_of::<WorldHeader>(), SegmentMode::Open, dir) {
            Ok(seg) => {
                let h = seg.as_mut_ptr() as *mut WorldHeader;
                let (magic, master) = unsafe { ((*h).magic, (*h).master_pid) };
                if magic == WORLD_MAGIC && platform::pid_alive(master) {
                    return Err(WorldError::Init(format!("world {name} already running")));
                }
                tracing::warn!(name, master, "unlinking stale world");
                seg.unlink();
                Ok(())
            }
            // Gone between our create attempt and now — fine.
            Err(_) => {
                Segment::unlink_by_name(name, dir);
                Ok(())
            }
        }
    }

    /// Join the world for `cfg.session` as a new participant.
    pub fn join(cfg: WorldConfig) -> Result<Self> {
        let pid = platform::posix::current_pid();
        Self::join_as(cfg, pid)
    }

    /// Join while registering an explicit pid for the new participant.
    /// A pid that never comes alive makes the participant appear dead,
    /// which is how tests simulate crashed processes.
    pub fn join_as(cfg: WorldConfig, pid: i32) -> Result<Self> {
        let name = shm_name::world_segment(cfg.session);
        let segment = Segment::acquire(
            &name,
            size_of::<WorldHeader>(),
            SegmentMode::Open,
            cfg.backing_dir.as_deref(),
        )
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => WorldError::NotFound(format!("world {}", cfg.session)),
            _ => WorldError::Init(format!("world segment {name}: {e}")),
        })?;

        let h = segment.as_mut_ptr() as *mut WorldHeader;

        // The creator publishes the magic last; wait it out briefly.
        let deadline = Instant::now() + Duration::from_millis(JOIN_SPIN_MS);
        while unsafe { (*h).magic } != WORLD_MAGIC {
            if Instant::now() >= deadline {
                return Err(WorldError::NotFound(format!(
                    "world {} never initialised",
                    cfg.session
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let (alive, master) = unsafe { ((*h).alive, (*h).master_pid) };
        if alive == 0 || !platform::pid_alive(master) {
            return Err(WorldError::NotFound(format!(
                "world {} is not alive",
                cfg.session
            )));
        }

        let mut world = Self {
            cfg,
            segment,
            participant: 0,
            is_master: false,
            mappings: Mutex::new(HashMap::new()),
            local: LocalState::default(),
        };
        world.participant = world.claim_slot(pid)?;
        tracing::debug!(
            session = world.cfg.session,
            participant = world.participant,
            "joined world"
        );
        Ok(world)
    }

    /// Claim a free (or reclaimable dead) participant slot.
    fn claim_slot(&self, pid: i32) -> Result<u32> {
        unsafe {
            self.world_lock()?;
            let r = (|| {
                let base = addr_of_mut!((*self.hdr()).participants) as *mut ParticipantEntry;
                for idx in 0..MAX_PARTICIPANTS {
                    let e = base.add(idx);
                    if (*e).id != 0 && platform::pid_alive((*e).pid) {
                        continue;
                    }
                    if (*e).id != 0 {
                        tracing::warn!(
                            participant = (*e).id,
                            pid = (*e).pid,
                            "reclaiming slot of dead participant"
                        );
                    }
                    platform::mutex_init(addr_of_mut!((*e).lock))?;
                    platform::cond_init(addr_of_mut!((*e).cond))?;
                    (*e).pid = pid;
                    (*e).mailbox.reset();
                    (*e).id = idx as u32 + 1;
                    return Ok(idx as u32 + 1);
                }
                Err(WorldError::OutOfMemory)
            })();
            self.world_unlock()?;
            r
        }
    }

    /// Give up this participant slot and drop all pool mappings. Also runs
    /// on `Drop`.
    pub fn leave(&mut self) -> Result<()> {
        if self.participant == 0 {
            return Ok(());
        }
        unsafe {
            self.world_lock()?;
            let e = self.entry(self.participant);
            if !e.is_null() {
                (*e).id = 0;
            }
            self.world_unlock()?;
        }
        tracing::debug!(participant = self.participant, "left world");
        self.participant = 0;
        lock_mx(&self.mappings).clear();
        Ok(())
    }

    /// Tear the whole session down (master only): mark the world dead, wake
    /// everyone, unlink every segment. Joined participants see `NotFound` /
    /// `Destroyed` from then on.
    pub fn destroy(mut self) -> Result<()> {
        if !self.is_master {
            return Err(WorldError::Invalid("destroy is master-only"));
        }
        unsafe {
            let h = self.hdr();
            (*h).alive = 0;
            let base = addr_of_mut!((*h).participants) as *mut ParticipantEntry;
            for idx in 0..MAX_PARTICIPANTS {
                let e = base.add(idx);
                if (*e).id != 0 {
                    let _ = platform::cond_broadcast(addr_of_mut!((*e).cond));
                }
            }
            self.world_lock()?;
            let pools = addr_of_mut!((*h).pools) as *mut PoolDirEntry;
            for idx in 0..MAX_POOLS {
                let p = pools.add(idx);
                if (*p).id != 0 {
                    Segment::unlink_by_name(
                        &shm_name::pool_segment(self.cfg.session, (*p).id),
                        self.cfg.backing_dir.as_deref(),
                    );
                    (*p).id = 0;
                }
            }
            self.world_unlock()?;
        }
        self.segment.unlink();
        tracing::debug!(session = self.cfg.session, "world destroyed");
        self.leave()
    }

    // -- accessors ---------------------------------------------------------

    fn hdr(&self) -> *mut WorldHeader {
        self.segment.as_mut_ptr() as *mut WorldHeader
    }

    pub fn session(&self) -> u32 {
        self.cfg.session
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// This process's participant id (1-based).
    pub fn participant_id(&self) -> u32 {
        self.participant
    }

    pub(crate) fn backing_dir(&self) -> Option<&Path> {
        self.cfg.backing_dir.as_deref()
    }

    pub(crate) fn object_limit(&self) -> u32 {
        self.cfg.object_limit
    }

    /// The pool created alongside the world.
    pub fn default_pool(&self) -> SharedPool {
        SharedPool::from_id(unsafe { (*self.hdr()).default_pool })
    }

    /// Next world-unique serial.
    pub(crate) fn next_serial(&self) -> u32 {
        unsafe { (*self.hdr()).next_serial.fetch_add(1, Ordering::AcqRel) + 1 }
    }

    unsafe fn world_lock(&self) -> Result<()> {
        if let LockAcquire::Recovered =
            platform::mutex_lock(addr_of_mut!((*self.hdr()).lock), None)?
        {
            // Tables are re-validated by pid liveness; keep going.
            tracing::warn!("world lock holder died, recovered");
        }
        Ok(())
    }

    unsafe fn world_unlock(&self) -> Result<()> {
        platform::mutex_unlock(addr_of_mut!((*self.hdr()).lock))
    }

    /// Raw participant entry, null for out-of-range ids.
    fn entry(&self, id: u32) -> *mut ParticipantEntry {
        if id == 0 || id as usize > MAX_PARTICIPANTS {
            return std::ptr::null_mut();
        }
        unsafe {
            let base = addr_of_mut!((*self.hdr()).participants) as *mut ParticipantEntry;
            base.add(id as usize - 1)
        }
    }

    /// Whether a participant id refers to a live, registered process.
    pub fn participant_alive(&self, id: u32) -> bool {
        let e = self.entry(id);
        if e.is_null() {
            return false;
        }
        unsafe { (*e).id == id && platform::pid_alive((*e).pid) }
    }

    // -- registry ----------------------------------------------------------

    /// Publish a named field (master only, once per name).
    pub fn publish(&self, name: &str, value: SharedRef) -> Result<()> {
        if !self.is_master {
            return Err(WorldError::Invalid("publish is master-only"));
        }
        if name.len() >= NAME_LEN {
            return Err(WorldError::Invalid("field name too long"));
        }
        unsafe {
            self.world_lock()?;
            let r = (|| {
                let base = addr_of_mut!((*self.hdr()).fields) as *mut FieldEntry;
                let mut free = None;
                for idx in 0..MAX_FIELDS {
                    let f = base.add(idx);
                    if (*f).used != 0 {
                        if name_str(&(*f).name) == name {
                            return Err(WorldError::Busy);
                        }
                    } else if free.is_none() {
                        free = Some(f);
                    }
                }
                let f = free.ok_or(WorldError::OutOfMemory)?;
                (*f).pool = value.pool;
                (*f).offset = value.offset;
                copy_name(&mut (*f).name, name);
                (*f).used = 1;
                Ok(())
            })();
            self.world_unlock()?;
            r
        }
    }

    /// Look up a published field.
    pub fn lookup(&self, name: &str) -> Result<SharedRef> {
        unsafe {
            self.world_lock()?;
            let r = (|| {
                let base = addr_of_mut!((*self.hdr()).fields) as *mut FieldEntry;
                for idx in 0..MAX_FIELDS {
                    let f = base.add(idx);
                    if (*f).used != 0 && name_str(&(*f).name) == name {
                        return Ok(SharedRef {
                            pool: (*f).pool,
                            offset: (*f).offset,
                        });
                    }
                }
                Err(WorldError::NotFound(format!("field {name}")))
            })();
            self.world_unlock()?;
            r
        }
    }

    // -- pool directory and translation ------------------------------------

    /// Allocate a directory entry for a new pool. Any participant may
    /// create pools.
    pub(crate) fn register_pool(&self, name: &str, size: usize) -> Result<u32> {
        unsafe {
            self.world_lock()?;
            let r = (|| {
                let h = self.hdr();
                let base = addr_of_mut!((*h).pools) as *mut PoolDirEntry;
                let slot = (0..MAX_POOLS)
                    .map(|i| base.add(i))
                    .find(|p| (**p).id == 0)
                    .ok_or(WorldError::OutOfMemory)?;
                (*h).next_pool_id += 1;
                (*slot).id = (*h).next_pool_id;
                (*slot).size = size as u32;
                copy_name(&mut (*slot).name, name);
                Ok((*slot).id)
            })();
            self.world_unlock()?;
            r
        }
    }

    pub(crate) fn unregister_pool(&self, id: u32) -> Result<()> {
        unsafe {
            self.world_lock()?;
            let base = addr_of_mut!((*self.hdr()).pools) as *mut PoolDirEntry;
            for idx in 0..MAX_POOLS {
                let p = base.add(idx);
                if (*p).id == id {
                    (*p).id = 0;
                    break;
                }
            }
            self.world_unlock()?;
        }
        Ok(())
    }

    /// Directory size of a registered pool.
    fn pool_dir_size(&self, id: u32) -> Result<usize> {
        unsafe {
            self.world_lock()?;
            let r = (|| {
                let base = addr_of_mut!((*self.hdr()).pools) as *mut PoolDirEntry;
                for idx in 0..MAX_POOLS {
                    let p = base.add(idx);
                    if (*p).id == id {
                        return Ok((*p).size as usize);
                    }
                }
                Err(WorldError::NotFound(format!("pool {id}")))
            })();
            self.world_unlock()?;
            r
        }
    }

    /// Keep a freshly created pool segment mapped.
    pub(crate) fn adopt_mapping(&self, id: u32, segment: Segment) {
        lock_mx(&self.mappings).insert(id, Arc::new(segment));
    }

    pub(crate) fn drop_mapping(&self, id: u32) -> Result<()> {
        lock_mx(&self.mappings).remove(&id);
        Ok(())
    }

    /// Base pointer and size of a pool's mapping, attaching on first touch.
    pub(crate) fn pool_base(&self, id: u32) -> Result<(*mut u8, usize)> {
        if let Some(seg) = lock_mx(&self.mappings).get(&id) {
            return Ok((seg.as_mut_ptr(), seg.user_size()));
        }

        let size = self.pool_dir_size(id)?;
        let seg_name = shm_name::pool_segment(self.cfg.session, id);
        let segment = Segment::acquire(
            &seg_name,
            size,
            SegmentMode::Open,
            self.cfg.backing_dir.as_deref(),
        )
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => WorldError::NotFound(format!("pool {id}")),
            _ => WorldError::Init(format!("pool segment {seg_name}: {e}")),
        })?;
        shm_pool::check_header(segment.as_mut_ptr(), id)?;

        let mut map = lock_mx(&self.mappings);
        let seg = map.entry(id).or_insert_with(|| Arc::new(segment));
        Ok((seg.as_mut_ptr(), seg.user_size()))
    }

    /// Current map count of a pool segment (all processes).
    pub(crate) fn pool_map_count(&self, id: u32) -> Result<i32> {
        self.pool_base(id)?;
        let map = lock_mx(&self.mappings);
        let seg = map
            .get(&id)
            .ok_or_else(|| WorldError::NotFound(format!("pool {id}")))?;
        Ok(seg.ref_count())
    }

    /// Turn a shared reference into a local pointer, checking that
    /// `[offset, offset + len)` lies inside the pool.
    pub fn translate(&self, r: SharedRef, len: usize) -> Result<*mut u8> {
        if r.is_null() {
            return Err(WorldError::Invalid("null shared ref"));
        }
        let (base, size) = self.pool_base(r.pool)?;
        let end = r.offset as usize + len;
        if end > size {
            return Err(WorldError::Bug(format!(
                "ref {}+{len} outside pool {} ({size} bytes)",
                r.offset, r.pool
            )));
        }
        Ok(unsafe { base.add(r.offset as usize) })
    }

    // -- local callback tables ---------------------------------------------

    pub(crate) fn register_reaction(&self, f: ReactionFn) -> usize {
        lock_mx(&self.local.reactions).insert(Arc::new(Mutex::new(f)))
    }

    pub(crate) fn remove_reaction(&self, key: usize) {
        let _ = lock_mx(&self.local.reactions).try_remove(key);
    }

    /// Run a local reaction. `None` when the closure is gone (detached).
    pub(crate) fn run_reaction(&self, key: usize, payload: &[u8]) -> Option<ReactionResult> {
        let arc = lock_mx(&self.local.reactions).get(key).cloned()?;
        let mut f = lock_mx(&arc);
        Some((f)(payload))
    }

    pub(crate) fn register_handler(&self, f: CallHandler) -> usize {
        lock_mx(&self.local.handlers).insert(Arc::new(Mutex::new(f)))
    }

    pub(crate) fn remove_handler(&self, key: usize) {
        let _ = lock_mx(&self.local.handlers).try_remove(key);
    }

    pub(crate) fn run_handler(&self, key: usize, req: CallRequest) -> Option<CallResult> {
        let arc = lock_mx(&self.local.handlers).get(key).cloned()?;
        let mut f = lock_mx(&arc);
        Some((f)(self, req))
    }

    pub(crate) fn retain_call(&self, serial: u32, retained: RetainedCall) {
        lock_mx(&self.local.retained).insert(serial, retained);
    }

    pub(crate) fn take_retained(&self, serial: u32) -> Option<RetainedCall> {
        lock_mx(&self.local.retained).remove(&serial)
    }

    pub(crate) fn watch_zombie(&self, header: SharedRef) {
        let mut z = lock_mx(&self.local.zombies);
        if !z.contains(&header) {
            z.push(header);
        }
    }

    pub(crate) fn unwatch_zombie(&self, header: SharedRef) {
        lock_mx(&self.local.zombies).retain(|h| *h != header);
    }

    pub(crate) fn zombie_watches(&self) -> Vec<SharedRef> {
        lock_mx(&self.local.zombies).clone()
    }

    // -- mailbox traffic ---------------------------------------------------

    /// Post a message to a participant's mailbox, blocking (bounded) while
    /// the ring is full. `NotFound` for dead or unregistered targets.
    pub(crate) fn post(&self, target: u32, msg: &Message) -> Result<()> {
        let e = self.entry(target);
        if e.is_null() {
            return Err(WorldError::NotFound(format!("participant {target}")));
        }
        let deadline = Instant::now() + Duration::from_millis(POST_TIMEOUT_MS);
        unsafe {
            if let LockAcquire::Recovered = platform::mutex_lock(addr_of_mut!((*e).lock), None)? {
                tracing::warn!(target, "mailbox lock holder died, recovered");
            }
            let r = loop {
                if (*e).id != target || !platform::pid_alive((*e).pid) {
                    break Err(WorldError::NotFound(format!("participant {target}")));
                }
                if (*e).mailbox.push(msg) {
                    let _ = platform::cond_broadcast(addr_of_mut!((*e).cond));
                    break Ok(());
                }
                if Instant::now() >= deadline {
                    tracing::warn!(target, "mailbox full, post timed out");
                    break Err(WorldError::Timeout);
                }
                platform::cond_wait(addr_of_mut!((*e).cond), addr_of_mut!((*e).lock), Some(100))?;
            };
            platform::mutex_unlock(addr_of_mut!((*e).lock))?;
            r
        }
    }

    /// Drain this participant's own mailbox ring, optionally waiting up to
    /// `timeout_ms` for traffic to arrive.
    fn drain_own(&self, timeout_ms: Option<u64>) -> Result<Vec<Message>> {
        let e = self.entry(self.participant);
        if e.is_null() {
            return Err(WorldError::Invalid("not joined to a world"));
        }
        unsafe {
            if let LockAcquire::Recovered = platform::mutex_lock(addr_of_mut!((*e).lock), None)? {
                tracing::warn!("own mailbox lock recovered");
            }
            let mut msgs = (*e).mailbox.drain();
            if msgs.is_empty() {
                if let Some(ms) = timeout_ms {
                    if ms > 0 {
                        platform::cond_wait(
                            addr_of_mut!((*e).cond),
                            addr_of_mut!((*e).lock),
                            Some(ms),
                        )?;
                        msgs = (*e).mailbox.drain();
                    }
                }
            }
            if !msgs.is_empty() {
                // Wake anyone blocked on a full ring.
                let _ = platform::cond_broadcast(addr_of_mut!((*e).cond));
            }
            platform::mutex_unlock(addr_of_mut!((*e).lock))?;
            Ok(msgs)
        }
    }

    /// Record a reply and wake this process's blocked callers.
    pub(crate) fn deliver_reply(&self, serial: u32, status: u32, value: i32) {
        lock_mx(&self.local.replies).insert(serial, (status, value));
        let e = self.entry(self.participant);
        if !e.is_null() {
            unsafe {
                let _ = platform::cond_broadcast(addr_of_mut!((*e).cond));
            }
        }
    }

    /// Block until the reply for `serial` arrives, draining our own mailbox
    /// meanwhile. Non-reply traffic is parked for `process_pending`. A dead
    /// `owner` yields `Destroyed`; the configured call deadline `Timeout`.
    pub(crate) fn wait_reply(&self, serial: u32, owner: u32) -> Result<(u32, i32)> {
        let deadline = self
            .cfg
            .call_timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        loop {
            if let Some(reply) = lock_mx(&self.local.replies).remove(&serial) {
                return Ok(reply);
            }

            for msg in self.drain_own(Some(50))? {
                match msg {
                    Message::CallReply {
                        serial: s,
                        status,
                        value,
                    } => {
                        lock_mx(&self.local.replies).insert(s, (status, value));
                    }
                    other => lock_mx(&self.local.parked).push_back(other),
                }
            }

            if let Some(reply) = lock_mx(&self.local.replies).remove(&serial) {
                return Ok(reply);
            }
            if owner != self.participant && !self.participant_alive(owner) {
                tracing::warn!(owner, serial, "call owner died while awaited");
                return Err(WorldError::Destroyed);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(WorldError::Timeout);
                }
            }
        }
    }

    /// Drain and handle this participant's pending traffic: notifications go
    /// to local reactions, call requests to their handlers, replies to
    /// blocked callers. Waits up to `timeout_ms` when nothing is queued
    /// (`None` = poll). Returns the number of messages handled.
    pub fn process_pending(&self, timeout_ms: Option<u64>) -> Result<usize> {
        let mut msgs: Vec<Message> = lock_mx(&self.local.parked).drain(..).collect();
        if msgs.is_empty() {
            msgs = self.drain_own(timeout_ms)?;
        } else {
            msgs.extend(self.drain_own(None)?);
        }

        let mut handled = 0;
        for msg in msgs {
            handled += 1;
            match msg {
                Message::Notification { reactor, payload } => {
                    let idle = reactor::deliver_local(self, reactor, &payload)?;
                    if idle {
                        object::note_reactor_idle(self, reactor)?;
                    }
                }
                Message::CallRequest {
                    call: c,
                    serial,
                    caller,
                    flags,
                    arg,
                    payload,
                } => {
                    call::handle_request(self, c, serial, caller, flags, arg, payload)?;
                }
                Message::CallReply {
                    serial,
                    status,
                    value,
                } => {
                    self.deliver_reply(serial, status, value);
                }
            }
        }

        // A listener may have died with its terminal notification still
        // queued; discount it so the zombies it was holding up finalize.
        object::sweep_zombies(self)?;
        Ok(handled)
    }
}

impl Drop for World {
    fn drop(&mut self) {
        if self.participant != 0 {
            if let Err(err) = self.leave() {
                tracing::error!(%err, "leaving world on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("session", &self.cfg.session)
            .field("participant", &self.participant)
            .field("is_master", &self.is_master)
            .finish()
    }
}
