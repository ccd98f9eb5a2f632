// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Shared pools — named, size-bounded heaps inside a world's shared memory.
//
// Allocations are addressed by (pool id, offset) pairs, never by raw
// pointers; each process translates an offset against its own mapping of
// the pool segment, attaching on first touch. The allocator is a first-fit
// free list with split-on-allocate and coalesce-on-free, serialized by the
// pool's embedded skirmish so any attached process may allocate.
//
// Shared-memory layout of one pool segment:
//
//   [ PoolHeader ]            ← magic, free list head, embedded skirmish
//   [ heap bytes ]            ← block-headed allocations
//
// Each block: 8-byte header { payload size, tag } followed by the payload.
// Free blocks keep the offset of the next free block in their first
// payload word; the free list is sorted by offset so adjacent free blocks
// can be merged.

use std::ptr::addr_of_mut;

use crate::error::{Result, WorldError};
use crate::platform::{Segment, SegmentMode};
use crate::skirmish::{self, SkirmishData};
use crate::world::{World, NAME_LEN};
use crate::{copy_name, name_str, shm_name};

pub(crate) const POOL_MAGIC: u32 = 0x504f_4f4c; // "POOL"
pub(crate) const POOL_DEAD: u32 = 0xdead_4f4c;

const BLOCK_HDR: usize = 8;
const MIN_ALLOC: usize = 8;
const TAG_USED: u32 = 0x5553_4544; // "USED"
const TAG_FREE: u32 = 0x4652_4545; // "FREE"

/// A cross-process "pointer": an offset into one shared pool.
///
/// Never dereferenced directly — translate through
/// [`World::translate`] in the process that wants a local pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedRef {
    pub pool: u32,
    pub offset: u32,
}

impl SharedRef {
    /// The null reference (no pool is ever numbered 0).
    pub const NULL: SharedRef = SharedRef { pool: 0, offset: 0 };

    pub fn is_null(&self) -> bool {
        self.pool == 0
    }
}

// ---------------------------------------------------------------------------
// Shared memory layout
// ---------------------------------------------------------------------------

#[repr(C)]
pub(crate) struct PoolHeader {
    pub(crate) magic: u32,
    id: u32,
    size: u32,
    free_head: u32, // block offset of first free block, 0 = none
    bytes_used: u32,
    name: [u8; NAME_LEN],
    lock: SkirmishData,
}

#[repr(C)]
struct BlockHeader {
    size: u32, // payload bytes
    tag: u32,  // TAG_USED | TAG_FREE
}

fn heap_start() -> u32 {
    let hdr = std::mem::size_of::<PoolHeader>();
    ((hdr + 15) / 16 * 16) as u32
}

fn align_alloc(size: usize) -> usize {
    ((size.max(MIN_ALLOC) + 7) / 8) * 8
}

// Block accessors. `base` is the pool segment base; offsets are block
// (header) offsets, payload begins BLOCK_HDR bytes later.

unsafe fn block(base: *mut u8, off: u32) -> *mut BlockHeader {
    base.add(off as usize) as *mut BlockHeader
}

unsafe fn next_free(base: *mut u8, off: u32) -> u32 {
    *(base.add(off as usize + BLOCK_HDR) as *const u32)
}

unsafe fn set_next_free(base: *mut u8, off: u32, next: u32) {
    *(base.add(off as usize + BLOCK_HDR) as *mut u32) = next;
}

// ---------------------------------------------------------------------------
// SharedPool
// ---------------------------------------------------------------------------

/// Handle to one shared pool. Cheap to copy; operations take the world so
/// offsets can be translated against the caller's own mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedPool {
    id: u32,
}

impl SharedPool {
    /// Create a named pool of `size` usable heap bytes and register it in
    /// the world's pool directory.
    pub fn create(world: &World, name: &str, size: usize) -> Result<Self> {
        if name.len() >= NAME_LEN {
            return Err(WorldError::Invalid("pool name too long"));
        }
        let min = heap_start() as usize + BLOCK_HDR + MIN_ALLOC;
        if size < min {
            return Err(WorldError::Invalid("pool size too small"));
        }

        let id = world.register_pool(name, size)?;
        let seg_name = shm_name::pool_segment(world.session(), id);
        let segment = Segment::acquire(
            &seg_name,
            size,
            SegmentMode::Create,
            world.backing_dir(),
        )
        .map_err(|e| WorldError::Init(format!("pool segment {seg_name}: {e}")))?;

        let base = segment.as_mut_ptr();
        unsafe {
            let hdr = base as *mut PoolHeader;
            (*hdr).id = id;
            (*hdr).size = size as u32;
            (*hdr).bytes_used = 0;
            copy_name(&mut (*hdr).name, name);
            skirmish::raw_init(addr_of_mut!((*hdr).lock))?;

            // One free block spanning the whole heap.
            let first = heap_start();
            let payload = size as u32 - first - BLOCK_HDR as u32;
            (*block(base, first)).size = payload;
            (*block(base, first)).tag = TAG_FREE;
            set_next_free(base, first, 0);
            (*hdr).free_head = first;

            // Publish the magic last so joiners never see a half-built pool.
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
            (*hdr).magic = POOL_MAGIC;
        }

        world.adopt_mapping(id, segment);
        tracing::debug!(pool = id, name, size, "shared pool created");
        Ok(Self { id })
    }

    /// Handle to an existing pool by directory id (e.g. from a registry
    /// lookup). The segment is mapped on first translate.
    pub fn from_id(id: u32) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Map the pool segment into this process now instead of on first touch.
    pub fn attach(&self, world: &World) -> Result<()> {
        world.pool_base(self.id).map(|_| ())
    }

    /// Drop this process's mapping. Later translates re-attach.
    pub fn detach(&self, world: &World) -> Result<()> {
        world.drop_mapping(self.id)
    }

    /// Pool name as recorded in the header.
    pub fn name(&self, world: &World) -> Result<String> {
        let (base, _) = world.pool_base(self.id)?;
        let hdr = base as *mut PoolHeader;
        Ok(unsafe { name_str(&(*hdr).name).to_owned() })
    }

    fn locked_header(&self, world: &World) -> Result<(*mut u8, *mut PoolHeader)> {
        let (base, _) = world.pool_base(self.id)?;
        let hdr = base as *mut PoolHeader;
        match unsafe { (*hdr).magic } {
            POOL_MAGIC => {}
            POOL_DEAD => return Err(WorldError::Destroyed),
            other => {
                return Err(WorldError::Bug(format!(
                    "pool {} magic {other:#x}",
                    self.id
                )))
            }
        }
        unsafe {
            skirmish::raw_prevail_recovering(addr_of_mut!((*hdr).lock), world.participant_id())?;
        }
        Ok((base, hdr))
    }

    /// Allocate `size` bytes. Safe under concurrent calls from any attached
    /// process. `OutOfMemory` when no free block fits.
    pub fn allocate(&self, world: &World, size: usize) -> Result<SharedRef> {
        if size == 0 {
            return Err(WorldError::Invalid("zero-size allocation"));
        }
        let want = align_alloc(size);
        let (base, hdr) = self.locked_header(world)?;

        unsafe {
            let mut prev: u32 = 0;
            let mut cur = (*hdr).free_head;
            while cur != 0 {
                let bsize = (*block(base, cur)).size as usize;
                if bsize >= want {
                    let after = next_free(base, cur);
                    let replacement = if bsize >= want + BLOCK_HDR + MIN_ALLOC {
                        // Split: remainder becomes a free block right after
                        // the allocation; sorted order is preserved.
                        let rem = cur + (BLOCK_HDR + want) as u32;
                        (*block(base, rem)).size = (bsize - want - BLOCK_HDR) as u32;
                        (*block(base, rem)).tag = TAG_FREE;
                        set_next_free(base, rem, after);
                        (*block(base, cur)).size = want as u32;
                        rem
                    } else {
                        after
                    };
                    if prev == 0 {
                        (*hdr).free_head = replacement;
                    } else {
                        set_next_free(base, prev, replacement);
                    }
                    (*block(base, cur)).tag = TAG_USED;
                    (*hdr).bytes_used += (*block(base, cur)).size + BLOCK_HDR as u32;

                    skirmish::raw_dismiss(addr_of_mut!((*hdr).lock))?;
                    return Ok(SharedRef {
                        pool: self.id,
                        offset: cur + BLOCK_HDR as u32,
                    });
                }
                prev = cur;
                cur = next_free(base, cur);
            }
            skirmish::raw_dismiss(addr_of_mut!((*hdr).lock))?;
        }
        tracing::warn!(pool = self.id, size, "shared pool exhausted");
        Err(WorldError::OutOfMemory)
    }

    /// Return an allocation to the pool. Freeing anything that is not a
    /// live allocation from this pool is a `Bug`.
    pub fn free(&self, world: &World, r: SharedRef) -> Result<()> {
        if r.pool != self.id {
            return Err(WorldError::Invalid("ref does not belong to this pool"));
        }
        if r.offset < heap_start() + BLOCK_HDR as u32 {
            return Err(WorldError::Invalid("ref below heap start"));
        }
        let (base, hdr) = self.locked_header(world)?;
        let blk = r.offset - BLOCK_HDR as u32;

        let result = unsafe {
            if blk >= (*hdr).size || (*block(base, blk)).tag != TAG_USED {
                tracing::error!(pool = self.id, offset = r.offset, "double or wild free");
                Err(WorldError::Bug(format!(
                    "free of non-allocated block at offset {}",
                    r.offset
                )))
            } else {
                (*hdr).bytes_used -= (*block(base, blk)).size + BLOCK_HDR as u32;
                (*block(base, blk)).tag = TAG_FREE;

                // Insert sorted by offset, then merge with neighbours.
                let mut prev: u32 = 0;
                let mut cur = (*hdr).free_head;
                while cur != 0 && cur < blk {
                    prev = cur;
                    cur = next_free(base, cur);
                }

                let mut merged = blk;
                if prev != 0
                    && prev + BLOCK_HDR as u32 + (*block(base, prev)).size == blk
                {
                    (*block(base, prev)).size += BLOCK_HDR as u32 + (*block(base, blk)).size;
                    merged = prev;
                } else {
                    set_next_free(base, blk, cur);
                    if prev == 0 {
                        (*hdr).free_head = blk;
                    } else {
                        set_next_free(base, prev, blk);
                    }
                }
                if cur != 0
                    && merged + BLOCK_HDR as u32 + (*block(base, merged)).size == cur
                {
                    (*block(base, merged)).size += BLOCK_HDR as u32 + (*block(base, cur)).size;
                    set_next_free(base, merged, next_free(base, cur));
                }
                Ok(())
            }
        };

        unsafe { skirmish::raw_dismiss(addr_of_mut!((*hdr).lock))? };
        result
    }

    /// Bytes currently handed out (payload + block headers).
    pub fn bytes_used(&self, world: &World) -> Result<usize> {
        let (base, _) = world.pool_base(self.id)?;
        let hdr = base as *mut PoolHeader;
        Ok(unsafe { (*hdr).bytes_used } as usize)
    }

    /// Tear the pool down. Refuses with `Busy` while any other process
    /// still maps the segment; the backing object is unlinked afterwards.
    pub fn destroy(&self, world: &World) -> Result<()> {
        let (base, _) = world.pool_base(self.id)?;
        let hdr = base as *mut PoolHeader;
        unsafe {
            match (*hdr).magic {
                POOL_MAGIC => {}
                POOL_DEAD => return Err(WorldError::Destroyed),
                other => {
                    return Err(WorldError::Bug(format!(
                        "pool {} magic {other:#x}",
                        self.id
                    )))
                }
            }
        }
        if world.pool_map_count(self.id)? > 1 {
            return Err(WorldError::Busy);
        }
        unsafe { (*hdr).magic = POOL_DEAD };
        world.unregister_pool(self.id)?;
        world.drop_mapping(self.id)?;
        Segment::unlink_by_name(
            &shm_name::pool_segment(world.session(), self.id),
            world.backing_dir(),
        );
        tracing::debug!(pool = self.id, "shared pool destroyed");
        Ok(())
    }
}

/// Validate a pool header when attaching an existing segment.
pub(crate) fn check_header(base: *mut u8, expect_id: u32) -> Result<()> {
    let hdr = base as *mut PoolHeader;
    unsafe {
        match (*hdr).magic {
            POOL_MAGIC if (*hdr).id == expect_id => Ok(()),
            POOL_MAGIC => Err(WorldError::Bug(format!(
                "pool segment id mismatch: header {} vs directory {expect_id}",
                (*hdr).id
            ))),
            POOL_DEAD => Err(WorldError::Destroyed),
            other => Err(WorldError::Bug(format!("pool magic {other:#x}"))),
        }
    }
}
