// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Shared pool allocator: first-fit allocation, free with coalescing,
// exhaustion, cross-participant allocation and teardown refusal while
// other processes stay attached.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use libworld::{SharedPool, World, WorldConfig, WorldError};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_session() -> u32 {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    (std::process::id() & 0xffff) << 12 | (n & 0xfff) | 0x2000_0000
}

fn small_cfg(session: u32) -> WorldConfig {
    let mut cfg = WorldConfig::new(session);
    cfg.pool_size = 64 * 1024;
    cfg
}

#[test]
fn allocate_write_free() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let used0 = pool.bytes_used(&master).expect("bytes_used");
    let r = pool.allocate(&master, 100).expect("allocate");
    assert!(pool.bytes_used(&master).expect("bytes_used") > used0);

    let p = master.translate(r, 100).expect("translate");
    unsafe { std::ptr::write_bytes(p, 0x5a, 100) };

    pool.free(&master, r).expect("free");
    assert_eq!(pool.bytes_used(&master).expect("bytes_used"), used0);

    master.destroy().expect("destroy");
}

#[test]
fn distinct_allocations_do_not_overlap() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let refs: Vec<_> = (0..16)
        .map(|i| {
            let r = pool.allocate(&master, 32).expect("allocate");
            let p = master.translate(r, 32).expect("translate");
            unsafe { std::ptr::write_bytes(p, i as u8, 32) };
            r
        })
        .collect();

    for (i, r) in refs.iter().enumerate() {
        let p = master.translate(*r, 32).expect("translate");
        let bytes = unsafe { std::slice::from_raw_parts(p, 32) };
        assert!(bytes.iter().all(|&b| b == i as u8), "allocation {i} clobbered");
    }

    for r in refs {
        pool.free(&master, r).expect("free");
    }
    master.destroy().expect("destroy");
}

#[test]
fn exhaustion_and_reuse() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = SharedPool::create(&master, "tiny", 4096).expect("create pool");

    let mut refs = Vec::new();
    loop {
        match pool.allocate(&master, 256) {
            Ok(r) => refs.push(r),
            Err(WorldError::OutOfMemory) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(!refs.is_empty());

    for r in refs.drain(..) {
        pool.free(&master, r).expect("free");
    }

    // After freeing everything the blocks must have coalesced enough to
    // serve one large allocation again.
    let big = pool.allocate(&master, 2048).expect("allocate after free");
    pool.free(&master, big).expect("free big");

    pool.destroy(&master).expect("destroy pool");
    master.destroy().expect("destroy");
}

#[test]
fn free_coalesces_neighbours() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = SharedPool::create(&master, "coalesce", 4096).expect("create pool");

    let a = pool.allocate(&master, 512).expect("a");
    let b = pool.allocate(&master, 512).expect("b");
    let c = pool.allocate(&master, 512).expect("c");

    // Free out of order so merging has to happen on both sides of b.
    pool.free(&master, a).expect("free a");
    pool.free(&master, c).expect("free c");
    pool.free(&master, b).expect("free b");

    // 3 * 512 plus their headers only fits if they merged back together.
    let big = pool.allocate(&master, 1536 + 16).expect("merged allocation");
    pool.free(&master, big).expect("free");

    pool.destroy(&master).expect("destroy pool");
    master.destroy().expect("destroy");
}

#[test]
fn double_free_is_a_bug() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let r = pool.allocate(&master, 64).expect("allocate");
    pool.free(&master, r).expect("free");

    match pool.free(&master, r) {
        Err(WorldError::Bug(_)) => {}
        other => panic!("expected Bug, got {other:?}"),
    }

    master.destroy().expect("destroy");
}

#[test]
fn concurrent_allocation_from_two_participants() {
    let session = unique_session();
    let master = Arc::new(World::create(small_cfg(session)).expect("create"));
    let client = Arc::new(World::join(small_cfg(session)).expect("join"));
    let pool = master.default_pool();

    let used0 = pool.bytes_used(&master).expect("bytes_used");

    let spawn_churn = |world: Arc<World>| {
        thread::spawn(move || {
            let pool = world.default_pool();
            for i in 0..200 {
                let r = pool.allocate(&world, 24 + (i % 5) * 8).expect("allocate");
                let p = world.translate(r, 24).expect("translate");
                unsafe { std::ptr::write_bytes(p, i as u8, 24) };
                pool.free(&world, r).expect("free");
            }
        })
    };

    let t1 = spawn_churn(Arc::clone(&master));
    let t2 = spawn_churn(Arc::clone(&client));
    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(pool.bytes_used(&master).expect("bytes_used"), used0);

    drop(client);
    Arc::try_unwrap(master).expect("sole owner").destroy().expect("destroy");
}

#[test]
fn destroy_refuses_while_attached_elsewhere() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let client = World::join(small_cfg(session)).expect("join");

    let pool = SharedPool::create(&master, "contested", 8192).expect("create pool");
    pool.attach(&client).expect("attach");

    match pool.destroy(&master) {
        Err(WorldError::Busy) => {}
        other => panic!("expected Busy, got {other:?}"),
    }

    pool.detach(&client).expect("detach");
    pool.destroy(&master).expect("destroy pool");

    drop(client);
    master.destroy().expect("destroy");
}
