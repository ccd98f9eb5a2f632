// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Reference counters: local/global counts, the one-shot zero watch (with
// the no-resurrection guarantee), the zero lock, and inherit.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use libworld::{Call, CallResult, RefCounter, World, WorldConfig, WorldError};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_session() -> u32 {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    (std::process::id() & 0xffff) << 12 | (n & 0xfff) | 0x4000_0000
}

fn small_cfg(session: u32) -> WorldConfig {
    let mut cfg = WorldConfig::new(session);
    cfg.pool_size = 64 * 1024;
    cfg
}

#[test]
fn up_down_stat() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let rc = RefCounter::init(&master, &master.default_pool()).expect("init");

    assert_eq!(rc.stat(&master).expect("stat"), 0);
    rc.up(&master, false).expect("up local");
    rc.up(&master, false).expect("up local");
    rc.up(&master, true).expect("up global");
    assert_eq!(rc.stat(&master).expect("stat"), 3);

    rc.down(&master, true).expect("down global");
    rc.down(&master, false).expect("down local");
    assert_eq!(rc.stat(&master).expect("stat"), 1);
    rc.down(&master, false).expect("down local");
    assert_eq!(rc.stat(&master).expect("stat"), 0);

    rc.destroy(&master).expect("destroy counter");
    master.destroy().expect("destroy");
}

#[test]
fn down_past_zero_is_a_bug() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let rc = RefCounter::init(&master, &master.default_pool()).expect("init");

    match rc.down(&master, false) {
        Err(WorldError::Bug(_)) => {}
        other => panic!("expected Bug, got {other:?}"),
    }

    rc.destroy(&master).expect("destroy counter");
    master.destroy().expect("destroy");
}

#[test]
fn watch_fires_once_and_seals_the_counter() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let fired = Arc::new(AtomicI32::new(0));
    let seen_arg = Arc::new(AtomicI32::new(0));
    let fired_cb = Arc::clone(&fired);
    let arg_cb = Arc::clone(&seen_arg);
    let call = Call::init(&master, &pool, 0, move |_w, req| {
        fired_cb.fetch_add(1, Ordering::SeqCst);
        arg_cb.store(req.arg, Ordering::SeqCst);
        CallResult::Reply(0)
    })
    .expect("init call");

    let rc = RefCounter::init(&master, &pool).expect("init counter");
    rc.up(&master, false).expect("up");
    rc.up(&master, false).expect("up");
    rc.watch(&master, &call, 1234).expect("watch");

    // Second watch is refused.
    match rc.watch(&master, &call, 1) {
        Err(WorldError::Busy) => {}
        other => panic!("expected Busy, got {other:?}"),
    }

    rc.down(&master, false).expect("down");
    assert_eq!(fired.load(Ordering::SeqCst), 0, "watch fired early");

    rc.down(&master, false).expect("down to zero");
    assert_eq!(fired.load(Ordering::SeqCst), 1, "watch must fire at zero");
    assert_eq!(seen_arg.load(Ordering::SeqCst), 1234);

    // Sealed: the count stays at zero, late ups are refused.
    match rc.up(&master, false) {
        Err(WorldError::Destroyed) => {}
        other => panic!("expected Destroyed, got {other:?}"),
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    call.destroy(&master).expect("destroy call");
    master.destroy().expect("destroy");
}

#[test]
fn watch_on_zero_counter_is_invalid() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let call = Call::init(&master, &pool, 0, |_w, _req| CallResult::Reply(0)).expect("init call");
    let rc = RefCounter::init(&master, &pool).expect("init counter");

    match rc.watch(&master, &call, 0) {
        Err(WorldError::Invalid(_)) => {}
        other => panic!("expected Invalid, got {other:?}"),
    }

    rc.destroy(&master).expect("destroy counter");
    call.destroy(&master).expect("destroy call");
    master.destroy().expect("destroy");
}

#[test]
fn zero_lock_waits_for_zero_and_blocks_up() {
    let session = unique_session();
    let master = Arc::new(World::create(small_cfg(session)).expect("create"));
    let rc = RefCounter::init(&master, &master.default_pool()).expect("init");
    rc.up(&master, false).expect("up");

    // Another participant drops the last reference after a delay.
    let downer = thread::spawn(move || {
        let world = World::join(small_cfg(session)).expect("join");
        thread::sleep(Duration::from_millis(150));
        rc.down(&world, false).expect("down");
    });

    let start = Instant::now();
    rc.zero_lock(&master).expect("zero_lock");
    assert!(
        start.elapsed() >= Duration::from_millis(100),
        "zero_lock returned before the count was zero"
    );
    downer.join().unwrap();
    assert_eq!(rc.stat(&master).expect("stat"), 0);

    // While we hold the zero lock, an up from another participant waits.
    let upper = thread::spawn(move || {
        let world = World::join(small_cfg(session)).expect("join");
        let start = Instant::now();
        rc.up(&world, false).expect("up");
        start.elapsed()
    });

    thread::sleep(Duration::from_millis(150));
    assert_eq!(rc.stat(&master).expect("stat"), 0, "count moved under zero lock");
    rc.unlock(&master).expect("unlock");

    let waited = upper.join().unwrap();
    assert!(waited >= Duration::from_millis(100), "up did not wait for unlock");
    assert_eq!(rc.stat(&master).expect("stat"), 1);

    rc.destroy(&master).expect("destroy counter");
    Arc::try_unwrap(master).expect("sole owner").destroy().expect("destroy");
}

#[test]
fn zero_trylock_busy_on_nonzero() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let rc = RefCounter::init(&master, &master.default_pool()).expect("init");

    rc.up(&master, false).expect("up");
    match rc.zero_trylock(&master) {
        Err(WorldError::Busy) => {}
        other => panic!("expected Busy, got {other:?}"),
    }

    rc.down(&master, false).expect("down");
    rc.zero_trylock(&master).expect("zero_trylock at zero");
    rc.unlock(&master).expect("unlock");

    rc.destroy(&master).expect("destroy counter");
    master.destroy().expect("destroy");
}

#[test]
fn unlock_requires_holder() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let rc = RefCounter::init(&master, &master.default_pool()).expect("init");

    match rc.unlock(&master) {
        Err(WorldError::Invalid(_)) => {}
        other => panic!("expected Invalid, got {other:?}"),
    }

    rc.destroy(&master).expect("destroy counter");
    master.destroy().expect("destroy");
}

#[test]
fn inherit_moves_local_count() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let parent = RefCounter::init(&master, &pool).expect("init parent");
    let child = RefCounter::init(&master, &pool).expect("init child");

    child.up(&master, false).expect("up");
    child.up(&master, false).expect("up");
    parent.up(&master, false).expect("up");

    parent.inherit(&master, &child).expect("inherit");
    assert_eq!(parent.stat(&master).expect("stat"), 3);
    assert_eq!(child.stat(&master).expect("stat"), 0);

    match parent.inherit(&master, &parent) {
        Err(WorldError::Invalid(_)) => {}
        other => panic!("expected Invalid, got {other:?}"),
    }

    parent.destroy(&master).expect("destroy parent");
    child.destroy(&master).expect("destroy child");
    master.destroy().expect("destroy");
}

#[test]
fn destroyed_counter_refuses_everything() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let rc = RefCounter::init(&master, &master.default_pool()).expect("init");

    rc.destroy(&master).expect("destroy counter");

    match rc.up(&master, false) {
        Err(WorldError::Destroyed) => {}
        other => panic!("expected Destroyed, got {other:?}"),
    }
    match rc.stat(&master) {
        Err(WorldError::Destroyed) => {}
        other => panic!("expected Destroyed, got {other:?}"),
    }
    match rc.destroy(&master) {
        Err(WorldError::Destroyed) => {}
        other => panic!("expected Destroyed, got {other:?}"),
    }

    master.destroy().expect("destroy");
}
