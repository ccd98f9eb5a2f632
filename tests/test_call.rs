// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Remote calls: direct and cross-participant execution, one-way fire and
// forget, retained requests completed by call_return, oneshot calls and
// dead-owner detection.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use libworld::{call_return, Call, CallResult, World, WorldConfig, WorldError, CALL_ONESHOT, CALL_ONEWAY};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_session() -> u32 {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    (std::process::id() & 0xffff) << 12 | (n & 0xfff) | 0x6000_0000
}

fn small_cfg(session: u32) -> WorldConfig {
    let mut cfg = WorldConfig::new(session);
    cfg.pool_size = 64 * 1024;
    cfg.call_timeout_ms = Some(5000);
    cfg
}

/// Pump the owner's event loop until `done` returns true.
fn pump_until(world: &World, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        world.process_pending(Some(50)).expect("process_pending");
        assert!(Instant::now() < deadline, "owner pump timed out");
    }
}

#[test]
fn direct_execution_on_owner() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let call = Call::init(&master, &pool, 0, |_w, req| CallResult::Reply(req.arg * 3))
        .expect("init call");

    assert_eq!(call.execute(&master, 0, 7, &[]).expect("execute"), 21);
    assert_eq!(call.execute(&master, 0, -4, &[]).expect("execute"), -12);

    call.destroy(&master).expect("destroy call");
    master.destroy().expect("destroy");
}

#[test]
fn remote_execution_round_trip() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let seen_payload = Arc::new(Mutex::new(Vec::new()));
    let payload_cb = Arc::clone(&seen_payload);
    let call = Call::init(&master, &pool, 0, move |_w, req| {
        *payload_cb.lock().unwrap() = req.data.clone();
        CallResult::Reply(req.arg + 100)
    })
    .expect("init call");

    let caller = thread::spawn(move || {
        let client = World::join(small_cfg(session)).expect("join");
        call.execute(&client, 0, 5, b"payload bytes").expect("execute")
    });

    pump_until(&master, || caller.is_finished());
    assert_eq!(caller.join().unwrap(), 105);
    assert_eq!(seen_payload.lock().unwrap().as_slice(), b"payload bytes");

    call.destroy(&master).expect("destroy call");
    master.destroy().expect("destroy");
}

#[test]
fn oneway_does_not_wait() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let hits = Arc::new(AtomicI32::new(0));
    let hits_cb = Arc::clone(&hits);
    let call = Call::init(&master, &pool, 0, move |_w, req| {
        hits_cb.store(req.arg, Ordering::SeqCst);
        CallResult::Reply(0)
    })
    .expect("init call");

    let client = World::join(small_cfg(session)).expect("join");
    let start = Instant::now();
    assert_eq!(
        call.execute(&client, CALL_ONEWAY, 42, &[]).expect("execute"),
        0
    );
    assert!(start.elapsed() < Duration::from_millis(500), "oneway blocked");
    assert_eq!(hits.load(Ordering::SeqCst), 0, "handler ran before the owner pumped");

    pump_until(&master, || hits.load(Ordering::SeqCst) == 42);

    call.destroy(&master).expect("destroy call");
    drop(client);
    master.destroy().expect("destroy");
}

#[test]
fn retained_request_completed_by_call_return() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let pending_serial = Arc::new(AtomicU32::new(0));
    let serial_cb = Arc::clone(&pending_serial);
    let call = Call::init(&master, &pool, 0, move |_w, req| {
        serial_cb.store(req.serial, Ordering::SeqCst);
        CallResult::Retain
    })
    .expect("init call");

    let caller = thread::spawn(move || {
        let client = World::join(small_cfg(session)).expect("join");
        call.execute(&client, 0, 1, &[]).expect("execute")
    });

    pump_until(&master, || pending_serial.load(Ordering::SeqCst) != 0);
    assert!(!caller.is_finished(), "caller resolved before call_return");

    let serial = pending_serial.load(Ordering::SeqCst);
    call_return(&master, serial, 777).expect("call_return");
    assert_eq!(caller.join().unwrap(), 777);

    // The serial is gone now.
    match call_return(&master, serial, 0) {
        Err(WorldError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    call.destroy(&master).expect("destroy call");
    master.destroy().expect("destroy");
}

#[test]
fn call_return_unknown_serial() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");

    match call_return(&master, 0xdead, 0) {
        Err(WorldError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    master.destroy().expect("destroy");
}

#[test]
fn oneshot_call_retires_after_first_request() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let call = Call::init(&master, &pool, CALL_ONESHOT, |_w, _req| CallResult::Reply(1))
        .expect("init call");

    assert_eq!(call.execute(&master, 0, 0, &[]).expect("first execute"), 1);

    match call.execute(&master, 0, 0, &[]) {
        Err(WorldError::Destroyed) => {}
        other => panic!("expected Destroyed, got {other:?}"),
    }

    master.destroy().expect("destroy");
}

#[test]
fn executing_against_dead_owner_is_destroyed() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    // The owner is a participant whose pid never lived.
    let ghost = World::join_as(small_cfg(session), i32::MAX - 3).expect("join_as");
    let call = Call::init(&ghost, &pool, 0, |_w, _req| CallResult::Reply(0)).expect("init call");
    std::mem::forget(ghost);

    match call.execute(&master, 0, 1, &[]) {
        Err(WorldError::Destroyed) => {}
        other => panic!("expected Destroyed, got {other:?}"),
    }

    master.destroy().expect("destroy");
}

// An owner that dies with a request outstanding can never reply; destroy
// must not read that stuck bookkeeping as Busy forever.
#[test]
fn destroy_succeeds_after_owner_death_with_pending_request() {
    let session = unique_session();
    let master = Arc::new(World::create(small_cfg(session)).expect("create"));
    let pool = master.default_pool();

    // The owner accepts the request into its mailbox but never pumps it.
    let owner = World::join(small_cfg(session)).expect("join");
    let call = Call::init(&owner, &pool, 0, |_w, _req| CallResult::Reply(0)).expect("init call");

    let m = Arc::clone(&master);
    let caller = thread::spawn(move || call.execute(&m, 0, 9, &[]));
    thread::sleep(Duration::from_millis(200));

    drop(owner);
    match caller.join().unwrap() {
        Err(WorldError::Destroyed) => {}
        other => panic!("expected Destroyed, got {other:?}"),
    }

    call.destroy(&master).expect("destroy despite dead owner");
    Arc::try_unwrap(master)
        .expect("sole owner")
        .destroy()
        .expect("destroy");
}

#[test]
fn destroyed_call_refuses_execution() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    let call = Call::init(&master, &pool, 0, |_w, _req| CallResult::Reply(0)).expect("init call");
    call.destroy(&master).expect("destroy call");

    match call.execute(&master, 0, 1, &[]) {
        Err(WorldError::Destroyed) => {}
        other => panic!("expected Destroyed, got {other:?}"),
    }
    match call.destroy(&master) {
        Err(WorldError::Destroyed) => {}
        other => panic!("expected Destroyed, got {other:?}"),
    }

    master.destroy().expect("destroy");
}

#[test]
fn nested_handler_can_call_back() {
    let session = unique_session();
    let master = World::create(small_cfg(session)).expect("create");
    let pool = master.default_pool();

    // inner is owned by the master too; the handler of outer invokes it
    // directly while handling a remote request.
    let inner = Call::init(&master, &pool, 0, |_w, req| CallResult::Reply(req.arg + 1))
        .expect("init inner");
    let outer = Call::init(&master, &pool, 0, move |w, req| {
        match inner.execute(w, 0, req.arg, &[]) {
            Ok(v) => CallResult::Reply(v * 10),
            Err(_) => CallResult::Reply(-1),
        }
    })
    .expect("init outer");

    let caller = thread::spawn(move || {
        let client = World::join(small_cfg(session)).expect("join");
        outer.execute(&client, 0, 4, &[]).expect("execute")
    });

    pump_until(&master, || caller.is_finished());
    assert_eq!(caller.join().unwrap(), 50);

    outer.destroy(&master).expect("destroy outer");
    master.destroy().expect("destroy");
}
