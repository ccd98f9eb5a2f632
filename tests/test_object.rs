// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Object pools: lifecycle states, the object limit, enumeration, and the
// zombie teardown protocol — terminal notification strictly before the
// destructor, destructor exactly once, storage returned to the pool.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libworld::{
    ObjectNotice, ObjectPool, ObjectState, ReactionResult, World, WorldConfig, WorldError,
};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_session() -> u32 {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    (std::process::id() & 0xffff) << 12 | (n & 0xfff) | 0x7000_0000
}

fn cfg_with_limit(session: u32, limit: u32) -> WorldConfig {
    let mut cfg = WorldConfig::new(session);
    cfg.pool_size = 256 * 1024;
    cfg.object_limit = limit;
    cfg.call_timeout_ms = Some(5000);
    cfg
}

fn noop_destructor(_w: &World, _obj: libworld::SharedObject) {}

#[test]
fn create_activate_enumerate() {
    let session = unique_session();
    let master = World::create(cfg_with_limit(session, 16)).expect("create");
    let pool = master.default_pool();
    let opool =
        ObjectPool::create(&master, &pool, "things", 32, 16, &[], noop_destructor).expect("opool");

    let obj = opool.create_object(&master).expect("create_object");
    assert_eq!(obj.state(&master).expect("state"), ObjectState::Creating);

    // Creating objects are invisible to enumerate.
    let mut count = 0;
    opool
        .enumerate(&master, |_| {
            count += 1;
            true
        })
        .expect("enumerate");
    assert_eq!(count, 0);

    opool.activate(&master, &obj).expect("activate");
    assert_eq!(obj.state(&master).expect("state"), ObjectState::Active);

    opool
        .enumerate(&master, |_| {
            count += 1;
            true
        })
        .expect("enumerate");
    assert_eq!(count, 1);

    // Activating twice is an invariant violation.
    match opool.activate(&master, &obj) {
        Err(WorldError::Bug(_)) => {}
        other => panic!("expected Bug, got {other:?}"),
    }

    opool.unref(&master, &obj).expect("unref");
    opool.destroy(&master).expect("destroy opool");
    master.destroy().expect("destroy");
}

#[test]
fn object_limit_is_enforced() {
    let session = unique_session();
    let master = World::create(cfg_with_limit(session, 4)).expect("create");
    let pool = master.default_pool();
    let opool =
        ObjectPool::create(&master, &pool, "limited", 16, 16, &[], noop_destructor).expect("opool");

    let mut objs = Vec::new();
    for _ in 0..4 {
        let o = opool.create_object(&master).expect("create_object");
        opool.activate(&master, &o).expect("activate");
        objs.push(o);
    }
    assert_eq!(opool.free_count(&master).expect("free_count"), 0);

    match opool.create_object(&master) {
        Err(WorldError::OutOfMemory) => {}
        other => panic!("expected OutOfMemory, got {other:?}"),
    }

    // Destroying one makes room again.
    opool.unref(&master, &objs.pop().unwrap()).expect("unref");
    assert_eq!(opool.free_count(&master).expect("free_count"), 1);
    let o = opool.create_object(&master).expect("create after room");
    opool.activate(&master, &o).expect("activate");
    objs.push(o);

    for o in objs {
        opool.unref(&master, &o).expect("unref");
    }
    opool.destroy(&master).expect("destroy opool");
    master.destroy().expect("destroy");
}

#[test]
fn last_unref_runs_notification_then_destructor() {
    let session = unique_session();
    let master = World::create(cfg_with_limit(session, 16)).expect("create");
    let pool = master.default_pool();

    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let log_dtor = Arc::clone(&log);
    let opool = ObjectPool::create(&master, &pool, "watched", 32, 16, &[], move |_w, _obj| {
        log_dtor.lock().unwrap().push("destructor");
    })
    .expect("opool");

    let obj = opool.create_object(&master).expect("create_object");
    opool.activate(&master, &obj).expect("activate");

    let log_cb = Arc::clone(&log);
    opool
        .attach(&master, &obj, move |payload| {
            let notice = ObjectNotice::decode(payload).expect("decode notice");
            assert_eq!(notice.state, ObjectState::Destroyed as u32);
            log_cb.lock().unwrap().push("terminal");
            ReactionResult::Keep
        })
        .expect("attach");

    // No other participant holds a reference or listens remotely, so the
    // whole teardown happens inside this unref.
    opool.unref(&master, &obj).expect("unref");

    assert_eq!(log.lock().unwrap().as_slice(), &["terminal", "destructor"]);
    assert_eq!(opool.free_count(&master).expect("free_count"), 16);

    opool.destroy(&master).expect("destroy opool");
    master.destroy().expect("destroy");
}

#[test]
fn ref_keeps_object_alive() {
    let session = unique_session();
    let master = World::create(cfg_with_limit(session, 16)).expect("create");
    let pool = master.default_pool();

    let destroyed = Arc::new(AtomicI32::new(0));
    let destroyed_cb = Arc::clone(&destroyed);
    let opool = ObjectPool::create(&master, &pool, "held", 32, 16, &[], move |_w, _obj| {
        destroyed_cb.fetch_add(1, Ordering::SeqCst);
    })
    .expect("opool");

    let obj = opool.create_object(&master).expect("create_object");
    opool.activate(&master, &obj).expect("activate");

    opool.ref_(&master, &obj).expect("ref");
    opool.unref(&master, &obj).expect("unref 1");
    assert_eq!(destroyed.load(Ordering::SeqCst), 0, "still referenced");
    assert_eq!(obj.state(&master).expect("state"), ObjectState::Active);

    opool.unref(&master, &obj).expect("unref 2");
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);

    opool.destroy(&master).expect("destroy opool");
    master.destroy().expect("destroy");
}

#[test]
fn enumerate_stops_early() {
    let session = unique_session();
    let master = World::create(cfg_with_limit(session, 16)).expect("create");
    let pool = master.default_pool();
    let opool =
        ObjectPool::create(&master, &pool, "walk", 16, 16, &[], noop_destructor).expect("opool");

    let mut objs = Vec::new();
    for _ in 0..3 {
        let o = opool.create_object(&master).expect("create_object");
        opool.activate(&master, &o).expect("activate");
        objs.push(o);
    }

    let mut visited = 0;
    opool
        .enumerate(&master, |_| {
            visited += 1;
            visited < 2
        })
        .expect("enumerate");
    assert_eq!(visited, 2);

    for o in objs {
        opool.unref(&master, &o).expect("unref");
    }
    opool.destroy(&master).expect("destroy opool");
    master.destroy().expect("destroy");
}

#[test]
fn destroy_refuses_while_objects_active() {
    let session = unique_session();
    let master = World::create(cfg_with_limit(session, 16)).expect("create");
    let pool = master.default_pool();
    let opool =
        ObjectPool::create(&master, &pool, "busy", 16, 16, &[], noop_destructor).expect("opool");

    let obj = opool.create_object(&master).expect("create_object");
    opool.activate(&master, &obj).expect("activate");

    match opool.destroy(&master) {
        Err(WorldError::Busy) => {}
        other => panic!("expected Busy, got {other:?}"),
    }

    opool.unref(&master, &obj).expect("unref");
    opool.destroy(&master).expect("destroy opool");
    master.destroy().expect("destroy");
}

// Two participants, a remote listener, and a zombie phase: the terminal
// notification must reach the listener exactly once before the destructor
// runs, the destructor must run exactly once, and the pool slot must be
// returned.
#[test]
fn two_participant_teardown_with_zombie() {
    let session = unique_session();
    let limit = 64;
    let master = World::create(cfg_with_limit(session, limit)).expect("create");
    let client = World::join(cfg_with_limit(session, limit)).expect("join");
    let pool = master.default_pool();

    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let log_dtor = Arc::clone(&log);
    let opool = ObjectPool::create(&master, &pool, "shared", 64, 16, &[], move |_w, _obj| {
        log_dtor.lock().unwrap().push("destructor");
    })
    .expect("opool");

    let obj = opool.create_object(&master).expect("create_object");
    opool.activate(&master, &obj).expect("activate");
    master.publish("the_object", obj.shared_ref()).expect("publish");
    assert_eq!(opool.free_count(&master).expect("free_count"), limit - 1);

    // Client takes its own reference and listens.
    let found = libworld::SharedObject::from_ref(client.lookup("the_object").expect("lookup"));
    opool.ref_(&client, &found).expect("client ref");

    let notices = Arc::new(Mutex::new(Vec::<ObjectNotice>::new()));
    let notices_cb = Arc::clone(&notices);
    opool
        .attach(&client, &found, move |payload| {
            if let Some(n) = ObjectNotice::decode(payload) {
                notices_cb.lock().unwrap().push(n);
            }
            ReactionResult::Keep
        })
        .expect("client attach");

    // Master-side listener establishes notification/destructor ordering.
    let log_cb = Arc::clone(&log);
    opool
        .attach(&master, &obj, move |_| {
            log_cb.lock().unwrap().push("terminal");
            ReactionResult::Keep
        })
        .expect("master attach");

    // Drop both references; the client's is the last one.
    opool.unref(&master, &obj).expect("master unref");
    assert_eq!(log.lock().unwrap().len(), 0, "teardown started too early");
    opool.unref(&client, &found).expect("client unref");

    // Pump both sides: owner runs the teardown call and zombie drain, the
    // client consumes the terminal notification.
    let deadline = Instant::now() + Duration::from_secs(5);
    while log.lock().unwrap().last() != Some(&"destructor") {
        master.process_pending(Some(20)).expect("master pump");
        client.process_pending(Some(20)).expect("client pump");
        assert!(Instant::now() < deadline, "teardown never completed");
    }

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &["terminal", "destructor"],
        "terminal notification must strictly precede the destructor"
    );

    let got = notices.lock().unwrap();
    assert_eq!(got.len(), 1, "listener must see exactly one terminal notice");
    assert_eq!(got[0].state, ObjectState::Destroyed as u32);

    assert_eq!(
        opool.free_count(&master).expect("free_count"),
        limit,
        "slot must be returned after teardown"
    );

    opool.destroy(&master).expect("destroy opool");
    drop(client);
    master.destroy().expect("destroy");
}

// A listener that dies with the terminal notification still queued must not
// wedge the object: the owner's pump discounts the undeliverable
// notification and finalizes the zombie.
#[test]
fn dead_listener_does_not_wedge_teardown() {
    let session = unique_session();
    let master = World::create(cfg_with_limit(session, 8)).expect("create");
    let pool = master.default_pool();

    let destroyed = Arc::new(AtomicI32::new(0));
    let destroyed_cb = Arc::clone(&destroyed);
    let opool = ObjectPool::create(&master, &pool, "orphaned", 32, 16, &[], move |_w, _obj| {
        destroyed_cb.fetch_add(1, Ordering::SeqCst);
    })
    .expect("opool");

    let obj = opool.create_object(&master).expect("create_object");
    opool.activate(&master, &obj).expect("activate");

    // The listener attaches but never pumps its mailbox.
    let listener = World::join(cfg_with_limit(session, 8)).expect("join");
    opool
        .attach(&listener, &obj, |_| ReactionResult::Keep)
        .expect("listener attach");

    opool.unref(&master, &obj).expect("unref");
    assert_eq!(obj.state(&master).expect("state"), ObjectState::Zombie);
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);

    // The listener dies with the notification still queued.
    drop(listener);

    let deadline = Instant::now() + Duration::from_secs(5);
    while destroyed.load(Ordering::SeqCst) == 0 {
        master.process_pending(Some(20)).expect("master pump");
        assert!(Instant::now() < deadline, "zombie never finalized");
    }

    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(opool.free_count(&master).expect("free_count"), 8);

    opool.destroy(&master).expect("destroy opool");
    master.destroy().expect("destroy");
}

#[test]
fn object_contents_are_shared() {
    let session = unique_session();
    let master = World::create(cfg_with_limit(session, 16)).expect("create");
    let client = World::join(cfg_with_limit(session, 16)).expect("join");
    let pool = master.default_pool();
    let opool =
        ObjectPool::create(&master, &pool, "blob", 64, 16, &[], noop_destructor).expect("opool");

    let obj = opool.create_object(&master).expect("create_object");
    let contents = obj.contents_ref();
    let p = master.translate(contents, 64).expect("translate");
    unsafe { std::ptr::write_bytes(p, 0x77, 64) };
    opool.activate(&master, &obj).expect("activate");
    master.publish("blob_obj", obj.shared_ref()).expect("publish");

    let found = libworld::SharedObject::from_ref(client.lookup("blob_obj").expect("lookup"));
    let q = client.translate(found.contents_ref(), 64).expect("translate client");
    let bytes = unsafe { std::slice::from_raw_parts(q, 64) };
    assert!(bytes.iter().all(|&b| b == 0x77));

    opool.unref(&master, &obj).expect("unref");
    opool.destroy(&master).expect("destroy opool");
    drop(client);
    master.destroy().expect("destroy");
}
