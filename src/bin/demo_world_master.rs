// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Usage:
//   demo_world_master <session> [seconds]
//
// Creates the world for <session>, publishes an "echo" call that doubles
// its argument, then serves incoming requests for [seconds] (default 30).
// Run demo_world_client with the same session id from other terminals.

use std::time::{Duration, Instant};

use libworld::{Call, CallResult, World, WorldConfig};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_world_master <session> [seconds]");
        std::process::exit(1);
    }
    let session: u32 = args[1].parse().expect("session id");
    let seconds: u64 = args.get(2).map(|s| s.parse().expect("seconds")).unwrap_or(30);

    let world = World::create(WorldConfig::new(session)).expect("create world");
    println!("world {session} up, master pid {}", std::process::id());

    let pool = world.default_pool();
    let echo = Call::init(&world, &pool, 0, |_w, req| {
        let text = String::from_utf8_lossy(&req.data);
        println!("request from participant {}: arg={} data={text:?}", req.caller, req.arg);
        CallResult::Reply(req.arg * 2)
    })
    .expect("init echo call");
    world.publish("echo", echo.shared_ref()).expect("publish echo");

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        world
            .process_pending(Some(250))
            .expect("process_pending");
    }

    echo.destroy(&world).expect("destroy call");
    world.destroy().expect("destroy world");
    println!("world {session} torn down");
}
