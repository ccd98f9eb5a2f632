// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Usage:
//   demo_world_client <session> <arg>
//
// Joins the world created by demo_world_master, looks up its "echo" call
// and invokes it with <arg>, printing the reply.

use libworld::{Call, World, WorldConfig};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: demo_world_client <session> <arg>");
        std::process::exit(1);
    }
    let session: u32 = args[1].parse().expect("session id");
    let arg: i32 = args[2].parse().expect("arg");

    let mut cfg = WorldConfig::new(session);
    cfg.call_timeout_ms = Some(5000);
    let world = World::join(cfg).expect("join world");
    println!(
        "joined world {session} as participant {}",
        world.participant_id()
    );

    let echo = Call::from_ref(world.lookup("echo").expect("lookup echo"));
    let reply = echo
        .execute(&world, 0, arg, b"ping")
        .expect("execute echo");
    println!("echo({arg}) = {reply}");
}
