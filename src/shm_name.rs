// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Naming for the shared memory segments of one world session.

/// Platform cap on POSIX shm names, 0 = uncapped. macOS `PSHMNAMLEN` is 31.
#[cfg(target_os = "macos")]
const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
const SHM_NAME_MAX: usize = 0;

fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Segment name for the world header of `session`.
pub fn world_segment(session: u32) -> String {
    format!("world_{session:08x}__world")
}

/// Segment name for shared pool `pool_id` of `session`.
pub fn pool_segment(session: u32, pool_id: u32) -> String {
    format!("world_{session:08x}__pool_{pool_id}")
}

/// Produce a POSIX shm-safe name (with leading '/'). Where the platform
/// caps name length, overlong names keep a prefix for debuggability and
/// get an FNV-1a hash suffix to stay unique.
pub fn make_shm_name(name: &str) -> String {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    if SHM_NAME_MAX == 0 || full.len() <= SHM_NAME_MAX {
        return full;
    }
    let hash = fnv1a_64(full.as_bytes());
    let keep = SHM_NAME_MAX.saturating_sub(1 + 16).max(1);
    let prefix: String = full.chars().take(keep).collect();
    format!("{prefix}_{hash:016x}")
}
