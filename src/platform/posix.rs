// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// POSIX backing for the world runtime: named shared memory segments
// (shm_open or file-backed mmap when a backing directory is configured),
// robust process-shared pthread mutexes/condvars placed inside shared
// memory, and pid-based process liveness.
//
// Every segment carries a trailing `atomic<int32_t>` map counter shared by
// all processes mapping it; the last unmapper unlinks the backing object.
// Pool teardown uses the same counter to tell whether other processes are
// still attached.

use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Result, WorldError};
use crate::shm_name;

// ---------------------------------------------------------------------------
// Robust mutex symbols — not exposed by `libc` on all platforms.
// On macOS robust mutexes are not available; holder death is then only
// detected via pid liveness, not via EOWNERDEAD.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Layout helpers for the trailing map counter
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

/// The trailing `AtomicI32` map counter inside a mapped region.
///
/// # Safety
/// `mem` must point to a valid mapped region of at least `total_size` bytes.
unsafe fn acc_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

// ---------------------------------------------------------------------------
// Segment — one named shared memory mapping
// ---------------------------------------------------------------------------

/// Open mode for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    /// Create exclusively — fail if already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
}

/// Where the backing object lives.
#[derive(Debug, Clone)]
enum Backing {
    /// POSIX shm object (name includes the leading '/').
    Shm(String),
    /// Plain file in a caller-chosen directory (tmpfs override).
    File(PathBuf),
}

/// A named, inter-process shared memory segment.
pub struct Segment {
    mem: *mut u8,
    size: usize,      // total mapped size (including map counter)
    user_size: usize, // caller-requested size
    backing: Backing,
}

// The mapped region is process-shared by design.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Acquire a named segment of `user_size` bytes. With `dir` set, the
    /// segment is a file-backed mapping under that directory instead of a
    /// POSIX shm object.
    pub fn acquire(
        name: &str,
        user_size: usize,
        mode: SegmentMode,
        dir: Option<&Path>,
    ) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let total_size = calc_size(user_size);
        let perms: libc::mode_t = 0o666;

        let (fd, need_truncate, backing) = match dir {
            None => {
                let posix_name = shm_name::make_shm_name(name);
                let c_name = CString::new(posix_name.as_bytes())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let oflags = match mode {
                    SegmentMode::Create => libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    SegmentMode::Open => libc::O_RDWR,
                };
                let fd =
                    unsafe { libc::shm_open(c_name.as_ptr(), oflags, perms as libc::c_uint) };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                (fd, mode == SegmentMode::Create, Backing::Shm(posix_name))
            }
            Some(d) => {
                let path = d.join(name);
                let c_path = CString::new(path.as_os_str().as_encoded_bytes())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let oflags = match mode {
                    SegmentMode::Create => libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    SegmentMode::Open => libc::O_RDWR,
                };
                let fd = unsafe { libc::open(c_path.as_ptr(), oflags, perms as libc::c_uint) };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                (fd, mode == SegmentMode::Create, Backing::File(path))
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        if need_truncate {
            let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        unsafe { acc_of(mem as *mut u8, total_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            mem: mem as *mut u8,
            size: total_size,
            user_size,
            backing,
        })
    }

    /// Mutable pointer to the user-visible region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Caller-requested size.
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Current map count (processes/handles mapping this segment).
    pub fn ref_count(&self) -> i32 {
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    /// Force-remove the backing object. Does NOT release the mapping.
    pub fn unlink(&self) {
        match &self.backing {
            Backing::Shm(posix_name) => {
                if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
            }
            Backing::File(path) => {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    /// Remove a named segment's backing object without an open handle.
    pub fn unlink_by_name(name: &str, dir: Option<&Path>) {
        match dir {
            None => {
                let posix_name = shm_name::make_shm_name(name);
                if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
            }
            Some(d) => {
                let _ = std::fs::remove_file(d.join(name));
            }
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        let prev = unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if prev <= 1 {
            self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// Robust process-shared mutex, placed at a caller-chosen shm address
// ---------------------------------------------------------------------------

/// A `pthread_mutex_t` embedded in shared memory. Always initialised with
/// `PTHREAD_PROCESS_SHARED` and (where available) `PTHREAD_MUTEX_ROBUST`.
#[repr(C)]
pub struct RawMutex {
    inner: libc::pthread_mutex_t,
}

/// A `pthread_cond_t` embedded in shared memory (`PTHREAD_PROCESS_SHARED`).
#[repr(C)]
pub struct RawCond {
    inner: libc::pthread_cond_t,
}

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    /// Lock acquired normally.
    Acquired,
    /// Lock acquired, but the previous holder died while holding it and the
    /// mutex was made consistent. The caller now holds the lock.
    Recovered,
    /// Non-blocking or timed attempt did not acquire the lock.
    Unavailable,
}

/// Initialise a robust process-shared mutex in (zeroed or reclaimed) shm.
///
/// # Safety
/// `m` must point to writable shared memory of at least
/// `size_of::<RawMutex>()` bytes, with no live waiters on any previous
/// mutex at that address.
pub unsafe fn mutex_init(m: *mut RawMutex) -> Result<()> {
    let mtx_ptr = &mut (*m).inner as *mut libc::pthread_mutex_t;
    ptr::write_bytes(mtx_ptr, 0, 1);

    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_mutexattr_init(&mut attr);
    if eno != 0 {
        return Err(WorldError::errno_bug("pthread_mutexattr_init", eno));
    }

    eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(WorldError::errno_bug("pthread_mutexattr_setpshared", eno));
    }

    #[cfg(not(target_os = "macos"))]
    {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(WorldError::errno_bug("pthread_mutexattr_setrobust", eno));
        }
    }

    eno = libc::pthread_mutex_init(&mut (*m).inner, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if eno != 0 {
        return Err(WorldError::errno_bug("pthread_mutex_init", eno));
    }
    Ok(())
}

/// Lock a shared mutex. With `timeout_ms = None` blocks indefinitely.
///
/// `EOWNERDEAD` is handled by making the mutex consistent; the caller then
/// holds the lock and gets `Recovered` so it can validate protected state.
///
/// # Safety
/// `m` must point to a mutex initialised by [`mutex_init`].
pub unsafe fn mutex_lock(m: *mut RawMutex, timeout_ms: Option<u64>) -> Result<LockAcquire> {
    let mtx_ptr = &mut (*m).inner as *mut libc::pthread_mutex_t;

    match timeout_ms {
        None => loop {
            let eno = libc::pthread_mutex_lock(mtx_ptr);
            match eno {
                0 => return Ok(LockAcquire::Acquired),
                #[cfg(not(target_os = "macos"))]
                EOWNERDEAD => {
                    let eno2 = pthread_mutex_consistent(mtx_ptr);
                    if eno2 != 0 {
                        return Err(WorldError::errno_bug("pthread_mutex_consistent", eno2));
                    }
                    return Ok(LockAcquire::Recovered);
                }
                libc::EINTR => continue,
                _ => return Err(WorldError::errno_bug("pthread_mutex_lock", eno)),
            }
        },
        Some(ms) => {
            #[cfg(target_os = "macos")]
            {
                // macOS lacks pthread_mutex_timedlock — poll with try_lock.
                let deadline =
                    std::time::Instant::now() + std::time::Duration::from_millis(ms);
                loop {
                    match mutex_trylock(m)? {
                        LockAcquire::Unavailable => {}
                        got => return Ok(got),
                    }
                    if std::time::Instant::now() >= deadline {
                        return Ok(LockAcquire::Unavailable);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
            #[cfg(not(target_os = "macos"))]
            {
                extern "C" {
                    fn pthread_mutex_timedlock(
                        mutex: *mut libc::pthread_mutex_t,
                        abstime: *const libc::timespec,
                    ) -> libc::c_int;
                }
                let ts = abstime_from_now(ms);
                loop {
                    let eno = pthread_mutex_timedlock(mtx_ptr, &ts);
                    match eno {
                        0 => return Ok(LockAcquire::Acquired),
                        libc::ETIMEDOUT => return Ok(LockAcquire::Unavailable),
                        EOWNERDEAD => {
                            let eno2 = pthread_mutex_consistent(mtx_ptr);
                            if eno2 != 0 {
                                return Err(WorldError::errno_bug(
                                    "pthread_mutex_consistent",
                                    eno2,
                                ));
                            }
                            return Ok(LockAcquire::Recovered);
                        }
                        libc::EINTR => continue,
                        _ => return Err(WorldError::errno_bug("pthread_mutex_timedlock", eno)),
                    }
                }
            }
        }
    }
}

/// Try to lock without blocking.
///
/// # Safety
/// `m` must point to a mutex initialised by [`mutex_init`].
pub unsafe fn mutex_trylock(m: *mut RawMutex) -> Result<LockAcquire> {
    let mtx_ptr = &mut (*m).inner as *mut libc::pthread_mutex_t;
    let eno = libc::pthread_mutex_trylock(mtx_ptr);
    match eno {
        0 => Ok(LockAcquire::Acquired),
        libc::EBUSY => Ok(LockAcquire::Unavailable),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => {
            let eno2 = pthread_mutex_consistent(mtx_ptr);
            if eno2 != 0 {
                return Err(WorldError::errno_bug("pthread_mutex_consistent", eno2));
            }
            Ok(LockAcquire::Recovered)
        }
        _ => Err(WorldError::errno_bug("pthread_mutex_trylock", eno)),
    }
}

/// Unlock a shared mutex.
///
/// # Safety
/// `m` must point to a mutex held by the calling thread.
pub unsafe fn mutex_unlock(m: *mut RawMutex) -> Result<()> {
    let eno = libc::pthread_mutex_unlock(&mut (*m).inner);
    if eno != 0 {
        return Err(WorldError::errno_bug("pthread_mutex_unlock", eno));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Process-shared condition variable
// ---------------------------------------------------------------------------

/// Initialise a process-shared condvar in (zeroed or reclaimed) shm.
///
/// # Safety
/// `c` must point to writable shared memory of at least
/// `size_of::<RawCond>()` bytes, with no live waiters.
pub unsafe fn cond_init(c: *mut RawCond) -> Result<()> {
    let cond_ptr = &mut (*c).inner as *mut libc::pthread_cond_t;
    ptr::write_bytes(cond_ptr, 0, 1);

    let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_condattr_init(&mut attr);
    if eno != 0 {
        return Err(WorldError::errno_bug("pthread_condattr_init", eno));
    }

    eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_condattr_destroy(&mut attr);
        return Err(WorldError::errno_bug("pthread_condattr_setpshared", eno));
    }

    eno = libc::pthread_cond_init(&mut (*c).inner, &attr);
    libc::pthread_condattr_destroy(&mut attr);
    if eno != 0 {
        return Err(WorldError::errno_bug("pthread_cond_init", eno));
    }
    Ok(())
}

/// Wait on a shared condvar. The caller must hold `m`. Returns `Ok(true)` if
/// signalled, `Ok(false)` on timeout.
///
/// # Safety
/// `c` and `m` must point to initialised shared primitives; `m` is held.
pub unsafe fn cond_wait(c: *mut RawCond, m: *mut RawMutex, timeout_ms: Option<u64>) -> Result<bool> {
    let cond_ptr = &mut (*c).inner as *mut libc::pthread_cond_t;
    let mtx_ptr = &mut (*m).inner as *mut libc::pthread_mutex_t;

    match timeout_ms {
        None => {
            let eno = libc::pthread_cond_wait(cond_ptr, mtx_ptr);
            if eno != 0 {
                return Err(WorldError::errno_bug("pthread_cond_wait", eno));
            }
            Ok(true)
        }
        Some(ms) => {
            let ts = abstime_from_now(ms);
            let eno = libc::pthread_cond_timedwait(cond_ptr, mtx_ptr, &ts);
            match eno {
                0 => Ok(true),
                libc::ETIMEDOUT => Ok(false),
                _ => Err(WorldError::errno_bug("pthread_cond_timedwait", eno)),
            }
        }
    }
}

/// Wake all waiters.
///
/// # Safety
/// `c` must point to an initialised shared condvar.
pub unsafe fn cond_broadcast(c: *mut RawCond) -> Result<()> {
    let eno = libc::pthread_cond_broadcast(&mut (*c).inner);
    if eno != 0 {
        return Err(WorldError::errno_bug("pthread_cond_broadcast", eno));
    }
    Ok(())
}

fn abstime_from_now(ms: u64) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    let ns_total = ts.tv_nsec as u64 + (ms % 1000) * 1_000_000;
    ts.tv_sec += (ms / 1000) as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
    ts
}

// ---------------------------------------------------------------------------
// Process liveness
// ---------------------------------------------------------------------------

/// Whether a pid refers to a live process. This is the single liveness probe
/// behind lock stealing, reaction pruning and call peer detection.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Current process id.
pub fn current_pid() -> i32 {
    unsafe { libc::getpid() }
}

/// Pick the temp filesystem with the most available space from the usual
/// candidates. Used when a deployment asks for an automatic backing override
/// instead of POSIX shm.
pub fn largest_tmpfs() -> Option<PathBuf> {
    let candidates = ["/dev/shm", "/run/shm", "/tmp"];
    let mut best: Option<(u64, PathBuf)> = None;
    for dir in candidates {
        let Ok(c_path) = CString::new(dir) else {
            continue;
        };
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut st) } != 0 {
            continue;
        }
        let avail = st.f_bavail as u64 * st.f_bsize as u64;
        if best.as_ref().map(|(b, _)| avail > *b).unwrap_or(true) {
            best = Some((avail, PathBuf::from(dir)));
        }
    }
    best.map(|(_, p)| p)
}
