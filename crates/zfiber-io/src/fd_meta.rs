//! Per-descriptor metadata for the syscall hook
//!
//! Tracks what the hook needs to know about a descriptor: whether it is
//! a socket, the real (kernel) and user-visible non-blocking flags, and
//! the per-direction timeouts set through `SO_RCVTIMEO`/`SO_SNDTIMEO`.
//!
//! Sockets are force-set to non-blocking when their metadata is created;
//! the flag the user asked for is tracked separately so `fcntl(F_GETFL)`
//! can keep up appearances.

use crate::hook;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Which direction a timeout governs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

impl TimeoutKind {
    /// Map a `SOL_SOCKET` option name to a timeout direction
    pub fn from_sockopt(optname: libc::c_int) -> Option<TimeoutKind> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

/// Hook-relevant state of one descriptor
pub struct FdMetadata {
    fd: RawFd,
    initialized: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,

    /// Per-direction timeouts in ms; 0 means infinite
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdMetadata {
    /// Probe the descriptor and, for sockets, force `O_NONBLOCK` at the
    /// kernel level through the original (un-hooked) `fcntl`.
    fn new(fd: RawFd) -> Self {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let (initialized, is_socket) = if unsafe { libc::fstat(fd, &mut st) } == -1 {
            (false, false)
        } else {
            (true, (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK)
        };

        let mut sys_nonblock = false;
        if is_socket {
            let flags = hook::orig_fcntl(fd, libc::F_GETFL, 0);
            if flags != -1 {
                if flags & libc::O_NONBLOCK == 0 {
                    hook::orig_fcntl(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long);
                }
                sys_nonblock = true;
            }
            log::debug!("fd metadata created for socket: fd={}", fd);
        }

        Self {
            fd,
            initialized,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(0),
            send_timeout_ms: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Relaxed);
    }

    /// The blocking mode the user asked for (what `F_GETFL` reports)
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Per-direction timeout in ms; 0 means infinite
    pub fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

const INITIAL_CAPACITY: usize = 64;

/// Process-wide fd -> metadata table
pub struct FdMetaTable {
    slots: RwLock<Vec<Option<Arc<FdMetadata>>>>,
}

impl FdMetaTable {
    fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; INITIAL_CAPACITY]),
        }
    }

    /// The singleton used by the hook layer
    pub fn instance() -> &'static FdMetaTable {
        static INSTANCE: OnceLock<FdMetaTable> = OnceLock::new();
        INSTANCE.get_or_init(FdMetaTable::new)
    }

    /// Look up metadata for `fd`, creating (and probing) it when
    /// `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdMetadata>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                if let Some(meta) = &slots[idx] {
                    return Some(meta.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let old = slots.len();
            let want = (idx + 1).max(old + old / 2);
            slots.resize(want, None);
        }
        Some(
            slots[idx]
                .get_or_insert_with(|| Arc::new(FdMetadata::new(fd)))
                .clone(),
        )
    }

    /// Forget `fd` (hooked `close`)
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}
