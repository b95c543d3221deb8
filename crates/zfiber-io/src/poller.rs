//! Edge-triggered epoll wrapper
//!
//! Thin layer over `epoll_create1`/`epoll_ctl`/`epoll_wait`. Every
//! registration is edge-triggered: after a readiness report the consumer
//! must drain the descriptor until it would block before expecting the
//! next report. `ERR`/`HUP` conditions surface as both directions so
//! waiters on either side get released.

use crate::fd_context::EventSet;
use std::os::unix::io::RawFd;
use zfiber_core::{FiberError, FiberResult};

/// One ready notification from `wait`
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    /// The registration token (the fd, or the reactor's wake sentinel)
    pub token: u64,
    /// Ready directions; ERR/HUP reported as both
    pub events: EventSet,
}

/// Wrapper over an epoll instance
pub struct Poller {
    epfd: RawFd,
}

fn epoll_bits(events: EventSet) -> u32 {
    let mut bits = libc::EPOLLET as u32;
    if events.contains(EventSet::READ) {
        bits |= libc::EPOLLIN as u32;
    }
    if events.contains(EventSet::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl Poller {
    pub fn new() -> FiberResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(FiberError::last_os_error());
        }
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: EventSet, token: u64) -> FiberResult<()> {
        let mut ev = libc::epoll_event {
            events: epoll_bits(events),
            u64: token,
        };
        let ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev as *mut libc::epoll_event
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, ptr) };
        if ret != 0 {
            return Err(FiberError::last_os_error());
        }
        Ok(())
    }

    /// Register `fd` for `events`, edge-triggered
    pub fn add(&self, fd: RawFd, events: EventSet, token: u64) -> FiberResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    /// Change the registered mask for `fd`
    pub fn modify(&self, fd: RawFd, events: EventSet, token: u64) -> FiberResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    /// Unregister `fd`
    pub fn remove(&self, fd: RawFd) -> FiberResult<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, EventSet::empty(), 0)
    }

    /// Block up to `timeout_ms` (-1 = indefinitely) and return the ready
    /// events. Retries on EINTR.
    pub fn wait(&self, timeout_ms: i32) -> FiberResult<Vec<PollEvent>> {
        const MAX_EVENTS: usize = 256;
        let mut raw: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout_ms)
            };
            if n >= 0 {
                break n as usize;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINTR {
                return Err(FiberError::Syscall(errno));
            }
        };

        let mut out = Vec::with_capacity(n);
        for ev in raw.iter().take(n) {
            let bits = ev.events;
            let mut events = EventSet::empty();
            if bits & libc::EPOLLIN as u32 != 0 {
                events |= EventSet::READ;
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                events |= EventSet::WRITE;
            }
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                // Release both sides; whichever operation retries will
                // pick up the real error from the descriptor.
                events |= EventSet::READ | EventSet::WRITE;
            }
            out.push(PollEvent {
                token: ev.u64,
                events,
            });
        }
        Ok(out)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
