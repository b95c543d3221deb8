//! libc interposition layer
//!
//! Exports `#[no_mangle]` definitions of the blocking libc subset so
//! they shadow libc at link time, with the real entry points resolved
//! once through `dlsym(RTLD_NEXT, ..)`. A thread-local enable flag gates
//! everything: with it clear (the default), every wrapper is a straight
//! pass-through and consumers see vanilla Linux behavior.
//!
//! With hooking enabled, inside a fiber:
//! - the sleep family becomes a reactor timer plus a yield;
//! - socket I/O that would block parks the fiber in an fd waiter slot
//!   and retries on wakeup, honoring `SO_RCVTIMEO`/`SO_SNDTIMEO` as
//!   `ETIMEDOUT`;
//! - sockets stay non-blocking at the kernel level while `fcntl`/`ioctl`
//!   report the blocking mode the user asked for.

use crate::fd_context::{IoEvent, Waiter};
use crate::fd_meta::{FdMetaTable, TimeoutKind};
use crate::reactor;
use libc::{c_int, c_long, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use zfiber_runtime::Fiber;

// ── Hook enable flag ──

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Is cooperative interposition active on this thread?
#[inline]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Enable or disable cooperative interposition for this thread.
/// Typically called at the start of a scheduler worker (or from the
/// first fiber it runs).
pub fn set_hook_enabled(enable: bool) {
    HOOK_ENABLED.with(|c| c.set(enable));
}

/// Process-wide timeout for hooked `connect`, ms; 0 means infinite
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(0);

pub fn set_connect_timeout_ms(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Relaxed);
}

// ── Original entry points ──

struct OriginalFns {
    sleep: unsafe extern "C" fn(c_uint) -> c_uint,
    usleep: unsafe extern "C" fn(libc::useconds_t) -> c_int,
    nanosleep: unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> c_int,
    socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    connect: unsafe extern "C" fn(c_int, *const libc::sockaddr, socklen_t) -> c_int,
    accept: unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut socklen_t) -> c_int,
    read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t,
    readv: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t,
    recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t,
    recvfrom: unsafe extern "C" fn(
        c_int,
        *mut c_void,
        size_t,
        c_int,
        *mut libc::sockaddr,
        *mut socklen_t,
    ) -> ssize_t,
    recvmsg: unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> ssize_t,
    write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t,
    writev: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t,
    send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
    sendto: unsafe extern "C" fn(
        c_int,
        *const c_void,
        size_t,
        c_int,
        *const libc::sockaddr,
        socklen_t,
    ) -> ssize_t,
    sendmsg: unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> ssize_t,
    fcntl: unsafe extern "C" fn(c_int, c_int, c_long) -> c_int,
    ioctl: unsafe extern "C" fn(c_int, c_ulong, *mut c_void) -> c_int,
    close: unsafe extern "C" fn(c_int) -> c_int,
    setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int,
    getsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int,
}

unsafe fn must_resolve(name: &'static std::ffi::CStr) -> *mut c_void {
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    if sym.is_null() {
        // Without the real entry point every wrapped call would recurse
        // into itself; nothing sensible can run.
        panic!("dlsym(RTLD_NEXT, {:?}) failed", name);
    }
    sym
}

macro_rules! resolve {
    ($name:literal) => {
        std::mem::transmute(must_resolve($name))
    };
}

fn originals() -> &'static OriginalFns {
    static ORIGINALS: OnceLock<OriginalFns> = OnceLock::new();
    ORIGINALS.get_or_init(|| unsafe {
        OriginalFns {
            sleep: resolve!(c"sleep"),
            usleep: resolve!(c"usleep"),
            nanosleep: resolve!(c"nanosleep"),
            socket: resolve!(c"socket"),
            connect: resolve!(c"connect"),
            accept: resolve!(c"accept"),
            read: resolve!(c"read"),
            readv: resolve!(c"readv"),
            recv: resolve!(c"recv"),
            recvfrom: resolve!(c"recvfrom"),
            recvmsg: resolve!(c"recvmsg"),
            write: resolve!(c"write"),
            writev: resolve!(c"writev"),
            send: resolve!(c"send"),
            sendto: resolve!(c"sendto"),
            sendmsg: resolve!(c"sendmsg"),
            fcntl: resolve!(c"fcntl"),
            ioctl: resolve!(c"ioctl"),
            close: resolve!(c"close"),
            setsockopt: resolve!(c"setsockopt"),
            getsockopt: resolve!(c"getsockopt"),
        }
    })
}

/// Un-hooked `fcntl` for internal bookkeeping (metadata init must flip
/// the real kernel flag, not the user-visible one)
pub(crate) fn orig_fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    unsafe { (originals().fcntl)(fd, cmd, arg) }
}

// ── errno plumbing ──

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(value: c_int) {
    unsafe {
        *libc::__errno_location() = value;
    }
}

/// The current fiber, but only when it is a real one (not a thread's
/// main placeholder, which has no switch target to yield through).
fn current_real_fiber() -> Option<Arc<Fiber>> {
    if !zfiber_runtime::tls::is_in_fiber() {
        return None;
    }
    Fiber::current()
}

// ── Generic blocking-I/O template ──

/// Wrap one socket operation: call the original, and when it would
/// block, park the current fiber on the matching direction (with the
/// descriptor's per-direction timeout, when set) and retry after the
/// wakeup. Edge-triggered readiness plus the one-shot waiter plus this
/// outer loop implement "ready, then drain until EAGAIN".
unsafe fn do_io<F>(
    fd: c_int,
    event: IoEvent,
    timeout_kind: TimeoutKind,
    name: &str,
    mut call: F,
) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enabled() {
        return call();
    }
    let Some(meta) = FdMetaTable::instance().get(fd, false) else {
        return call();
    };
    if meta.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return call();
    }

    let timeout_ms = meta.timeout_ms(timeout_kind);
    // 0 = still waiting; otherwise the errno a canceller decided on.
    let cancel_state = Arc::new(AtomicI32::new(0));

    loop {
        let mut n = call();
        while n == -1 && errno() == libc::EINTR {
            n = call();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let Some(fiber) = current_real_fiber() else {
            // Hook enabled outside a fiber: nothing to suspend, so the
            // caller gets the raw would-block result.
            return n;
        };
        let core = reactor::hook_core();

        let timer = if timeout_ms > 0 {
            let weak_state = Arc::downgrade(&cancel_state);
            let weak_core = Arc::downgrade(&core);
            Some(core.add_timer(
                timeout_ms,
                move || {
                    let Some(state) = weak_state.upgrade() else {
                        return;
                    };
                    if state.swap(libc::ETIMEDOUT, Ordering::SeqCst) != 0 {
                        return;
                    }
                    if let Some(core) = weak_core.upgrade() {
                        let _ = core.cancel_event(fd, event);
                    }
                },
                false,
            ))
        } else {
            None
        };

        if let Err(e) = core.add_event_waiter(fd, event, Waiter::Fiber(fiber)) {
            log::warn!(
                "hooked {} failed to arm {} wait: fd={}, error={}",
                name,
                event.name(),
                fd,
                e
            );
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return -1;
        }

        let _ = Fiber::yield_now();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = cancel_state.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Readiness (or a cancel with no data): retry the original.
    }
}

/// Sleep family body: arm a timer that reschedules the current fiber,
/// then yield. Err means the caller should fall back to the original.
fn cooperative_sleep_ms(ms: u64) -> Result<(), ()> {
    if !is_hook_enabled() {
        return Err(());
    }
    let Some(fiber) = current_real_fiber() else {
        return Err(());
    };
    let core = reactor::hook_core();
    let scheduler = core.scheduler().clone();
    let timer = core.add_timer(
        ms,
        move || {
            scheduler.schedule(fiber.clone());
        },
        false,
    );
    if Fiber::yield_now().is_err() {
        timer.cancel();
        return Err(());
    }
    Ok(())
}

// ── Hooked entry points ──

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    match cooperative_sleep_ms(seconds as u64 * 1000) {
        Ok(()) => 0,
        Err(()) => (originals().sleep)(seconds),
    }
}

#[no_mangle]
pub unsafe extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    match cooperative_sleep_ms(usec as u64 / 1000) {
        Ok(()) => 0,
        Err(()) => (originals().usleep)(usec),
    }
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(
    req: *const libc::timespec,
    rem: *mut libc::timespec,
) -> c_int {
    if req.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
    match cooperative_sleep_ms(ms) {
        Ok(()) => 0,
        Err(()) => (originals().nanosleep)(req, rem),
    }
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (originals().socket)(domain, ty, protocol);
    if !is_hook_enabled() || fd < 0 {
        return fd;
    }
    // Creates the metadata entry and forces O_NONBLOCK on the socket.
    FdMetaTable::instance().get(fd, true);
    log::debug!("hooked socket: fd={}", fd);
    fd
}

unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    let orig = originals().connect;
    if !is_hook_enabled() {
        return orig(fd, addr, addrlen);
    }
    let Some(meta) = FdMetaTable::instance().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if meta.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return orig(fd, addr, addrlen);
    }

    let n = orig(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if !(n == -1 && errno() == libc::EINPROGRESS) {
        return n;
    }

    let Some(fiber) = current_real_fiber() else {
        return n;
    };
    let core = reactor::hook_core();
    let cancel_state = Arc::new(AtomicI32::new(0));

    let timer = if timeout_ms > 0 {
        let weak_state = Arc::downgrade(&cancel_state);
        let weak_core = Arc::downgrade(&core);
        Some(core.add_timer(
            timeout_ms,
            move || {
                let Some(state) = weak_state.upgrade() else {
                    return;
                };
                if state.swap(libc::ETIMEDOUT, Ordering::SeqCst) != 0 {
                    return;
                }
                if let Some(core) = weak_core.upgrade() {
                    let _ = core.cancel_event(fd, IoEvent::Write);
                }
            },
            false,
        ))
    } else {
        None
    };

    if let Err(e) = core.add_event_waiter(fd, IoEvent::Write, Waiter::Fiber(fiber)) {
        log::warn!("hooked connect failed to arm write wait: fd={}, error={}", fd, e);
        if let Some(timer) = &timer {
            timer.cancel();
        }
        return -1;
    }

    let _ = Fiber::yield_now();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    let cancelled = cancel_state.load(Ordering::SeqCst);
    if cancelled != 0 {
        set_errno(cancelled);
        return -1;
    }

    // Connection attempt resolved; fetch its outcome.
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    (originals().getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len,
    );
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    connect_with_timeout(fd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::Relaxed))
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let orig = originals().accept;
    let fd = do_io(sockfd, IoEvent::Read, TimeoutKind::Recv, "accept", || {
        orig(sockfd, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 && is_hook_enabled() {
        // The accepted socket gets metadata and the forced O_NONBLOCK
        // just like a hooked socket().
        FdMetaTable::instance().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let orig = originals().read;
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, "read", || {
        orig(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    let orig = originals().readv;
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, "readv", || {
        orig(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    let orig = originals().recv;
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, "recv", || {
        orig(fd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    let orig = originals().recvfrom;
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, "recvfrom", || {
        orig(fd, buf, len, flags, src_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    let orig = originals().recvmsg;
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, "recvmsg", || {
        orig(fd, msg, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let orig = originals().write;
    do_io(fd, IoEvent::Write, TimeoutKind::Send, "write", || {
        orig(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    let orig = originals().writev;
    do_io(fd, IoEvent::Write, TimeoutKind::Send, "writev", || {
        orig(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    let orig = originals().send;
    do_io(fd, IoEvent::Write, TimeoutKind::Send, "send", || {
        orig(fd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    let orig = originals().sendto;
    do_io(fd, IoEvent::Write, TimeoutKind::Send, "sendto", || {
        orig(fd, buf, len, flags, dest_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    let orig = originals().sendmsg;
    do_io(fd, IoEvent::Write, TimeoutKind::Send, "sendmsg", || {
        orig(fd, msg, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if is_hook_enabled() {
        if let Some(meta) = FdMetaTable::instance().get(fd, false) {
            let core = reactor::hook_core();
            let _ = core.del_event(fd, IoEvent::Read);
            let _ = core.del_event(fd, IoEvent::Write);
            meta.set_closed();
            FdMetaTable::instance().remove(fd);
            log::debug!("hooked close: fd={}", fd);
        }
    }
    (originals().close)(fd)
}

/// `fcntl` is variadic in libc; every argument-carrying command on
/// Linux takes a single machine word, and int and pointer payloads
/// travel in the same argument register, so one `c_long` covers the
/// whole command set.
#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    let orig = originals().fcntl;
    match cmd {
        libc::F_SETFL => {
            match FdMetaTable::instance().get(fd, false) {
                Some(meta) if meta.is_socket() && !meta.is_closed() => {
                    let mut flags = arg as c_int;
                    meta.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    // The kernel flag tracks what the runtime needs, not
                    // what the user asked for.
                    if meta.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    orig(fd, cmd, flags as c_long)
                }
                _ => orig(fd, cmd, arg),
            }
        }
        libc::F_GETFL => {
            let flags = orig(fd, cmd, 0);
            if flags == -1 {
                return flags;
            }
            match FdMetaTable::instance().get(fd, false) {
                Some(meta) if meta.is_socket() && !meta.is_closed() => {
                    if meta.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => orig(fd, cmd, arg),
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, argp: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !argp.is_null() {
        if let Some(meta) = FdMetaTable::instance().get(fd, false) {
            if meta.is_socket() && !meta.is_closed() {
                meta.set_user_nonblock(*(argp as *const c_int) != 0);
                // The descriptor must stay non-blocking at the kernel
                // level; the user's request is bookkeeping only.
                return 0;
            }
        }
    }
    (originals().ioctl)(fd, request, argp)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    let orig = originals().setsockopt;
    if !is_hook_enabled() {
        return orig(fd, level, optname, optval, optlen);
    }
    if level == libc::SOL_SOCKET {
        if let Some(kind) = TimeoutKind::from_sockopt(optname) {
            if let Some(meta) = FdMetaTable::instance().get(fd, false) {
                if !optval.is_null() && (optlen as usize) >= std::mem::size_of::<libc::timeval>() {
                    let tv = &*(optval as *const libc::timeval);
                    let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
                    meta.set_timeout_ms(kind, ms);
                }
            }
        }
    }
    orig(fd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (originals().getsockopt)(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HookGuard;

    impl HookGuard {
        fn enable() -> Self {
            set_hook_enabled(true);
            HookGuard
        }
    }

    impl Drop for HookGuard {
        fn drop(&mut self) {
            set_hook_enabled(false);
        }
    }

    #[test]
    fn test_disabled_hook_is_passthrough() {
        assert!(!is_hook_enabled());
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        // These resolve to the hooked symbols in this binary; with the
        // flag clear they must behave exactly like libc.
        let n = unsafe { libc::write(fds[1], b"hello".as_ptr().cast(), 5) };
        assert_eq!(n, 5);
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(fds[0], buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_user_nonblock_visibility() {
        let _guard = HookGuard::enable();

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        // The hook forced O_NONBLOCK on the kernel descriptor...
        let real = orig_fcntl(fd, libc::F_GETFL, 0);
        assert!(real & libc::O_NONBLOCK != 0);
        // ...but the user never asked for it, so F_GETFL hides it.
        let seen = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_eq!(seen & libc::O_NONBLOCK, 0);

        // F_SETFL with O_NONBLOCK: now the user sees it.
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, seen | libc::O_NONBLOCK) };
        assert_eq!(ret, 0);
        let seen = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(seen & libc::O_NONBLOCK != 0);

        // Clearing it again hides it again, while the kernel flag stays.
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, seen & !libc::O_NONBLOCK) };
        assert_eq!(ret, 0);
        let seen = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_eq!(seen & libc::O_NONBLOCK, 0);
        assert!(orig_fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_ioctl_fionbio_is_bookkeeping_only() {
        let _guard = HookGuard::enable();

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let mut on: c_int = 1;
        let ret = unsafe { libc::ioctl(fd, libc::FIONBIO, &mut on as *mut c_int) };
        assert_eq!(ret, 0);
        let seen = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(seen & libc::O_NONBLOCK != 0);

        let mut off: c_int = 0;
        let ret = unsafe { libc::ioctl(fd, libc::FIONBIO, &mut off as *mut c_int) };
        assert_eq!(ret, 0);
        let seen = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_eq!(seen & libc::O_NONBLOCK, 0);

        // The kernel descriptor never left non-blocking mode.
        assert!(orig_fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_setsockopt_records_timeouts() {
        let _guard = HookGuard::enable();

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        assert_eq!(ret, 0);

        let meta = FdMetaTable::instance().get(fd, false).unwrap();
        assert_eq!(meta.timeout_ms(TimeoutKind::Recv), 1500);
        assert_eq!(meta.timeout_ms(TimeoutKind::Send), 0);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_close_forgets_metadata() {
        let _guard = HookGuard::enable();

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        assert!(FdMetaTable::instance().get(fd, false).is_some());

        unsafe { libc::close(fd) };
        assert!(FdMetaTable::instance().get(fd, false).is_none());
    }
}
