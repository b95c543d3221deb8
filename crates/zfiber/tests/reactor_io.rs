//! End-to-end scenarios: reactor + scheduler + fibers + syscall hook
//!
//! Each test builds its own reactor so hook flags (thread-local to that
//! reactor's workers) never leak between tests.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use zfiber::{set_hook_enabled, Fiber, FdMetaTable, IoEvent, Reactor, Semaphore, SharedStackArena};

fn wait_until(timeout_ms: u64, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pred()
}

fn nonblocking_pipe() -> (libc::c_int, libc::c_int) {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

/// A fiber parks on the read end of a pipe; a 100 ms timer writes the
/// payload; the woken fiber reads exactly that payload.
#[test]
fn pipe_echo_through_fiber() {
    let reactor = Reactor::new(2, "e2e_pipe").unwrap();
    reactor.start();

    let (r, w) = nonblocking_pipe();
    let received = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let start = Instant::now();

    {
        let reactor2 = reactor.clone();
        let received = received.clone();
        let done = done.clone();
        reactor.schedule_fn(move || {
            reactor2.add_event(r, IoEvent::Read).unwrap();
            Fiber::yield_now().unwrap();

            // Readable now; drain it.
            let mut buf = [0u8; 64];
            let n = unsafe { libc::read(r, buf.as_mut_ptr().cast(), buf.len()) };
            assert!(n > 0);
            received.lock().unwrap().extend_from_slice(&buf[..n as usize]);
            done.store(true, Ordering::SeqCst);
        });
    }

    reactor.add_timer(
        100,
        move || {
            let msg = b"Hello IoScheduler!";
            let n = unsafe { libc::write(w, msg.as_ptr().cast(), msg.len()) };
            assert_eq!(n, msg.len() as isize);
        },
        false,
    );

    assert!(wait_until(1000, || done.load(Ordering::SeqCst)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(90), "timer fired early: {:?}", elapsed);
    assert_eq!(&*received.lock().unwrap(), b"Hello IoScheduler!");

    reactor.stop();
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

/// 100 fibers on 4 workers each call sleep(1); wall-clock is about one
/// second, not one hundred.
#[test]
fn hooked_sleep_is_cooperative() {
    let reactor = Reactor::new(4, "e2e_sleep").unwrap();
    reactor.start();

    let done = Arc::new(Semaphore::new(0));
    let start = Instant::now();

    for _ in 0..100 {
        let done = done.clone();
        reactor.schedule_fn(move || {
            set_hook_enabled(true);
            let ret = unsafe { libc::sleep(1) };
            assert_eq!(ret, 0);
            done.notify();
        });
    }

    for _ in 0..100 {
        done.wait();
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(950), "slept too little: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "sleeps were serialized: {:?}", elapsed);

    reactor.stop();
}

const REQUEST: &[u8] = b"GET /hello HTTP/1.1\r\nHost: zfiber\r\n\r\n";
const RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 17\r\nConnection: close\r\n\r\nHello IoScheduler";

fn read_exact_hooked(fd: libc::c_int, want: usize) -> Vec<u8> {
    let mut out = vec![0u8; want];
    let mut got = 0;
    while got < want {
        let n = unsafe {
            libc::read(fd, out[got..].as_mut_ptr().cast(), want - got)
        };
        assert!(n > 0, "read failed: {}", std::io::Error::last_os_error());
        got += n as usize;
    }
    out
}

fn write_all_hooked(fd: libc::c_int, mut data: &[u8]) {
    while !data.is_empty() {
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        assert!(n > 0, "write failed: {}", std::io::Error::last_os_error());
        data = &data[n as usize..];
    }
}

/// Accept loop: a hooked listener fiber serves one hooked client fiber
/// for a single request/response round trip.
#[test]
fn accept_loop_round_trip() {
    assert_eq!(REQUEST.len(), 37);
    assert_eq!(RESPONSE.len(), 75);

    let reactor = Reactor::new(2, "e2e_accept").unwrap();
    reactor.start();

    let (port_tx, port_rx) = std::sync::mpsc::channel::<u16>();
    let served = Arc::new(AtomicBool::new(false));
    let response_seen = Arc::new(Mutex::new(Vec::new()));

    {
        let served = served.clone();
        reactor.schedule_fn(move || {
            set_hook_enabled(true);
            unsafe {
                let lfd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                assert!(lfd >= 0);
                let one: libc::c_int = 1;
                libc::setsockopt(
                    lfd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    &one as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );

                let mut addr: libc::sockaddr_in = std::mem::zeroed();
                addr.sin_family = libc::AF_INET as libc::sa_family_t;
                addr.sin_addr.s_addr = u32::to_be(0x7f00_0001);
                addr.sin_port = 0;
                assert_eq!(
                    libc::bind(
                        lfd,
                        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    ),
                    0
                );
                let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                assert_eq!(
                    libc::getsockname(
                        lfd,
                        &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                        &mut len,
                    ),
                    0
                );
                assert_eq!(libc::listen(lfd, 16), 0);
                port_tx.send(u16::from_be(addr.sin_port)).unwrap();

                // Cooperative accept: the worker thread stays free while
                // this fiber waits for the client.
                let cfd = libc::accept(lfd, std::ptr::null_mut(), std::ptr::null_mut());
                assert!(cfd >= 0, "accept failed: {}", std::io::Error::last_os_error());

                let request = read_exact_hooked(cfd, REQUEST.len());
                assert_eq!(request, REQUEST);
                write_all_hooked(cfd, RESPONSE);

                assert_eq!(libc::close(cfd), 0);
                assert_eq!(libc::close(lfd), 0);
            }
            served.store(true, Ordering::SeqCst);
        });
    }

    let port = port_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("listener never published its port");

    {
        let response_seen = response_seen.clone();
        reactor.schedule_fn(move || {
            set_hook_enabled(true);
            unsafe {
                let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                assert!(fd >= 0);

                let mut addr: libc::sockaddr_in = std::mem::zeroed();
                addr.sin_family = libc::AF_INET as libc::sa_family_t;
                addr.sin_addr.s_addr = u32::to_be(0x7f00_0001);
                addr.sin_port = port.to_be();

                // Cooperative connect.
                let ret = libc::connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                );
                assert_eq!(ret, 0, "connect failed: {}", std::io::Error::last_os_error());

                write_all_hooked(fd, REQUEST);
                let response = read_exact_hooked(fd, RESPONSE.len());
                assert_eq!(libc::close(fd), 0);

                response_seen.lock().unwrap().extend_from_slice(&response);
            }
        });
    }

    assert!(wait_until(5000, || served.load(Ordering::SeqCst)));
    assert!(wait_until(5000, || !response_seen.lock().unwrap().is_empty()));
    assert_eq!(&*response_seen.lock().unwrap(), RESPONSE);

    reactor.stop();
}

/// A 50 ms recurring timer runs for 500 ms, then is cancelled; the fire
/// count lands near ten and stops advancing.
#[test]
fn recurring_timer_fire_count() {
    let reactor = Reactor::new(1, "e2e_recur").unwrap();
    reactor.start();

    let fires = Arc::new(AtomicUsize::new(0));
    let fires2 = fires.clone();
    let timer = reactor.add_timer(
        50,
        move || {
            fires2.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    std::thread::sleep(Duration::from_millis(500));
    timer.cancel();

    let count = fires.load(Ordering::SeqCst);
    assert!((8..=11).contains(&count), "fire count out of range: {}", count);

    // Cancelled: the count settles.
    std::thread::sleep(Duration::from_millis(120));
    assert!(fires.load(Ordering::SeqCst) <= count + 1);

    reactor.stop();
}

/// recv on an idle socket with SO_RCVTIMEO = 200 ms fails with
/// ETIMEDOUT near the deadline; once the peer sends, a second recv
/// returns the bytes.
#[test]
fn recv_times_out_then_succeeds() {
    let reactor = Reactor::new(2, "e2e_timeout").unwrap();
    reactor.start();

    let mut pair = [0 as libc::c_int; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) };
    assert_eq!(ret, 0);
    let (ours, theirs) = (pair[0], pair[1]);

    let timed_out = Arc::new(AtomicBool::new(false));
    let second_recv = Arc::new(AtomicI32::new(-1));
    let payload = Arc::new(Mutex::new(Vec::new()));

    {
        let timed_out = timed_out.clone();
        let second_recv = second_recv.clone();
        let payload = payload.clone();
        reactor.schedule_fn(move || {
            set_hook_enabled(true);
            unsafe {
                // socketpair is not an intercepted call, so adopt the
                // descriptor explicitly: this probes it and forces
                // O_NONBLOCK exactly like a hooked socket().
                FdMetaTable::instance().get(ours, true).unwrap();

                let tv = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 200_000,
                };
                assert_eq!(
                    libc::setsockopt(
                        ours,
                        libc::SOL_SOCKET,
                        libc::SO_RCVTIMEO,
                        &tv as *const libc::timeval as *const libc::c_void,
                        std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                    ),
                    0
                );

                let started = Instant::now();
                let mut buf = [0u8; 64];
                let n = libc::recv(ours, buf.as_mut_ptr().cast(), buf.len(), 0);
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                let elapsed = started.elapsed();

                assert_eq!(n, -1);
                assert_eq!(errno, libc::ETIMEDOUT);
                assert!(elapsed >= Duration::from_millis(150), "too fast: {:?}", elapsed);
                assert!(elapsed < Duration::from_millis(1500), "too slow: {:?}", elapsed);

                // Disarm the timeout before asking the peer to talk.
                let forever = libc::timeval { tv_sec: 0, tv_usec: 0 };
                libc::setsockopt(
                    ours,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &forever as *const libc::timeval as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                );
                timed_out.store(true, Ordering::SeqCst);

                let n = libc::recv(ours, buf.as_mut_ptr().cast(), buf.len(), 0);
                second_recv.store(n as i32, Ordering::SeqCst);
                if n > 0 {
                    payload.lock().unwrap().extend_from_slice(&buf[..n as usize]);
                }
                libc::close(ours);
            }
        });
    }

    assert!(wait_until(3000, || timed_out.load(Ordering::SeqCst)));
    let n = unsafe { libc::write(theirs, b"pong".as_ptr().cast(), 4) };
    assert_eq!(n, 4);

    assert!(wait_until(3000, || second_recv.load(Ordering::SeqCst) == 4));
    assert_eq!(&*payload.lock().unwrap(), b"pong");

    reactor.stop();
    unsafe {
        libc::close(theirs);
    }
}

/// Two fibers on one shared-stack buffer each park a distinct value in
/// a stack local across a suspension and read it back intact.
#[test]
fn shared_stack_fibers_on_scheduler() {
    let reactor = Reactor::new(1, "e2e_shared").unwrap();
    reactor.start();
    let scheduler = reactor.scheduler().clone();

    let arena = SharedStackArena::new(1, 64 * 1024);
    let out = Arc::new(Mutex::new(Vec::new()));

    let fibers: Vec<_> = (1..=2u64)
        .map(|tag| {
            let out = out.clone();
            let scheduler = scheduler.clone();
            Fiber::new_shared(
                move || {
                    let mine = tag * 100 + 11;
                    // Requeue ourselves, then give up the buffer to the
                    // other fiber.
                    let me = Fiber::current().unwrap();
                    scheduler.schedule(me);
                    Fiber::yield_now().unwrap();
                    out.lock().unwrap().push(mine);
                },
                &arena,
                Some("shared_e2e"),
            )
        })
        .collect();

    for fiber in &fibers {
        scheduler.schedule(fiber.clone());
    }

    assert!(wait_until(3000, || out.lock().unwrap().len() == 2));
    let mut values = out.lock().unwrap().clone();
    values.sort();
    assert_eq!(values, vec![111, 211]);

    reactor.stop();
}

/// The facade spawn goes through the lazily-started global reactor.
#[test]
fn facade_spawn_runs() {
    let hit = Arc::new(AtomicBool::new(false));
    let hit2 = hit.clone();
    zfiber::spawn(move || {
        hit2.store(true, Ordering::SeqCst);
    });
    assert!(wait_until(3000, || hit.load(Ordering::SeqCst)));
}
