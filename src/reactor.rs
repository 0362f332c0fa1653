//! Readiness reactor.
//!
//! One reactor per runtime. It keeps the list of `(fd, interest, fiber)`
//! registrations and runs on a fiber of its own: build a `pollfd` set from
//! the registrations, wait on the kernel, write the observed readiness into
//! each woken fiber's result slot, move those fibers back to the ready
//! queue, yield to the scheduler. The scheduler switches into the reactor
//! fiber only when the ready queue is empty and at least one fiber waits on
//! I/O, so the multiplexor never competes with runnable fibers.
//!
//! The reactor is the sole writer of a fiber's readiness slot while that
//! fiber is in iowait.

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use log::{debug, error, trace};

use crate::error::{Error, Result};
use crate::fiber::FiberId;
use crate::runtime::RuntimeInner;
use crate::sched;

bitflags! {
    /// Readiness interest and result mask.
    pub struct IoFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const ERROR = 0x4;
    }
}

/// Multiplexor timeout. A bounded wait keeps the reactor responsive to a
/// `request_shutdown` issued while the kernel has nothing to report.
const POLL_TIMEOUT_MS: libc::c_int = 1000;

struct Registration {
    fd: RawFd,
    interest: IoFlags,
    fiber: FiberId,
}

pub(crate) struct Reactor {
    registrations: Vec<Registration>,
    shutdown: Cell<bool>,
}

impl Reactor {
    pub(crate) fn new() -> Self {
        Self {
            registrations: Vec::new(),
            shutdown: Cell::new(false),
        }
    }

    /// Ask the reactor fiber to exit its loop at the next opportunity.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.set(true);
    }

    /// Forget all registrations and re-arm the loop for the next `work`.
    pub(crate) fn reset(&mut self) {
        self.registrations.clear();
        self.shutdown.set(false);
    }

    fn register(&mut self, fd: RawFd, interest: IoFlags, fiber: FiberId) {
        debug_assert!(
            self.registrations.iter().all(|r| r.fd != fd),
            "fd already has a live registration"
        );
        self.registrations.push(Registration { fd, interest, fiber });
    }
}

fn interest_to_poll(interest: IoFlags) -> libc::c_short {
    let mut events = 0;
    if interest.contains(IoFlags::READ) {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.contains(IoFlags::WRITE) {
        events |= libc::POLLOUT;
    }
    events
}

fn poll_to_events(revents: libc::c_short) -> IoFlags {
    let mut events = IoFlags::empty();
    // A hangup means the fd is readable to completion (read reports EOF),
    // not that the operation failed.
    if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLHUP) != 0 {
        events |= IoFlags::READ;
    }
    if revents & libc::POLLOUT != 0 {
        events |= IoFlags::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        events |= IoFlags::ERROR;
    }
    events
}

/// Register the current fiber's interest in `fd`, suspend until the kernel
/// reports readiness and return the observed event mask. A mask with only
/// [`IoFlags::ERROR`] set means the fd is in an error state.
pub(crate) fn wait(rt: &RuntimeInner, fd: RawFd, interest: IoFlags) -> Result<IoFlags> {
    if !interest.intersects(IoFlags::READ | IoFlags::WRITE) {
        return Err(Error::BadArgument("interest must include READ or WRITE"));
    }
    let current = sched::current(rt)?;
    rt.reactor.borrow_mut().register(fd, interest, current);
    {
        let s = rt.sched.borrow();
        s.fibers.get(current).io_events.set(IoFlags::empty());
    }
    trace!("fd {fd} waits for {interest:?}");
    sched::io_suspend(rt);
    let events = rt.sched.borrow().fibers.get(current).io_events.get();
    trace!("fd {fd} woke up with {events:?}");
    Ok(events)
}

/// The body of the reactor fiber.
pub(crate) fn reactor_main(rt: &RuntimeInner) {
    debug!("reactor is up");
    loop {
        if rt.reactor.borrow().shutdown.get() {
            break;
        }

        let mut pollfds: Vec<libc::pollfd> = {
            let reactor = rt.reactor.borrow();
            reactor
                .registrations
                .iter()
                .map(|r| libc::pollfd {
                    fd: r.fd,
                    events: interest_to_poll(r.interest),
                    revents: 0,
                })
                .collect()
        };
        if pollfds.is_empty() {
            // The scheduler only switches here when iowait > 0, so an empty
            // registration list is a transient state right after a wakeup
            // burst. Hand the CPU back.
            sched::suspend(rt);
            continue;
        }

        let nfd = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TIMEOUT_MS,
            )
        };
        if nfd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            error!("poll(2): {err}");
            break;
        }
        trace!("{nfd} fd(s) ready");
        if nfd == 0 {
            sched::suspend(rt);
            continue;
        }

        // Detach every woken registration first, resume second: io_resume
        // borrows the scheduler and fibers may not observe a half-updated
        // registration list once they run.
        let woken: Vec<(FiberId, IoFlags)> = {
            let mut reactor = rt.reactor.borrow_mut();
            let mut woken = Vec::with_capacity(nfd as usize);
            let mut slot = 0;
            reactor.registrations.retain(|r| {
                let events = poll_to_events(pollfds[slot].revents);
                slot += 1;
                if events.is_empty() {
                    return true;
                }
                woken.push((r.fiber, events));
                false
            });
            woken
        };
        for (fiber, events) in woken {
            rt.sched.borrow().fibers.get(fiber).io_events.set(events);
            sched::io_resume(rt, fiber);
        }
        sched::suspend(rt);
    }
    debug!("reactor terminated");
}
