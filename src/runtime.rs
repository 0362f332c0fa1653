//! Runtime lifecycle: init, work, stop.
//!
//! A [`Runtime`] owns one scheduler and one reactor. [`Runtime::work`]
//! spawns the scheduler fiber and a primary fiber for the caller's entry
//! procedure, switches the OS thread into the scheduler and returns once
//! every fiber has terminated. A [`Handle`] is the cheap, cloneable
//! reference passed into every fiber; fibers use it to spawn siblings,
//! build synchronization primitives and reach the reactor.
//!
//! ```
//! let rt = strand::Runtime::new();
//! rt.work(|h| {
//!     h.spawn(|_| println!("hello from a fiber")).unwrap();
//! })
//! .unwrap();
//! ```
//!
//! The runtime is strictly single-threaded: neither `Runtime` nor `Handle`
//! can cross threads, and exactly one fiber runs at any instant.

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::rc::{Rc, Weak};

use log::{debug, info, trace, warn};

use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::fiber::FiberId;
use crate::list::List;
use crate::reactor::Reactor;
use crate::sched::{self, Sched};
use crate::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

////////////////////////////////////////////////////////////////////////////////
// RuntimeInner
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct RuntimeInner {
    weak_self: Weak<RuntimeInner>,
    pub(crate) sched: RefCell<Sched>,
    pub(crate) reactor: RefCell<Reactor>,
    /// Saved context of whoever called `work`; the scheduler transfers here
    /// when its queues drain.
    comeback: UnsafeCell<Context>,
    stopped: Cell<bool>,
    stack_size: Cell<usize>,
    guard_pages: Cell<bool>,
    ignore_sigpipe: Cell<bool>,
    /// The first panic that escaped a fiber; re-raised when `work` returns.
    panic: RefCell<Option<Box<dyn Any + Send>>>,
}

impl RuntimeInner {
    /// A fresh handle. Callable from anywhere inside the runtime: the inner
    /// state is kept alive by the `Runtime`, which cannot be dropped while
    /// `work` is on the call stack.
    pub(crate) fn handle(&self) -> Handle {
        Handle {
            inner: self.weak_self.upgrade().expect("the runtime is alive"),
        }
    }

    #[inline]
    pub(crate) fn comeback_ptr(&self) -> *mut Context {
        self.comeback.get()
    }

    #[inline]
    pub(crate) fn default_stack_size(&self) -> usize {
        self.stack_size.get()
    }

    #[inline]
    pub(crate) fn guard_pages(&self) -> bool {
        self.guard_pages.get()
    }

    pub(crate) fn store_panic(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.panic.borrow_mut();
        // Keep the first one; later panics are usually collateral.
        if slot.is_none() {
            *slot = Some(payload);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Runtime factory with the configurable knobs.
///
/// ```
/// let rt = strand::runtime::Builder::new()
///     .stack_size(256 * 1024)
///     .unwrap()
///     .guard_pages(true)
///     .build();
/// # drop(rt);
/// ```
#[derive(Debug)]
pub struct Builder {
    stack_size: usize,
    guard_pages: bool,
    ignore_sigpipe: bool,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            guard_pages: true,
            ignore_sigpipe: true,
        }
    }

    /// Default stack size for fibers of this runtime. Sizes below the
    /// platform minimum are rejected with [`Error::BadArgument`].
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::BadArgument("stack size is below the minimum"));
        }
        self.stack_size = stack_size;
        Ok(self)
    }

    /// Whether fiber stacks get a read-protected guard page at the low end.
    /// On by default; running off the stack then faults instead of
    /// corrupting the neighbouring mapping.
    pub fn guard_pages(mut self, enabled: bool) -> Self {
        self.guard_pages = enabled;
        self
    }

    /// Whether `work` sets the process-wide SIGPIPE disposition to ignore.
    /// On by default: a fiber writing into a half-closed socket should see
    /// EPIPE from `write`, not a fatal signal.
    pub fn ignore_sigpipe(mut self, enabled: bool) -> Self {
        self.ignore_sigpipe = enabled;
        self
    }

    pub fn build(self) -> Runtime {
        let inner = Rc::new_cyclic(|weak_self| RuntimeInner {
            weak_self: weak_self.clone(),
            sched: RefCell::new(Sched::new()),
            reactor: RefCell::new(Reactor::new()),
            comeback: UnsafeCell::new(Context::default()),
            stopped: Cell::new(false),
            stack_size: Cell::new(self.stack_size),
            guard_pages: Cell::new(self.guard_pages),
            ignore_sigpipe: Cell::new(self.ignore_sigpipe),
            panic: RefCell::new(None),
        });
        Runtime { inner }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Runtime
////////////////////////////////////////////////////////////////////////////////

/// An owned fiber runtime. Dropping it releases everything; a runtime that
/// never ran `work` can be dropped freely.
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// A runtime with default configuration. See [`Builder`] for the knobs.
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// A handle usable before `work` starts, e.g. to share with signal
    /// plumbing that will call [`Handle::stop`].
    pub fn handle(&self) -> Handle {
        self.inner.handle()
    }

    /// Reconfigure the default fiber stack size between `work` cycles.
    pub fn set_stack_size(&self, stack_size: usize) -> Result<()> {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::BadArgument("stack size is below the minimum"));
        }
        self.inner.stack_size.set(stack_size);
        Ok(())
    }

    /// Start the work cycle: run `entry` on the primary fiber and every
    /// fiber transitively spawned from it, until all of them terminate.
    ///
    /// Returns an error if the initial fibers cannot be spawned. A panic
    /// escaping any fiber is re-raised here after the runtime has wound
    /// down.
    pub fn work<F>(&self, entry: F) -> Result<()>
    where
        F: FnOnce(&Handle) + 'static,
    {
        let rt = &*self.inner;
        if rt.sched.borrow().sched_fiber.is_some() {
            return Err(Error::InProgress);
        }
        info!("start work cycle");
        if rt.ignore_sigpipe.get() {
            unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        }

        let stack_size = rt.default_stack_size();
        let guard = rt.guard_pages();
        let primary = sched::spawn(
            rt,
            Some("main".into()),
            stack_size,
            guard,
            Box::new(move |rt: &RuntimeInner| {
                let handle = rt.handle();
                entry(&handle);
            }),
        )?;
        let scheduler = sched::spawn(
            rt,
            Some("scheduler".into()),
            stack_size,
            guard,
            Box::new(move |rt: &RuntimeInner| sched::scheduler_main(rt, primary)),
        );
        let scheduler = match scheduler {
            Ok(id) => id,
            Err(e) => {
                let _ = rt.sched.borrow_mut().fibers.remove(primary);
                return Err(e);
            }
        };

        let to_ctx = {
            let mut s = rt.sched.borrow_mut();
            s.sched_fiber = Some(scheduler);
            s.current = Some(scheduler);
            s.fibers.get(scheduler).context_ptr()
        };
        trace!("context switch {{init}} -> {{scheduler}}");
        unsafe { context::switch(rt.comeback_ptr(), to_ctx) };

        // The scheduler transferred back: every queue has drained. Reclaim
        // the scheduler fiber and whatever a buggy program left suspended
        // forever.
        let leaked = {
            let mut s = rt.sched.borrow_mut();
            let _ = s.fibers.remove(scheduler);
            s.sched_fiber = None;
            s.current = None;
            s.reactor_fiber = None;
            s.ready = List::new();
            s.terminated = List::new();
            s.iowait = 0;
            let leaked = s.fibers.len();
            s.fibers.clear();
            leaked
        };
        rt.reactor.borrow_mut().reset();
        if leaked > 0 {
            warn!("{leaked} fiber(s) never completed and were dropped");
        }
        if let Some(payload) = rt.panic.borrow_mut().take() {
            debug!("re-raising a panic caught in a fiber");
            std::panic::resume_unwind(payload);
        }
        info!("work cycle done");
        Ok(())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("stack_size", &self.inner.stack_size.get())
            .field("stopped", &self.inner.stopped.get())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Handle
////////////////////////////////////////////////////////////////////////////////

/// A cloneable reference to a runtime, passed into every fiber entry.
pub struct Handle {
    inner: Rc<RuntimeInner>,
}

impl Handle {
    #[inline(always)]
    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.inner
    }

    /// Spawn a fiber with default settings and queue it at the back of the
    /// ready queue. Use [`fiber::Builder`](crate::fiber::Builder) to set a
    /// name or a stack size.
    pub fn spawn<F>(&self, f: F) -> Result<FiberId>
    where
        F: FnOnce(&Handle) + 'static,
    {
        crate::fiber::Builder::new().proc(f).spawn(self)
    }

    /// Request graceful shutdown: set the stop flag examined by long-running
    /// fibers. Idempotent, does not yield, reports nothing; the work cycle
    /// ends once every fiber observes the flag and returns.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
    }

    /// Whether [`stop`](Self::stop) has been requested. Long-running fibers
    /// are expected to poll this and wind down.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.get()
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}
