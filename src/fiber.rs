//! Cooperative multitasking module.
//!
//! With the fiber module, you can:
//! - create and run fibers through the [`Builder`] or [`Handle::spawn`],
//! - hand the CPU around explicitly with [`reschedule`] and [`yield_to`],
//! - synchronize fibers with [`Cond`], [`Latch`] and [`mutex::Mutex`].
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! exactly one fiber runs at any instant, and context switches happen only
//! at explicit suspension points (a yield, a contended lock, a condition
//! wait, or I/O that would block). Between suspension points a fiber has
//! exclusive access to everything the runtime owns, which is why the
//! primitives here need none of the atomics a preemptive implementation
//! would.
//!
//! [`Handle::spawn`]: crate::runtime::Handle::spawn

use std::cell::{Cell, RefCell};

use crate::error::{Error, Result};
use crate::list::List;
use crate::runtime::{Handle, RuntimeInner};
use crate::sched::{self, FiberState, Sched};
use crate::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

pub mod mutex;
pub use mutex::Mutex;

/// Identifier of a spawned fiber, unique among the live fibers of one
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) crate::list::Index);

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it. The currently
/// supported configurations are:
///
/// * `name`:       an associated name for diagnostics and switch logs
/// * `stack_size`: the stack size for the new fiber
/// * `proc`:       the fiber procedure
///
/// ```no_run
/// use strand::fiber;
///
/// let rt = strand::Runtime::new();
/// rt.work(|h| {
///     fiber::Builder::new()
///         .name("worker")
///         .proc(|_| println!("I'm a fiber"))
///         .spawn(h)
///         .unwrap();
/// })
/// .unwrap();
/// ```
pub struct Builder<F = NoProc> {
    name: Option<String>,
    stack_size: Option<usize>,
    f: F,
}

/// A *typestate* helper representing a [`Builder`] that has not been
/// assigned a fiber procedure yet.
pub struct NoProc;

impl Builder<NoProc> {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Builder {
            name: None,
            stack_size: None,
            f: NoProc,
        }
    }

    /// Sets the procedure for the new fiber.
    ///
    /// The procedure receives a [`Handle`] to the runtime it runs on. The
    /// `'static` bound means all captured state is moved into the fiber
    /// (shared state goes through `Rc`), so the fiber may outlive its
    /// spawner.
    pub fn proc<F>(self, f: F) -> Builder<F>
    where
        F: FnOnce(&Handle) + 'static,
    {
        Builder {
            name: self.name,
            stack_size: self.stack_size,
            f,
        }
    }
}

impl Default for Builder<NoProc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Builder<F> {
    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber. Sizes below
    /// the platform minimum are rejected with [`Error::BadArgument`].
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::BadArgument("stack size is below the minimum"));
        }
        self.stack_size = Some(stack_size);
        Ok(self)
    }
}

impl<F> Builder<F>
where
    F: FnOnce(&Handle) + 'static,
{
    /// Spawns the fiber and queues it at the back of the ready queue.
    ///
    /// Fibers can only be spawned while `work` is running, i.e. from
    /// another fiber; the primary fiber is created by
    /// [`Runtime::work`](crate::runtime::Runtime::work) itself. On
    /// allocation failure nothing is queued.
    pub fn spawn(self, handle: &Handle) -> Result<FiberId> {
        let Builder { name, stack_size, f } = self;
        let rt = handle.inner();
        if rt.sched.borrow().sched_fiber.is_none() {
            return Err(Error::UnexpectedState(
                "fibers can only be spawned from inside work()",
            ));
        }
        let entry: sched::Entry = Box::new(move |rt: &RuntimeInner| {
            let handle = rt.handle();
            f(&handle);
        });
        let id = sched::spawn(
            rt,
            name,
            stack_size.unwrap_or_else(|| rt.default_stack_size()),
            rt.guard_pages(),
            entry,
        )?;
        sched::resume(rt, id);
        Ok(id)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Default stack size of fibers whose builder does not override it, unless
/// reconfigured on the runtime.
pub const STACK_SIZE: usize = DEFAULT_STACK_SIZE;

/// Id of the calling fiber.
pub fn current(handle: &Handle) -> Result<FiberId> {
    sched::current(handle.inner())
}

/// Reschedule the calling fiber to the end of the ready queue and let
/// everything already queued run first.
pub fn reschedule(handle: &Handle) {
    sched::postpone(handle.inner())
}

/// Hand the CPU directly to `to`, informing the scheduler that the calling
/// fiber voluntarily releases it. The target must be ready or suspended;
/// a fiber owned by a wait queue or the reactor is reported as [busy].
/// The caller is placed at the back of the ready queue and resumes once
/// the scheduler gets around to it.
///
/// [busy]: Error::Busy
pub fn yield_to(handle: &Handle, to: FiberId) -> Result<()> {
    sched::yield_to(handle.inner(), to)
}

/// Best-effort diagnostic label of the calling fiber, as shown in context
/// switch logs.
pub fn name(handle: &Handle) -> String {
    let rt = handle.inner();
    let s = rt.sched.borrow();
    let id = s.current.expect("name() is called from a fiber");
    s.fibers.get(id).name.clone()
}

/// Rename the calling fiber.
pub fn set_name(handle: &Handle, name: impl Into<String>) {
    let rt = handle.inner();
    let mut s = rt.sched.borrow_mut();
    let id = s.current.expect("set_name() is called from a fiber");
    s.fibers.get_mut(id).name = name.into();
}

////////////////////////////////////////////////////////////////////////////////
// Context switch tracking
////////////////////////////////////////////////////////////////////////////////

/// Returns the number of context switches away from the calling fiber, or
/// the runtime-wide switch count when called outside of `work`.
pub fn csw(handle: &Handle) -> u64 {
    let s = handle.inner().sched.borrow();
    match s.current {
        Some(id) => s.fibers.get(id).csw.get(),
        None => s.total_csw,
    }
}

/// Possible [`check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The function didn't yield.
    DidntYield(T),
    /// The function did yield.
    Yielded(T),
}

/// Calls a function and checks whether it yielded. Mostly useful in tests.
///
/// ```no_run
/// # use strand::fiber::{self, YieldResult};
/// # let rt = strand::Runtime::new();
/// rt.work(|h| {
///     assert_eq!(
///         fiber::check_yield(h, || fiber::reschedule(h)),
///         YieldResult::Yielded(())
///     );
/// })
/// .unwrap();
/// ```
pub fn check_yield<F, T>(handle: &Handle, f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let csw_before = csw(handle);
    let res = f();
    if csw(handle) == csw_before {
        YieldResult::DidntYield(res)
    } else {
        YieldResult::Yielded(res)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Latch
////////////////////////////////////////////////////////////////////////////////

/// A recursive lock for the cooperative multitasking environment.
///
/// The latch is the raw ownership primitive: it tracks the owning fiber and
/// a FIFO queue of waiters, but carries no data. Locking while already
/// being the owner nests instead of deadlocking; the outermost release
/// hands ownership to the first waiter in line, which then finds itself the
/// owner when it resumes. For a data-carrying lock see [`mutex::Mutex`].
pub struct Latch {
    handle: Handle,
    owner: Cell<Option<FiberId>>,
    depth: Cell<usize>,
    waitqueue: RefCell<List>,
}

impl Latch {
    /// Create a new, unlocked latch.
    pub fn new(handle: &Handle) -> Self {
        Self {
            handle: handle.clone(),
            owner: Cell::new(None),
            depth: Cell::new(0),
            waitqueue: RefCell::new(List::new()),
        }
    }

    /// Lock the latch, suspending the calling fiber while another fiber
    /// owns it. Nested acquisitions by the owner return immediately.
    pub fn lock(&self) -> LatchGuard<'_> {
        let rt = self.handle.inner();
        let cur = sched::current(rt).expect("a latch is locked from a fiber");
        match self.owner.get() {
            None => {
                self.owner.set(Some(cur));
                self.depth.set(1);
            }
            Some(owner) if owner == cur => {
                self.depth.set(self.depth.get() + 1);
            }
            Some(_) => {
                {
                    let mut s = rt.sched.borrow_mut();
                    let Sched { fibers, .. } = &mut *s;
                    fibers.get(cur).state.set(FiberState::Waiting);
                    self.waitqueue.borrow_mut().push_back(fibers, cur.0);
                }
                sched::suspend(rt);
                // The releasing fiber transferred ownership before resuming
                // us.
                debug_assert_eq!(self.owner.get(), Some(cur));
                debug_assert_eq!(self.depth.get(), 1);
            }
        }
        LatchGuard { latch: self }
    }

    /// Try to lock the latch. Returns `None` instead of suspending when
    /// another fiber owns it. Does not yield.
    pub fn try_lock(&self) -> Option<LatchGuard<'_>> {
        let rt = self.handle.inner();
        let cur = sched::current(rt).expect("a latch is locked from a fiber");
        match self.owner.get() {
            None => {
                self.owner.set(Some(cur));
                self.depth.set(1);
            }
            Some(owner) if owner == cur => {
                self.depth.set(self.depth.get() + 1);
            }
            Some(_) => return None,
        }
        Some(LatchGuard { latch: self })
    }

    /// Whether the calling fiber owns the latch.
    pub fn is_held_by_current(&self) -> bool {
        let rt = self.handle.inner();
        sched::current(rt).ok() == self.owner.get() && self.owner.get().is_some()
    }

    fn unlock(&self) {
        let rt = self.handle.inner();
        let cur = sched::current(rt).expect("a latch is released from a fiber");
        assert_eq!(
            self.owner.get(),
            Some(cur),
            "latch released by a non-owner fiber"
        );
        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth > 0 {
            return;
        }
        let next = {
            let mut s = rt.sched.borrow_mut();
            let Sched { fibers, .. } = &mut *s;
            self.waitqueue.borrow_mut().pop_front(fibers).map(FiberId)
        };
        match next {
            None => self.owner.set(None),
            Some(next) => {
                // Hand ownership over and continue on the same tick; the new
                // owner runs when its turn in the ready queue comes.
                self.owner.set(Some(next));
                self.depth.set(1);
                sched::resume(rt, next);
            }
        }
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        debug_assert!(
            self.owner.get().is_none() && self.waitqueue.borrow().is_empty(),
            "latch dropped while locked"
        );
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch")
            .field("owner", &self.owner.get())
            .field("depth", &self.depth.get())
            .finish_non_exhaustive()
    }
}

/// An RAII implementation of a "scoped lock" of a latch. When this
/// structure is dropped (falls out of scope), the acquisition is undone;
/// the outermost release wakes the first waiter.
#[derive(Debug)]
pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl<'a> LatchGuard<'a> {
    pub(crate) fn latch(&self) -> &'a Latch {
        self.latch
    }
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.unlock()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Cond
////////////////////////////////////////////////////////////////////////////////

/// Condition variable for cooperative multitasking.
///
/// A cond is a synchronization primitive that allows fibers to yield until
/// some predicate is satisfied. Waiters queue in FIFO order and signals
/// respect that order strictly: if fiber A started waiting before fiber B,
/// A is resumed first. This is a stronger guarantee than POSIX
/// `pthread_cond` gives, and programs may rely on it.
///
/// ```no_run
/// use std::rc::Rc;
/// use strand::fiber::{mutex::Mutex, Cond};
///
/// let rt = strand::Runtime::new();
/// rt.work(|h| {
///     let state = Rc::new((Mutex::new(h, false), Cond::new(h)));
///     let consumer = state.clone();
///     h.spawn(move |_| {
///         let (lock, cond) = &*consumer;
///         let mut ready = lock.lock();
///         while !*ready {
///             ready = cond.wait(ready);
///         }
///     })
///     .unwrap();
///     let (lock, cond) = &*state;
///     *lock.lock() = true;
///     cond.signal();
/// })
/// .unwrap();
/// ```
pub struct Cond {
    handle: Handle,
    waitqueue: RefCell<List>,
}

impl Cond {
    /// Instantiate a new fiber cond object.
    pub fn new(handle: &Handle) -> Self {
        Self {
            handle: handle.clone(),
            waitqueue: RefCell::new(List::new()),
        }
    }

    /// Wake the fiber that has waited the longest. Does nothing if no one
    /// is waiting. Does not yield.
    pub fn signal(&self) {
        let rt = self.handle.inner();
        let next = {
            let mut s = rt.sched.borrow_mut();
            let Sched { fibers, .. } = &mut *s;
            self.waitqueue.borrow_mut().pop_front(fibers).map(FiberId)
        };
        if let Some(next) = next {
            sched::resume(rt, next);
        }
    }

    /// Wake up all waiting fibers, in the order they started waiting. Does
    /// not yield.
    pub fn broadcast(&self) {
        let rt = self.handle.inner();
        // Move the queue aside first: fibers woken here may start waiting
        // again before we are done, and those must not be woken twice.
        let mut waiters = List::new();
        self.waitqueue.borrow_mut().swap(&mut waiters);
        loop {
            let next = {
                let mut s = rt.sched.borrow_mut();
                let Sched { fibers, .. } = &mut *s;
                waiters.pop_front(fibers).map(FiberId)
            };
            match next {
                Some(next) => sched::resume(rt, next),
                None => break,
            }
        }
    }

    /// Release the mutex, wait for a signal, re-acquire.
    ///
    /// The release follows the same hand-off rule as a plain unlock, and
    /// from the cooperative-scheduling point of view the release and the
    /// enqueue are atomic: no other fiber runs in between.
    pub fn wait<'a, T: ?Sized>(&self, guard: mutex::MutexGuard<'a, T>) -> mutex::MutexGuard<'a, T> {
        let m = guard.mutex();
        self.park_current(move || drop(guard));
        m.lock()
    }

    /// [`wait`](Self::wait) for the raw [`Latch`].
    pub fn wait_latch<'a>(&self, guard: LatchGuard<'a>) -> LatchGuard<'a> {
        let latch = guard.latch();
        debug_assert_eq!(
            latch.depth.get(),
            1,
            "cond wait releases only the outermost acquisition"
        );
        self.park_current(move || drop(guard));
        latch.lock()
    }

    /// Enqueue the calling fiber, run `release` and yield to the scheduler.
    fn park_current(&self, release: impl FnOnce()) {
        let rt = self.handle.inner();
        let cur = sched::current(rt).expect("a cond is waited on from a fiber");
        {
            let mut s = rt.sched.borrow_mut();
            let Sched { fibers, .. } = &mut *s;
            fibers.get(cur).state.set(FiberState::Waiting);
            self.waitqueue.borrow_mut().push_back(fibers, cur.0);
        }
        release();
        sched::suspend(rt);
    }
}

impl Drop for Cond {
    fn drop(&mut self) {
        debug_assert!(
            self.waitqueue.borrow().is_empty(),
            "condition variable dropped with waiting fibers"
        );
    }
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cond")
            .field("waiters", &self.waitqueue.borrow().len())
            .finish_non_exhaustive()
    }
}
