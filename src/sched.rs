//! Cooperative scheduler.
//!
//! One scheduler drives all fibers of a runtime on a single OS thread. It
//! owns the fiber table, the ready and terminated queues and the iowait
//! counter; everything else in the crate manipulates fibers exclusively
//! through the helpers here (resume, suspend, io_suspend, io_resume,
//! postpone, terminate), so the queue-membership invariants live in one
//! place.
//!
//! The scheduler itself runs on a fiber. So does the reactor. The reactor
//! fiber is special in exactly one way: it is switched to only when the
//! ready queue is empty and at least one fiber is suspended on I/O, which
//! keeps the multiplexor from being polled while there is CPU work to do.

use std::cell::{Cell, UnsafeCell};

use log::{debug, error, trace};

use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::fiber::FiberId;
use crate::list::{Hook, Index, Links, List};
use crate::reactor::{self, IoFlags};
use crate::runtime::RuntimeInner;
use crate::stack::Stack;

/// Type-erased fiber entry point. Runs once on the fiber's own stack; the
/// runtime reference stays valid for the whole call because `work` does not
/// return while fibers exist.
pub(crate) type Entry = Box<dyn FnOnce(&RuntimeInner)>;

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// Where a fiber currently is. At any observable moment a fiber belongs to
/// at most one of these states; the intrusive hook enforces the queue part
/// of that invariant, the state enforces the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberState {
    /// In the ready queue (or the scheduler's local snapshot of it).
    Ready,
    /// The one fiber the CPU is executing.
    Running,
    /// Suspended until the reactor reports fd readiness.
    IoWait,
    /// Parked in a latch or condition variable wait queue.
    Waiting,
    /// Suspended and on no queue at all; someone must resume it explicitly.
    Suspended,
    /// In the terminated queue, waiting for the scheduler to free it.
    Terminated,
}

pub(crate) struct Fiber {
    pub(crate) id: FiberId,
    pub(crate) name: String,
    pub(crate) context: UnsafeCell<Context>,
    pub(crate) stack: Stack,
    pub(crate) entry: Option<Entry>,
    pub(crate) hook: Hook,
    pub(crate) state: Cell<FiberState>,
    /// Readiness mask slot; written only by the reactor while the fiber is
    /// in iowait.
    pub(crate) io_events: Cell<IoFlags>,
    /// Number of context switches away from this fiber.
    pub(crate) csw: Cell<u64>,
    /// The owning runtime. Fibers never outlive `work`, which never
    /// outlives the runtime.
    pub(crate) rt: *const RuntimeInner,
}

impl Fiber {
    #[inline(always)]
    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberTable
////////////////////////////////////////////////////////////////////////////////

/// Slab of live fibers. Fibers are boxed so their addresses stay stable
/// while the slab grows; the index doubles as the fiber id and as the
/// intrusive-list key.
pub(crate) struct FiberTable {
    slots: Vec<Option<Box<Fiber>>>,
    vacant: Vec<Index>,
}

impl FiberTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, mut fiber: Box<Fiber>) -> FiberId {
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as Index
            }
        };
        let id = FiberId(index);
        fiber.id = id;
        self.slots[index as usize] = Some(fiber);
        id
    }

    pub(crate) fn remove(&mut self, id: FiberId) -> Option<Box<Fiber>> {
        let fiber = self.slots.get_mut(id.0 as usize)?.take()?;
        self.vacant.push(id.0);
        Some(fiber)
    }

    #[inline]
    pub(crate) fn get(&self, id: FiberId) -> &Fiber {
        self.try_get(id).expect("fiber id refers to a live fiber")
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: FiberId) -> &mut Fiber {
        self.slots[id.0 as usize]
            .as_deref_mut()
            .expect("fiber id refers to a live fiber")
    }

    #[inline]
    pub(crate) fn try_get(&self, id: FiberId) -> Option<&Fiber> {
        self.slots.get(id.0 as usize)?.as_deref()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Drop every remaining fiber. Used by `work` teardown to reclaim
    /// fibers a buggy program left suspended forever.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
    }
}

impl Links for FiberTable {
    fn hook(&self, index: Index) -> &Hook {
        &self.get(FiberId(index)).hook
    }

    fn hook_mut(&mut self, index: Index) -> &mut Hook {
        &mut self.get_mut(FiberId(index)).hook
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sched
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Sched {
    pub(crate) fibers: FiberTable,
    /// Fibers waiting for CPU, FIFO.
    pub(crate) ready: List,
    /// Fibers that finished and wait for the scheduler to clean them up.
    pub(crate) terminated: List,
    /// Number of fibers suspended on I/O readiness.
    pub(crate) iowait: usize,
    pub(crate) current: Option<FiberId>,
    pub(crate) sched_fiber: Option<FiberId>,
    pub(crate) reactor_fiber: Option<FiberId>,
    /// Context switches performed by the runtime since `work` started.
    pub(crate) total_csw: u64,
}

impl Sched {
    pub(crate) fn new() -> Self {
        Self {
            fibers: FiberTable::new(),
            ready: List::new(),
            terminated: List::new(),
            iowait: 0,
            current: None,
            sched_fiber: None,
            reactor_fiber: None,
            total_csw: 0,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber lifecycle
////////////////////////////////////////////////////////////////////////////////

/// Entry frame of every fiber: runs the stored entry closure once and
/// terminates through the scheduler. A panicking entry is caught here and
/// re-raised by `work` after the runtime has wound down; unwinding must not
/// cross the boot frame.
extern "C" fn fiber_main(arg: usize) {
    let fiber = arg as *mut Fiber;
    let rt = unsafe { &*(*fiber).rt };
    {
        let entry = unsafe { (*fiber).entry.take() }.expect("fiber entry runs once");
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry(rt)));
        if let Err(payload) = caught {
            error!(
                "fiber {{{}}} panicked, the panic resumes once work() returns",
                unsafe { &(*fiber).name }
            );
            rt.store_panic(payload);
        }
    }
    terminate_current(rt);
}

/// Allocate a fiber and prepare it for its first activation. The fiber is
/// NOT placed on any queue; callers decide when it becomes ready.
pub(crate) fn spawn(
    rt: &RuntimeInner,
    name: Option<String>,
    stack_size: usize,
    guard_page: bool,
    entry: Entry,
) -> Result<FiberId> {
    let stack = Stack::new(stack_size, guard_page)?;
    let mut s = rt.sched.borrow_mut();
    let id = s.fibers.insert(Box::new(Fiber {
        id: FiberId(0), // patched by insert
        name: String::new(),
        context: UnsafeCell::new(Context::default()),
        stack,
        entry: Some(entry),
        hook: Hook::new(),
        state: Cell::new(FiberState::Suspended),
        io_events: Cell::new(IoFlags::empty()),
        csw: Cell::new(0),
        rt: rt as *const RuntimeInner,
    }));
    let fiber = s.fibers.get_mut(id);
    fiber.name = name.unwrap_or_else(|| format!("fiber.{}", id.0));
    let arg = fiber as *mut Fiber as usize;
    let top = fiber.stack.top();
    fiber.context = UnsafeCell::new(unsafe { Context::boot(top, fiber_main, arg) });
    debug!(
        "stack of {} bytes = {{{}}}",
        fiber.stack.size(),
        fiber.name
    );
    Ok(id)
}

////////////////////////////////////////////////////////////////////////////////
// Switching
////////////////////////////////////////////////////////////////////////////////

/// Switch execution from fiber `from` to fiber `to`, updating the
/// scheduler's notion of the current fiber first. No queue is touched.
///
/// All `RefCell` borrows are released before the actual switch: the borrow
/// guard would otherwise stay "held" on the suspended stack and poison every
/// other fiber's access to the scheduler.
pub(crate) fn transfer(rt: &RuntimeInner, from: FiberId, to: FiberId) {
    let (from_ctx, to_ctx);
    {
        let mut s = rt.sched.borrow_mut();
        trace!(
            "context switch {{{}}} -> {{{}}}",
            s.fibers.get(from).name,
            s.fibers.get(to).name
        );
        s.total_csw += 1;
        let f = s.fibers.get(from);
        f.csw.set(f.csw.get() + 1);
        s.current = Some(to);
        from_ctx = s.fibers.get(from).context_ptr();
        to_ctx = s.fibers.get(to).context_ptr();
    }
    unsafe { context::switch(from_ctx, to_ctx) };
}

#[inline]
fn current_and_scheduler(rt: &RuntimeInner) -> (FiberId, FiberId) {
    let s = rt.sched.borrow();
    (
        s.current.expect("a fiber is running"),
        s.sched_fiber.expect("the scheduler is running"),
    )
}

/// Id of the fiber the CPU is executing.
pub(crate) fn current(rt: &RuntimeInner) -> Result<FiberId> {
    rt.sched
        .borrow()
        .current
        .ok_or(Error::UnexpectedState("not inside a running fiber"))
}

/// Make `id` eligible to run: append it to the back of the ready queue.
pub(crate) fn resume(rt: &RuntimeInner, id: FiberId) {
    let mut s = rt.sched.borrow_mut();
    let Sched { ready, fibers, .. } = &mut *s;
    let fiber = fibers.get(id);
    debug_assert!(matches!(
        fiber.state.get(),
        FiberState::Suspended | FiberState::Waiting
    ));
    fiber.state.set(FiberState::Ready);
    trace!("resume {{{}}}", fiber.name);
    ready.push_back(fibers, id.0);
}

/// Yield from the current fiber back to the scheduler without queueing the
/// current fiber anywhere. The caller must have stored it somewhere it can
/// be resumed from (a wait queue, a reactor registration, ...).
pub(crate) fn suspend(rt: &RuntimeInner) {
    let (cur, sched_fiber) = current_and_scheduler(rt);
    {
        let s = rt.sched.borrow();
        let fiber = s.fibers.get(cur);
        // Callers that parked the fiber elsewhere have set a more specific
        // state already.
        if fiber.state.get() == FiberState::Running {
            fiber.state.set(FiberState::Suspended);
        }
    }
    transfer(rt, cur, sched_fiber);
}

/// Suspend the current fiber until the reactor wakes it.
pub(crate) fn io_suspend(rt: &RuntimeInner) {
    {
        let s = rt.sched.borrow();
        s.fibers
            .get(s.current.expect("a fiber is running"))
            .state
            .set(FiberState::IoWait);
    }
    rt.sched.borrow_mut().iowait += 1;
    suspend(rt);
}

/// Wake a fiber suspended by [`io_suspend`]. Called by the reactor after it
/// has written the fiber's readiness slot.
pub(crate) fn io_resume(rt: &RuntimeInner, id: FiberId) {
    let mut s = rt.sched.borrow_mut();
    debug_assert!(s.iowait > 0);
    s.iowait -= 1;
    let Sched { ready, fibers, .. } = &mut *s;
    let fiber = fibers.get(id);
    debug_assert_eq!(fiber.state.get(), FiberState::IoWait);
    fiber.state.set(FiberState::Ready);
    trace!("io resume {{{}}}", fiber.name);
    ready.push_back(fibers, id.0);
}

/// Put the current fiber at the back of the ready queue and yield.
pub(crate) fn postpone(rt: &RuntimeInner) {
    {
        let mut s = rt.sched.borrow_mut();
        let cur = s.current.expect("a fiber is running");
        let Sched { ready, fibers, .. } = &mut *s;
        fibers.get(cur).state.set(FiberState::Ready);
        ready.push_back(fibers, cur.0);
    }
    suspend(rt);
}

/// Direct hand-off: run `to` now. If the target sits in the ready queue it
/// is unlinked first (it is about to run out of turn); the calling fiber
/// goes to the back of the ready queue, so it runs again without further
/// arrangements.
pub(crate) fn yield_to(rt: &RuntimeInner, to: FiberId) -> Result<()> {
    let from;
    {
        let mut s = rt.sched.borrow_mut();
        from = s.current.ok_or(Error::UnexpectedState("not inside a running fiber"))?;
        if from == to {
            return Err(Error::BadArgument("cannot yield to self"));
        }
        let Sched { ready, fibers, .. } = &mut *s;
        let target = match fibers.try_get(to) {
            Some(target) => target,
            None => return Err(Error::NotFound),
        };
        match target.state.get() {
            FiberState::Ready => {
                ready.remove(fibers, to.0);
                fibers.get(to).state.set(FiberState::Running);
            }
            FiberState::Suspended => target.state.set(FiberState::Running),
            // IoWait, Waiting, Terminated: the fiber is owned by the reactor
            // or a wait queue; stealing it would corrupt that queue.
            _ => return Err(Error::Busy),
        }
        let caller = fibers.get(from);
        caller.state.set(FiberState::Ready);
        ready.push_back(fibers, from.0);
    }
    transfer(rt, from, to);
    Ok(())
}

/// Move the current fiber to the terminated queue and leave the CPU for
/// good.
pub(crate) fn terminate_current(rt: &RuntimeInner) -> ! {
    {
        let mut s = rt.sched.borrow_mut();
        let cur = s.current.expect("a fiber is running");
        let Sched { terminated, fibers, .. } = &mut *s;
        fibers.get(cur).state.set(FiberState::Terminated);
        trace!("terminate {{{}}}", fibers.get(cur).name);
        terminated.push_back(fibers, cur.0);
    }
    suspend(rt);
    unreachable!("a terminated fiber has been switched to")
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler main loop
////////////////////////////////////////////////////////////////////////////////

/// Free everything in the terminated queue. Returns the number of fibers
/// reclaimed.
fn collect_terminated(rt: &RuntimeInner) -> usize {
    let mut collected = 0;
    loop {
        let fiber = {
            let mut s = rt.sched.borrow_mut();
            let Sched {
                terminated,
                fibers,
                reactor_fiber,
                ..
            } = &mut *s;
            match terminated.pop_front(fibers) {
                Some(index) => {
                    let id = FiberId(index);
                    if *reactor_fiber == Some(id) {
                        *reactor_fiber = None;
                    }
                    fibers.remove(id)
                }
                None => None,
            }
        };
        match fiber {
            Some(fiber) => {
                debug!("fiber {{{}}} is terminated, cleanup", fiber.name);
                drop(fiber);
                collected += 1;
            }
            None => return collected,
        }
    }
}

/// The body of the scheduler fiber. Spawns the reactor fiber, schedules the
/// primary fiber and round-robins the ready queue until every queue drains,
/// then transfers control back to the context that started `work`. Never
/// returns.
pub(crate) fn scheduler_main(rt: &RuntimeInner, primary: FiberId) {
    let reactor_entry: Entry = Box::new(|rt: &RuntimeInner| reactor::reactor_main(rt));
    match spawn(
        rt,
        Some("reactor".into()),
        rt.default_stack_size(),
        rt.guard_pages(),
        reactor_entry,
    ) {
        Ok(id) => rt.sched.borrow_mut().reactor_fiber = Some(id),
        // Degraded mode: CPU-only fibers still run, the first io_suspend
        // would stall forever and is reported below.
        Err(e) => error!("cannot spawn the reactor fiber: {e}"),
    }
    resume(rt, primary);

    let self_id = {
        let s = rt.sched.borrow();
        s.sched_fiber.expect("work() registered the scheduler fiber")
    };

    loop {
        let (ready_len, terminated_len, iowait, reactor_fiber) = {
            let s = rt.sched.borrow();
            (
                s.ready.len(),
                s.terminated.len(),
                s.iowait,
                s.reactor_fiber,
            )
        };
        trace!(
            "fibers pending: {ready_len}, terminated: {terminated_len}, iowait: {iowait}"
        );

        if ready_len == 0 && terminated_len == 0 && iowait == 0 {
            match reactor_fiber {
                Some(reactor_id) => {
                    // Every other fiber is gone; wind the reactor down and
                    // collect it on the next lap.
                    rt.reactor.borrow().request_shutdown();
                    transfer(rt, self_id, reactor_id);
                    continue;
                }
                None => break,
            }
        }

        collect_terminated(rt);

        // Drain at most as many fibers as were ready when the lap started:
        // everything a running fiber appends (spawn, postpone, resume) goes
        // to the back of the queue and gets its turn on the next lap. The
        // bound gives the snapshot semantics without moving fibers into a
        // list the rest of the runtime cannot see.
        let round = rt.sched.borrow().ready.len();
        for _ in 0..round {
            let next = {
                let mut s = rt.sched.borrow_mut();
                let Sched { ready, fibers, .. } = &mut *s;
                ready.pop_front(fibers).map(|index| {
                    let id = FiberId(index);
                    fibers.get(id).state.set(FiberState::Running);
                    id
                })
            };
            // A direct yield may have pulled a ready fiber out of turn.
            let Some(id) = next else { break };
            transfer(rt, self_id, id);
        }

        let (ready_empty, iowait, reactor_fiber) = {
            let s = rt.sched.borrow();
            (s.ready.is_empty(), s.iowait, s.reactor_fiber)
        };
        if ready_empty && iowait > 0 {
            match reactor_fiber {
                Some(reactor_id) => transfer(rt, self_id, reactor_id),
                None => {
                    // The reactor died (multiplexor failure): nobody can
                    // ever wake the iowait fibers. A visible bug, not a
                    // recoverable condition.
                    error!("reactor fiber is gone, {iowait} fiber(s) stuck in iowait");
                    break;
                }
            }
        }
    }

    debug!("no pending fibers left in execution queue, job is done");
    let from_ctx = {
        let mut s = rt.sched.borrow_mut();
        s.current = None;
        s.fibers.get(self_id).context_ptr()
    };
    trace!("context switch {{scheduler}} -> {{init}}");
    unsafe { context::switch(from_ctx, rt.comeback_ptr()) };
    unreachable!("the scheduler fiber has been switched to after work() ended")
}
