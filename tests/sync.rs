use std::cell::{Cell, RefCell};
use std::rc::Rc;

use pretty_assertions::assert_eq;
use strand::fiber::{self, mutex::Mutex, Cond, Latch, YieldResult};
use strand::Runtime;

#[test]
fn latch_init_free() {
    let rt = Runtime::new();
    rt.work(|h| {
        let latch = Latch::new(h);
        drop(latch);
    })
    .unwrap();
}

#[test]
fn latch_recursive_lock() {
    let rt = Runtime::new();
    rt.work(|h| {
        let latch = Latch::new(h);
        let outer = latch.lock();
        // Nested acquisition by the owner must not suspend.
        let nested = fiber::check_yield(h, || latch.lock());
        assert!(matches!(nested, YieldResult::DidntYield(_)));
        drop(nested);
        drop(outer);
    })
    .unwrap();
}

#[test]
fn latch_recursive_try_lock() {
    let rt = Runtime::new();
    rt.work(|h| {
        let latch = Latch::new(h);
        let outer = latch.try_lock().unwrap();
        let nested = latch.try_lock().unwrap();
        drop(nested);
        drop(outer);
    })
    .unwrap();
}

#[test]
fn try_lock_observes_busy() {
    let rt = Runtime::new();
    rt.work(|h| {
        let latch = Rc::new(Latch::new(h));
        let contender = latch.clone();
        let observed_busy = Rc::new(Cell::new(false));
        let flag = observed_busy.clone();
        let guard = latch.lock();
        h.spawn(move |_| {
            flag.set(contender.try_lock().is_none());
        })
        .unwrap();
        fiber::reschedule(h);
        drop(guard);
        assert!(observed_busy.get());
    })
    .unwrap();
}

/// Scenario: fiber A locks a mutex and postpones; fiber B observes busy via
/// try_lock, then blocks on lock; A sets the shared value to 1 and unlocks;
/// B acquires, reads 1 and writes 2.
#[test]
fn two_fiber_mutex_contention() {
    let rt = Runtime::new();
    let reached = Rc::new(Cell::new(0));
    let result = reached.clone();
    rt.work(move |h| {
        let mutex = Rc::new(Mutex::new(h, 0));

        let a_mutex = mutex.clone();
        h.spawn(move |h| {
            let mut guard = a_mutex.lock();
            // Let B run into the contended path while we hold the lock.
            fiber::reschedule(h);
            *guard = 1;
        })
        .unwrap();

        let b_mutex = mutex.clone();
        let b_result = result.clone();
        h.spawn(move |h| {
            assert!(b_mutex.try_lock().is_none());
            let acquired = fiber::check_yield(h, || b_mutex.lock());
            match acquired {
                YieldResult::Yielded(mut guard) => {
                    assert_eq!(*guard, 1);
                    *guard = 2;
                }
                YieldResult::DidntYield(_) => panic!("the lock was supposed to be contended"),
            }
            b_result.set(*b_mutex.lock());
        })
        .unwrap();
    })
    .unwrap();
    assert_eq!(reached.get(), 2);
}

#[test]
fn mutex_hands_off_in_fifo_order() {
    let rt = Runtime::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    let observed = order.clone();
    rt.work(move |h| {
        let mutex = Rc::new(Mutex::new(h, ()));
        let guard = Rc::new(RefCell::new(Some(mutex.lock())));
        for tag in ["a", "b", "c"] {
            let mutex = mutex.clone();
            let order = observed.clone();
            h.spawn(move |_| {
                let _guard = mutex.lock();
                order.borrow_mut().push(tag);
            })
            .unwrap();
        }
        // All three contenders queue up, in spawn order.
        fiber::reschedule(h);
        observed.borrow_mut().push("release");
        *guard.borrow_mut() = None;
    })
    .unwrap();
    assert_eq!(*order.borrow(), vec!["release", "a", "b", "c"]);
}

/// The states walked through by `cond_signal_single_waiter`:
/// 1 - the waiter locked the mutex and started waiting on the cond
/// 2 - the signaller locked the mutex
/// 3 - the signaller signalled but has not yet unlocked
/// 4 - the waiter returned from wait with the mutex re-acquired
#[test]
fn cond_signal_single_waiter() {
    let rt = Runtime::new();
    let trace = Rc::new(RefCell::new(Vec::new()));
    let observed = trace.clone();
    rt.work(move |h| {
        let pair = Rc::new((Mutex::new(h, ()), Cond::new(h)));

        let waiter_pair = pair.clone();
        let waiter_trace = observed.clone();
        h.spawn(move |_| {
            let (mutex, cond) = &*waiter_pair;
            let guard = mutex.lock();
            waiter_trace.borrow_mut().push(1);
            let guard = cond.wait(guard);
            waiter_trace.borrow_mut().push(4);
            drop(guard);
        })
        .unwrap();

        let signaller_pair = pair.clone();
        let signaller_trace = observed.clone();
        h.spawn(move |h| {
            let (mutex, cond) = &*signaller_pair;
            let guard = mutex.lock();
            signaller_trace.borrow_mut().push(2);
            fiber::reschedule(h);
            cond.signal();
            signaller_trace.borrow_mut().push(3);
            // The waiter re-acquires the mutex, so it cannot resume before
            // this fiber releases it.
            fiber::reschedule(h);
            assert_eq!(*signaller_trace.borrow(), vec![1, 2, 3]);
            drop(guard);
        })
        .unwrap();
    })
    .unwrap();
    assert_eq!(*trace.borrow(), vec![1, 2, 3, 4]);
}

/// Condvar ping-pong: the waiter sees INITIAL -> READY with no deadlock.
#[test]
fn cond_ping_pong() {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        Initial,
        Ready,
    }

    let rt = Runtime::new();
    let transitions = Rc::new(RefCell::new(Vec::new()));
    let observed = transitions.clone();
    rt.work(move |h| {
        let state = Rc::new((Mutex::new(h, State::Initial), Cond::new(h)));

        let consumer = state.clone();
        let consumer_log = observed.clone();
        h.spawn(move |_| {
            let (mutex, cond) = &*consumer;
            let mut guard = mutex.lock();
            consumer_log.borrow_mut().push(*guard);
            while *guard != State::Ready {
                guard = cond.wait(guard);
            }
            consumer_log.borrow_mut().push(*guard);
        })
        .unwrap();

        let producer = state.clone();
        h.spawn(move |_| {
            let (mutex, cond) = &*producer;
            let mut guard = mutex.lock();
            *guard = State::Ready;
            cond.signal();
            drop(guard);
        })
        .unwrap();
    })
    .unwrap();
    assert_eq!(*transitions.borrow(), vec![State::Initial, State::Ready]);
}

/// Three fibers enqueue in order a, b, c; broadcast resumes them in exactly
/// that order.
#[test]
fn broadcast_fairness() {
    let rt = Runtime::new();
    let wakeups = Rc::new(RefCell::new(Vec::new()));
    let observed = wakeups.clone();
    rt.work(move |h| {
        let pair = Rc::new((Mutex::new(h, false), Cond::new(h)));
        for tag in ["a", "b", "c"] {
            let pair = pair.clone();
            let wakeups = observed.clone();
            h.spawn(move |_| {
                let (mutex, cond) = &*pair;
                let mut guard = mutex.lock();
                while !*guard {
                    guard = cond.wait(guard);
                }
                wakeups.borrow_mut().push(tag);
            })
            .unwrap();
        }
        // Let all three park on the cond first.
        fiber::reschedule(h);
        let (mutex, cond) = &*pair;
        *mutex.lock() = true;
        cond.broadcast();
    })
    .unwrap();
    assert_eq!(*wakeups.borrow(), vec!["a", "b", "c"]);
}

/// Strict wait-invoke ordering: each signal wakes the longest waiter.
#[test]
fn signal_respects_wait_order() {
    let rt = Runtime::new();
    let wakeups = Rc::new(RefCell::new(Vec::new()));
    let observed = wakeups.clone();
    rt.work(move |h| {
        let pair = Rc::new((Mutex::new(h, 0u32), Cond::new(h)));
        for tag in ["first", "second"] {
            let pair = pair.clone();
            let wakeups = observed.clone();
            h.spawn(move |_| {
                let (mutex, cond) = &*pair;
                let mut guard = mutex.lock();
                while *guard == 0 {
                    guard = cond.wait(guard);
                }
                *guard -= 1;
                wakeups.borrow_mut().push(tag);
            })
            .unwrap();
        }
        fiber::reschedule(h);
        let (mutex, cond) = &*pair;

        *mutex.lock() = 1;
        cond.signal();
        fiber::reschedule(h);
        assert_eq!(*observed.borrow(), vec!["first"]);

        *mutex.lock() = 1;
        cond.signal();
    })
    .unwrap();
    assert_eq!(*wakeups.borrow(), vec!["first", "second"]);
}

#[test]
fn signal_and_broadcast_without_waiters() {
    let rt = Runtime::new();
    rt.work(|h| {
        let cond = Cond::new(h);
        cond.signal();
        cond.broadcast();
    })
    .unwrap();
}

#[test]
fn wait_latch_round_trip() {
    let rt = Runtime::new();
    let woken = Rc::new(Cell::new(false));
    let flag = woken.clone();
    rt.work(move |h| {
        let pair = Rc::new((Latch::new(h), Cond::new(h)));
        let waiter_pair = pair.clone();
        h.spawn(move |_| {
            let (latch, cond) = &*waiter_pair;
            let guard = latch.lock();
            let guard = cond.wait_latch(guard);
            flag.set(true);
            drop(guard);
        })
        .unwrap();
        fiber::reschedule(h);
        pair.1.signal();
    })
    .unwrap();
    assert!(woken.get());
}

#[test]
#[should_panic(expected = "recursive lock of a fiber mutex")]
fn mutex_recursion_is_detected() {
    let rt = Runtime::new();
    let _ = rt.work(|h| {
        let mutex = Mutex::new(h, 0);
        let _outer = mutex.lock();
        let _nested = mutex.lock();
    });
}
