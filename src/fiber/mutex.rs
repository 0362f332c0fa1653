use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};

use crate::fiber::{Latch, LatchGuard};
use crate::runtime::Handle;

#[cfg(debug_assertions)]
use std::{cell::Cell, panic::Location};

////////////////////////////////////////////////////////////////////////////////
// Mutex
////////////////////////////////////////////////////////////////////////////////

/// A data-carrying lock built on the fiber [`Latch`].
///
/// Unlike the latch, the mutex is not recursive: the data is reachable only
/// through the RAII guard and a second guard would alias it mutably, so
/// locking a mutex the calling fiber already holds is a programmer error
/// and panics.
pub struct Mutex<T: ?Sized> {
    latch: Latch,
    #[cfg(debug_assertions)]
    lock_location: Cell<Option<&'static Location<'static>>>,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use strand::fiber::mutex::Mutex;
    ///
    /// # let rt = strand::Runtime::new();
    /// # rt.work(|h| {
    /// let mutex = Mutex::new(h, 0);
    /// # }).unwrap();
    /// ```
    pub fn new(handle: &Handle, t: T) -> Mutex<T> {
        Mutex {
            latch: Latch::new(handle),
            #[cfg(debug_assertions)]
            lock_location: Cell::default(),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires a mutex, suspending the current fiber until it is able to
    /// do so.
    ///
    /// Upon returning, the fiber is the only fiber with the lock held. A
    /// RAII guard is returned to allow scoped unlock of the lock. When the
    /// guard goes out of scope, the mutex will be unlocked; if other fibers
    /// queued on the lock meanwhile, ownership is handed to the first of
    /// them in line.
    ///
    /// # Panics
    ///
    /// Panics if the lock is already held by the calling fiber.
    ///
    /// # Examples
    /// ```no_run
    /// use std::rc::Rc;
    /// use strand::fiber::mutex::Mutex;
    ///
    /// # let rt = strand::Runtime::new();
    /// # rt.work(|h| {
    /// let mutex = Rc::new(Mutex::new(h, 0));
    /// let c_mutex = Rc::clone(&mutex);
    ///
    /// h.spawn(move |_| {
    ///     *c_mutex.lock() = 10;
    /// })
    /// .unwrap();
    /// # }).unwrap();
    /// ```
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        assert!(
            !self.latch.is_held_by_current(),
            "recursive lock of a fiber mutex"
        );
        #[cfg(debug_assertions)]
        let guard = self.latch.try_lock().unwrap_or_else(|| {
            self.log_lock_location();
            self.latch.lock()
        });

        #[cfg(not(debug_assertions))]
        let guard = self.latch.lock();

        MutexGuard::new(self, guard)
    }

    /// Attempts to acquire this lock.
    ///
    /// If the lock could not be acquired at this time, then `None` is
    /// returned. Otherwise, an RAII guard is returned. This function does
    /// not yield.
    ///
    /// # Panics
    ///
    /// Panics if the lock is already held by the calling fiber.
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        assert!(
            !self.latch.is_held_by_current(),
            "recursive lock of a fiber mutex"
        );
        match self.latch.try_lock() {
            Some(guard) => Some(MutexGuard::new(self, guard)),
            None => {
                #[cfg(debug_assertions)]
                self.log_lock_location();
                None
            }
        }
    }

    /// Immediately drops the guard, and consequently unlocks the mutex.
    ///
    /// This function is equivalent to calling [`drop`] on the guard but is
    /// more self-documenting.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs
    /// to take place -- the mutable borrow statically guarantees no locks
    /// exist.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[cfg(debug_assertions)]
    #[inline]
    fn log_lock_location(&self) {
        if let Some(loc) = self.lock_location.get() {
            log::debug!("mutex was locked at {loc}");
        } else {
            log::debug!("mutex was locked at unknown location");
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        if self.latch.is_held_by_current() {
            d.field("data", &"<locked by the current fiber>");
            return d.finish_non_exhaustive();
        }
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            #[cfg(debug_assertions)]
            None => {
                struct LockedPlaceholder(Option<&'static Location<'static>>);
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        if let Some(loc) = self.0 {
                            write!(f, "<locked at {loc}>")
                        } else {
                            f.write_str("<locked>")
                        }
                    }
                }
                d.field("data", &LockedPlaceholder(self.lock_location.get()));
            }
            #[cfg(not(debug_assertions))]
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("data", &LockedPlaceholder);
            }
        }
        d.finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// MutexGuard
////////////////////////////////////////////////////////////////////////////////

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
    _latch_guard: LatchGuard<'a>,
}

impl<'mutex, T: ?Sized> MutexGuard<'mutex, T> {
    #[track_caller]
    fn new(lock: &'mutex Mutex<T>, _latch_guard: LatchGuard<'mutex>) -> Self {
        #[cfg(debug_assertions)]
        lock.lock_location.set(Some(Location::caller()));
        Self { lock, _latch_guard }
    }

    pub(crate) fn mutex(&self) -> &'mutex Mutex<T> {
        self.lock
    }
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.lock.lock_location.set(None);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}
