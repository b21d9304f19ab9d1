//! Monitor-style fair reader/writer lock.
//!
//! [`FairRwLock`] layers shared/exclusive holds on top of one caller-owned
//! [`Mutex`]. All accounting transitions happen while that mutex is held;
//! the lock's own job is the wake policy. Parked readers and parked
//! writers wait on separate condition channels so a release can wake
//! exactly the class it means to:
//!
//! - releasing the write slot wakes one queued writer if any writer is
//!   queued, otherwise every queued reader;
//! - the last reader out wakes one queued writer, unless readers are still
//!   parked from an earlier broadcast, in which case the broadcast promise
//!   is honored first.
//!
//! Writer priority lives entirely in those two decisions plus one entry
//! rule: a blocking writer queues behind already-queued writers even when
//! the lock is momentarily free, so a signaled writer cannot be barged
//! past while it is still reacquiring the guard mutex.
//!
//! Blocked waits are watchdogged, not timed out: see [`WATCHDOG_INTERVAL`].

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::invariant::{invariant, paranoid_invariant};

/// Deadline span for each blocked wait iteration.
///
/// This is not a caller-visible timeout. A wait that reaches the deadline
/// re-checks its wake condition: if the condition turned true the wait
/// simply succeeds, and if it is still false the process is considered
/// wedged (a lost release, a reentrant acquire) and the lock panics after
/// logging its accounting state. No legitimate hold approaches ten
/// minutes.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Accounting counters, touched only while the guard mutex is held.
///
/// The write slot is deliberately not here; it lives in an atomic on
/// [`FairRwLock`] so [`FairRwLock::writers`] can answer without the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counts {
    readers: u32,
    want_read: u32,
    want_write: u32,
    /// Queued writers whose request is tagged expensive. Never exceeds
    /// `want_write`.
    expensive_want_write: u32,
    current_writer_expensive: bool,
}

impl Counts {
    const ZERO: Counts = Counts {
        readers: 0,
        want_read: 0,
        want_write: 0,
        expensive_want_write: 0,
        current_writer_expensive: false,
    };
}

/// A fair reader/writer lock driven through an external guard mutex.
///
/// The lock is a monitor: it never locks anything itself. Callers hold one
/// [`Mutex`] for the whole of every call and prove it by passing the
/// [`MutexGuard`] in. The first operation binds the lock to that mutex;
/// afterwards a guard from any other mutex is a fatal protocol violation,
/// and the bound mutex must not move (embed both in one heap allocation,
/// e.g. behind an [`Arc`](std::sync::Arc), as embedding callers do
/// anyway).
///
/// Holds are not tied to guard sessions: a thread acquires under one
/// guard, drops the guard while it uses the protected structure, and takes
/// the guard again to release. The lock is not reentrant; acquiring twice
/// from one thread without releasing deadlocks.
pub struct FairRwLock {
    /// Address of the guard mutex this lock is bound to; zero until the
    /// first operation binds one.
    bound_mutex: AtomicUsize,
    /// Threads blocked in [`FairRwLock::read_lock`] park here; woken by
    /// broadcast.
    wait_read: Condvar,
    /// Threads blocked in [`FairRwLock::write_lock`] park here; woken one
    /// at a time.
    wait_write: Condvar,
    /// The write slot, `0` or `1`. Stored only while the guard mutex is
    /// held; the lock-free reader is the write holder observing its own
    /// store, so relaxed ordering suffices.
    writers: AtomicU32,
    counts: UnsafeCell<Counts>,
    watchdog: Duration,
}

// Safety: `counts` is only reached through the guard-token accessors
// below, and every public operation first proves via `assert_bound` that
// the caller holds the one mutex this lock is bound to. That mutex
// serializes all access to the cell.
unsafe impl Sync for FairRwLock {}

impl FairRwLock {
    /// Creates an unbound lock with all counters zero.
    ///
    /// The lock binds itself to the guard mutex of the first operation
    /// performed on it.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bound_mutex: AtomicUsize::new(0),
            wait_read: Condvar::new(),
            wait_write: Condvar::new(),
            writers: AtomicU32::new(0),
            counts: UnsafeCell::new(Counts::ZERO),
            watchdog: WATCHDOG_INTERVAL,
        }
    }

    /// Shortened watchdog for exercising the fatal path.
    #[cfg(test)]
    fn with_watchdog(watchdog: Duration) -> Self {
        let mut lock = Self::new();
        lock.watchdog = watchdog;
        lock
    }

    /// Blocking exclusive acquire.
    ///
    /// Granted immediately when no reader holds, no writer holds, and no
    /// writer is queued. Otherwise the thread registers as a queued writer
    /// and parks on the write channel until `readers == 0 && writers == 0`,
    /// re-verifying on every wake. Queuing behind already-queued writers
    /// even when the lock is free is what keeps a signaled writer from
    /// being barged past.
    ///
    /// `expensive` tags the request so collaborators polling
    /// [`FairRwLock::write_lock_is_expensive`] or
    /// [`FairRwLock::read_lock_is_expensive`] can branch to a cheaper
    /// strategy instead of waiting; the tag is visible while the request
    /// is queued and for as long as the writer holds the slot.
    ///
    /// # Panics
    ///
    /// If `guard` belongs to a different mutex than the lock is bound to,
    /// or a watchdog deadline expires with the wake condition still false.
    pub fn write_lock<T>(&self, guard: &mut MutexGuard<'_, T>, expensive: bool) {
        self.assert_bound(guard);
        let contended = {
            let counts = self.counts(guard);
            counts.readers > 0 || self.write_slot() > 0 || counts.want_write > 0
        };
        if contended {
            {
                let counts = self.counts_mut(guard);
                counts.want_write += 1;
                if expensive {
                    counts.expensive_want_write += 1;
                }
            }
            self.park_until(&self.wait_write, guard, "write_lock", |counts, write_slot| {
                counts.readers == 0 && write_slot == 0
            });
            let counts = self.counts_mut(guard);
            paranoid_invariant!(counts.readers == 0, "write granted with readers active");
            counts.want_write -= 1;
            if expensive {
                counts.expensive_want_write -= 1;
            }
        }
        paranoid_invariant!(self.write_slot() == 0, "write granted with the slot taken");
        self.writers.store(1, Ordering::Relaxed);
        self.counts_mut(guard).current_writer_expensive = expensive;
    }

    /// Non-blocking exclusive acquire.
    ///
    /// Refuses, leaving all counters untouched, when a reader holds, a
    /// writer holds, or *anyone* is queued for either side. Unlike
    /// [`FairRwLock::try_read_lock`], merely-queued readers are enough to
    /// refuse; the two try paths are deliberately asymmetric.
    #[must_use]
    pub fn try_write_lock<T>(&self, guard: &mut MutexGuard<'_, T>, expensive: bool) -> bool {
        self.assert_bound(guard);
        let refused = {
            let counts = self.counts(guard);
            counts.readers > 0
                || self.write_slot() > 0
                || counts.want_read > 0
                || counts.want_write > 0
        };
        if refused {
            return false;
        }
        self.writers.store(1, Ordering::Relaxed);
        self.counts_mut(guard).current_writer_expensive = expensive;
        true
    }

    /// Releases the write slot.
    ///
    /// Writers queued behind the holder get priority: one of them is
    /// signaled if any are queued, otherwise every parked reader is woken.
    ///
    /// # Panics
    ///
    /// Checked builds panic if the write slot is not held.
    pub fn write_unlock<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.assert_bound(guard);
        paranoid_invariant!(
            self.write_slot() == 1,
            "write_unlock without holding the write slot"
        );
        self.writers.store(0, Ordering::Relaxed);
        let want_write = {
            let counts = self.counts_mut(guard);
            counts.current_writer_expensive = false;
            counts.want_write
        };
        if want_write > 0 {
            self.wait_write.notify_one();
        } else {
            self.wait_read.notify_all();
        }
    }

    /// Whether acquiring the write slot would be expensive: true while the
    /// current holder's write is tagged expensive or any queued writer's
    /// request is.
    #[must_use]
    pub fn write_lock_is_expensive<T>(&self, guard: &MutexGuard<'_, T>) -> bool {
        self.assert_bound(guard);
        let counts = self.counts(guard);
        counts.expensive_want_write > 0 || counts.current_writer_expensive
    }

    /// Blocking shared acquire.
    ///
    /// Granted immediately unless a writer holds the slot, in which case
    /// the thread registers as a queued reader and parks on the read
    /// channel until `writers == 0`. Queued writers do not block this
    /// path's immediate grant; only an active writer does.
    ///
    /// # Panics
    ///
    /// Same conditions as [`FairRwLock::write_lock`].
    pub fn read_lock<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.assert_bound(guard);
        if self.write_slot() > 0 {
            self.counts_mut(guard).want_read += 1;
            self.park_until(&self.wait_read, guard, "read_lock", |_, write_slot| {
                write_slot == 0
            });
            paranoid_invariant!(self.write_slot() == 0, "read granted with a writer active");
            let counts = self.counts_mut(guard);
            paranoid_invariant!(counts.want_read > 0, "woken reader was never registered");
            counts.want_read -= 1;
        }
        self.counts_mut(guard).readers += 1;
    }

    /// Non-blocking shared acquire.
    ///
    /// Refuses only while a writer *holds* the slot. Queued writers are
    /// ignored: an opportunistic reader may slip in ahead of the fairness
    /// queue through this path, and only this path. Callers that need the
    /// queue respected must use [`FairRwLock::read_lock`].
    #[must_use]
    pub fn try_read_lock<T>(&self, guard: &mut MutexGuard<'_, T>) -> bool {
        self.assert_bound(guard);
        if self.write_slot() > 0 {
            return false;
        }
        self.counts_mut(guard).readers += 1;
        true
    }

    /// Releases one shared hold.
    ///
    /// The last reader out signals one queued writer, provided no readers
    /// are still parked from an earlier broadcast; in every other case the
    /// read channel is re-broadcast, which is harmless for readers that
    /// are already active.
    ///
    /// # Panics
    ///
    /// Checked builds panic if no read hold is outstanding or a writer
    /// holds the slot.
    pub fn read_unlock<T>(&self, guard: &mut MutexGuard<'_, T>) {
        self.assert_bound(guard);
        paranoid_invariant!(self.write_slot() == 0, "read_unlock with a writer active");
        let (last_reader, want_read, want_write) = {
            let counts = self.counts_mut(guard);
            paranoid_invariant!(counts.readers > 0, "read_unlock without holding a read lock");
            counts.readers -= 1;
            (counts.readers == 0, counts.want_read, counts.want_write)
        };
        if last_reader && want_read == 0 && want_write > 0 {
            self.wait_write.notify_one();
        } else {
            self.wait_read.notify_all();
        }
    }

    /// Whether the lock is currently held by an expensive writer.
    #[must_use]
    pub fn read_lock_is_expensive<T>(&self, guard: &MutexGuard<'_, T>) -> bool {
        self.assert_bound(guard);
        self.counts(guard).current_writer_expensive
    }

    /// Every thread holding or queued for the lock:
    /// `readers + writers + want_read + want_write`.
    #[must_use]
    pub fn users<T>(&self, guard: &MutexGuard<'_, T>) -> u32 {
        self.assert_bound(guard);
        let counts = self.counts(guard);
        counts.readers + self.write_slot() + counts.want_read + counts.want_write
    }

    /// Threads queued for either side: `want_read + want_write`.
    #[must_use]
    pub fn blocked_users<T>(&self, guard: &MutexGuard<'_, T>) -> u32 {
        self.assert_bound(guard);
        let counts = self.counts(guard);
        counts.want_read + counts.want_write
    }

    /// Number of write holders, `0` or `1`.
    ///
    /// The one accounting query that takes no guard token: it is called as
    /// `assert!(lock.writers() == 1)` by threads that believe they hold
    /// the write slot, and such a thread may not hold the guard mutex at
    /// that point.
    #[must_use]
    pub fn writers(&self) -> u32 {
        self.write_slot()
    }

    /// Threads queued for the write slot.
    #[must_use]
    pub fn blocked_writers<T>(&self, guard: &MutexGuard<'_, T>) -> u32 {
        self.assert_bound(guard);
        self.counts(guard).want_write
    }

    /// Threads holding shared access.
    #[must_use]
    pub fn readers<T>(&self, guard: &MutexGuard<'_, T>) -> u32 {
        self.assert_bound(guard);
        self.counts(guard).readers
    }

    /// Threads queued for shared access.
    #[must_use]
    pub fn blocked_readers<T>(&self, guard: &MutexGuard<'_, T>) -> u32 {
        self.assert_bound(guard);
        self.counts(guard).want_read
    }

    /// Parks on `channel` until `granted(counts, write_slot)` holds.
    ///
    /// Entered with the guard mutex held and the caller already registered
    /// in the relevant queue counter, so the first wait happens before any
    /// re-check; the registering increment and the wait entry are one
    /// atomic step under the monitor. Each iteration is bounded by the
    /// watchdog deadline.
    fn park_until<T>(
        &self,
        channel: &Condvar,
        guard: &mut MutexGuard<'_, T>,
        op: &'static str,
        granted: impl Fn(&Counts, u32) -> bool,
    ) {
        loop {
            let deadline = Instant::now() + self.watchdog;
            let timed_out = channel.wait_until(guard, deadline).timed_out();
            let counts = self.counts(guard);
            if granted(counts, self.write_slot()) {
                return;
            }
            if timed_out {
                self.watchdog_trip(op, counts);
            }
        }
    }

    /// Fatal path for a watchdog expiry with the wake condition still
    /// false. Logs the complete accounting state, then panics.
    #[cold]
    #[inline(never)]
    fn watchdog_trip(&self, op: &'static str, counts: &Counts) -> ! {
        tracing::error!(
            target: "fairlock",
            op,
            watchdog_secs = self.watchdog.as_secs(),
            readers = counts.readers,
            writers = self.write_slot(),
            want_read = counts.want_read,
            want_write = counts.want_write,
            expensive_want_write = counts.expensive_want_write,
            "watchdog expired with the wake condition still false"
        );
        let watchdog = self.watchdog;
        crate::invariant::violation(format_args!(
            "{op} waited {watchdog:?} with the wake condition still false; state: {counts:?}"
        ))
    }

    fn write_slot(&self) -> u32 {
        self.writers.load(Ordering::Relaxed)
    }

    /// Proves `guard` belongs to the mutex this lock is bound to, binding
    /// on first use.
    ///
    /// Always compiled: a guard from a foreign mutex would not serialize
    /// access to the counters, so this check carries the soundness of the
    /// cell accessors below.
    fn assert_bound<T>(&self, guard: &MutexGuard<'_, T>) {
        let addr = MutexGuard::mutex(guard) as *const Mutex<T> as *const () as usize;
        if let Err(bound) =
            self.bound_mutex
                .compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire)
        {
            invariant!(
                bound == addr,
                "guard mutex mismatch: bound {bound:#x}, presented {addr:#x}"
            );
        }
    }

    /// Shared view of the counters.
    ///
    /// Callers run `assert_bound` first. Holding `&MutexGuard` for `'a`
    /// keeps the bound mutex held for at least that long.
    fn counts<'a, T>(&'a self, _guard: &'a MutexGuard<'_, T>) -> &'a Counts {
        // Safety: the caller holds the bound guard mutex for 'a, which
        // serializes every access to the cell.
        unsafe { &*self.counts.get() }
    }

    /// Exclusive view of the counters; the `&mut` borrow of the guard
    /// keeps any other view from forming while it lives.
    fn counts_mut<'a, T>(&'a self, _guard: &'a mut MutexGuard<'_, T>) -> &'a mut Counts {
        // Safety: as in `counts`, and the exclusive guard borrow makes
        // this the only live view on the owning thread.
        unsafe { &mut *self.counts.get() }
    }

    #[cfg(test)]
    fn snapshot<T>(&self, guard: &MutexGuard<'_, T>) -> Counts {
        self.assert_bound(guard);
        *self.counts(guard)
    }
}

impl Default for FairRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FairRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairRwLock")
            .field("bound", &(self.bound_mutex.load(Ordering::Relaxed) != 0))
            .field("writers", &self.write_slot())
            .finish_non_exhaustive()
    }
}

impl Drop for FairRwLock {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        // `&mut self` proves no guard-derived view of the cell is live.
        let counts = self.counts.get_mut();
        paranoid_invariant!(
            counts.readers == 0
                && self.writers.load(Ordering::Relaxed) == 0
                && counts.want_read == 0
                && counts.want_write == 0,
            "lock dropped while in use: {counts:?}"
        );
    }
}
