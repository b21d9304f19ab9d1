//! Fair, starvation-resistant reader/writer lock for monitor-style embedding.
//!
//! [`FairRwLock`] is a reader/writer lock that does no locking of its own.
//! It is built for data structures that already serialize their metadata
//! under one [`Mutex`] (a pager node, a cache entry, a table of slots) and
//! need a longer-lived shared/exclusive hold layered on top of it. Every
//! operation requires that mutex to be held and takes the caller's
//! [`MutexGuard`] as proof; the only thing the lock owns is its counters
//! and two condition channels used to park and wake blocked threads.
//!
//! # Writer Priority
//!
//! Blocked writers and blocked readers park on separate channels, so waking
//! one class never thunders the other. Every release decides whom to wake:
//!
//! | Release                                                     | Woken             |
//! |-------------------------------------------------------------|-------------------|
//! | `write_unlock`, writers queued                               | one queued writer |
//! | `write_unlock`, no writers queued                            | all queued readers|
//! | `read_unlock`, last reader out, none parked, writers queued  | one queued writer |
//! | `read_unlock`, otherwise                                     | all queued readers|
//!
//! A newly arriving blocking writer also queues behind already-queued
//! writers even when the lock itself is momentarily free, so a signaled
//! writer cannot be barged past while it is still waking up. The one
//! deliberate gap in the policy is [`FairRwLock::try_read_lock`], which
//! ignores the writer queue entirely: an opportunistic reader may slip in
//! ahead of queued writers through that path, and only that path.
//!
//! # Holds Outlive Guard Sessions
//!
//! Acquiring and releasing are separate guard sessions. A thread takes the
//! guard mutex, acquires, drops the guard while it works with the protected
//! structure, then takes the guard again to release. The lock is not
//! reentrant: a thread that already holds it must release before acquiring
//! again.
//!
//! # Watchdog
//!
//! Blocked waits are bounded by [`WATCHDOG_INTERVAL`] per iteration. An
//! expiry that finds the wake condition still false means the process is
//! wedged (a lost release, a reentrant acquire); the lock logs its full
//! accounting state and panics rather than returning a timeout. Redundant
//! precondition checks compile away in optimized builds unless the
//! `paranoid-checks` feature keeps them in.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use fairlock::{FairRwLock, Mutex};
//!
//! struct Node {
//!     meta: Mutex<u64>,
//!     lock: FairRwLock,
//! }
//!
//! let node = Arc::new(Node {
//!     meta: Mutex::new(0),
//!     lock: FairRwLock::new(),
//! });
//!
//! // Acquire under one guard session.
//! let mut meta = node.meta.lock();
//! node.lock.read_lock(&mut meta);
//! drop(meta);
//!
//! // ... use the structure the lock protects, guard released ...
//!
//! // Release under another.
//! let mut meta = node.meta.lock();
//! node.lock.read_unlock(&mut meta);
//! assert_eq!(node.lock.users(&meta), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod invariant;
mod rwlock;
#[cfg(test)]
mod test_util;

pub use parking_lot::{Mutex, MutexGuard};
pub use rwlock::{FairRwLock, WATCHDOG_INTERVAL};
