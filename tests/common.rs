//! Shared scaffolding for the integration suites.

#![allow(dead_code)]
#![allow(unused_macros)]

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fairlock::{FairRwLock, Mutex};

/// Installs the test subscriber once per binary.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Marks the start of a test in the log stream.
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST PHASE ===");
    };
}

/// Marks a test that ran to completion.
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Asserts with a structured record of expected vs actual on failure.
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {{
        let ok = $cond;
        if !ok {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!(ok, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    }};
}

/// The embedding shape the lock is built for: guard mutex, lock, and the
/// structure they protect, in one heap allocation.
///
/// `value` stands in for the protected structure. Writers update it as a
/// separate load and store with a yield in between, so any failure of
/// writer exclusion shows up as a lost update; readers load it twice
/// around a yield and a torn pair means a writer ran inside a read hold.
pub struct Node {
    pub mutex: Mutex<()>,
    pub lock: FairRwLock,
    pub value: AtomicU64,
}

impl Node {
    pub fn new() -> Arc<Self> {
        Arc::new(Node {
            mutex: Mutex::new(()),
            lock: FairRwLock::new(),
            value: AtomicU64::new(0),
        })
    }
}

/// Polls `ready` until it holds, panicking after five seconds.
pub fn spin_until(mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(Instant::now() < deadline, "test rendezvous timed out");
        std::thread::yield_now();
    }
}
