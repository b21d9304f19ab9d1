//! Logging bootstrap and assertion macros for the in-file test suites.
//!
//! Integration tests under `tests/` carry their own copy of the same
//! bootstrap in `tests/common.rs`; this module covers the unit suites,
//! which run inside the crate and can share one subscriber.

/// Installs the test-writer subscriber. Safe to call from every test; only
/// the first call in the process wins.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Marks the start of a test in the structured log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Marks the end of a test; a log without it means the test died mid-flight.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Asserts with a structured record of expected vs actual on failure.
#[macro_export]
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
