//! Fail-fast assertion layer.
//!
//! Two tiers, matching the two kinds of breakage a monitor can see:
//!
//! - [`invariant!`] is always compiled. It guards conditions whose failure
//!   means the accounting can no longer be trusted at all: a guard from a
//!   foreign mutex, a watchdog expiry with no wake in sight. There is no
//!   recovery path; the counters are shared state and no caller can repair
//!   them once they lie.
//! - [`paranoid_invariant!`] guards redundant precondition checks on hot
//!   paths (unlock preconditions, post-wake sanity). It compiles to
//!   nothing unless `debug_assertions` or the `paranoid-checks` feature is
//!   on, and never evaluates its arguments when compiled out.
//!
//! Both report through [`violation`], which emits a structured error event
//! before panicking so a wedged process still leaves a record of what the
//! lock thought was happening.

use std::fmt;

/// Reports a violated invariant and panics.
#[cold]
#[inline(never)]
pub(crate) fn violation(args: fmt::Arguments<'_>) -> ! {
    tracing::error!(target: "fairlock", "invariant violated: {args}");
    panic!("invariant violated: {args}");
}

/// Always-on invariant check. Fatal on failure in every build.
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::invariant::violation(::std::format_args!($($arg)+));
        }
    };
}

/// Degradable invariant check.
///
/// Active under `debug_assertions` or the `paranoid-checks` feature;
/// otherwise expands to nothing and `$cond` is never evaluated.
macro_rules! paranoid_invariant {
    ($cond:expr, $($arg:tt)+) => {
        if ::std::cfg!(any(debug_assertions, feature = "paranoid-checks")) && !$cond {
            $crate::invariant::violation(::std::format_args!($($arg)+));
        }
    };
}

pub(crate) use {invariant, paranoid_invariant};

#[cfg(test)]
mod tests {
    fn init_test(name: &str) {
        crate::test_util::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn invariant_passes_quietly() {
        init_test("invariant_passes_quietly");
        invariant!(1 + 1 == 2, "arithmetic broke");
        crate::test_complete!("invariant_passes_quietly");
    }

    #[test]
    #[should_panic(expected = "invariant violated: forced failure: 42")]
    fn invariant_reports_failure_with_context() {
        init_test("invariant_reports_failure_with_context");
        invariant!(false, "forced failure: {}", 41 + 1);
    }

    #[test]
    fn paranoid_invariant_active_in_checked_builds() {
        init_test("paranoid_invariant_active_in_checked_builds");
        // Tests build with debug_assertions, so the check must be live.
        let outcome = std::panic::catch_unwind(|| {
            paranoid_invariant!(false, "forced paranoid failure");
        });
        crate::assert_with_log!(
            outcome.is_err(),
            "paranoid check should trip under debug_assertions",
            "panic",
            outcome.is_ok()
        );
        crate::test_complete!("paranoid_invariant_active_in_checked_builds");
    }

    #[test]
    fn paranoid_invariant_passes_quietly() {
        init_test("paranoid_invariant_passes_quietly");
        paranoid_invariant!(true, "never reported");
        crate::test_complete!("paranoid_invariant_passes_quietly");
    }
}
