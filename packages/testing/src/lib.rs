#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // Test support code only.

//! Private helpers for the `alloc_trace` integration tests.

use std::env;
use std::panic;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Environment variable that disables the watchdog when set to `1`.
const MUTATION_TESTING_VAR: &str = "MUTATION_TESTING";

/// Runs `test_fn` on its own thread and fails the test if it does not return in time.
///
/// Queries and lock scopes block on other threads, so a regression tends to show up as a hang
/// rather than a failed assertion. The watchdog turns such a hang into a panic.
///
/// The limit is 10 seconds, or 60 seconds under Miri. When `MUTATION_TESTING=1` the watchdog is
/// off and `test_fn` runs on the calling thread, so the mutation runner can detect hangs itself.
///
/// # Panics
///
/// Panics if the test exceeds the limit. Panics raised by `test_fn` are resumed on the caller.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
#[cfg_attr(test, mutants::skip)] // Mutations here hang the test run instead of failing it.
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var(MUTATION_TESTING_VAR).as_deref() == Ok("1") {
        return test_fn();
    }

    let limit = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::spawn(move || {
        // The receiver is gone if the watchdog already fired.
        drop(tx.send(test_fn()));
    });

    match rx.recv_timeout(limit) {
        Ok(result) => {
            test_thread.join().expect("test thread exited after sending its result");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {} seconds", limit.as_secs())
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without a result"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn returns_the_test_result() {
        assert_eq!(with_watchdog(|| "done"), "done");
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn resumes_test_panics() {
        with_watchdog::<_, ()>(|| panic!("boom"));
    }
}
