//! Timeout harness for tests that assert on blocking behavior.
//!
//! `retry()` and friends can legitimately block forever, so tests that
//! exercise them need a way to say "this must finish within N ms" (or,
//! just as often, "this must NOT finish within N ms").

use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::Duration;

/// Run `f` on another thread and report whether it finished within
/// `time_ms`. Does not cancel `f` if it times out; the spawned thread is
/// simply detached and left to either finish later or run forever (`f` is
/// expected to be a best-effort STM closure with no side effects worth
/// cleaning up).
pub fn terminates<F>(time_ms: u64, f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();

    thread::spawn(move || {
        f();
        let _ = tx.send(());
    });

    match rx.recv_timeout(Duration::from_millis(time_ms)) {
        Ok(()) => true,
        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
    }
}

/// Run `first` on another thread while running `second` (typically a
/// delayed writer) on the calling thread, then wait up to `time_ms` for
/// `first` to finish. Returns `first`'s result if it finished in time.
pub fn async_test<T, F, G>(time_ms: u64, first: F, second: G) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
    G: FnOnce(),
{
    let (tx, rx) = std::sync::mpsc::channel();

    thread::spawn(move || {
        let result = first();
        let _ = tx.send(result);
    });

    second();

    rx.recv_timeout(Duration::from_millis(time_ms)).ok()
}

/// Like `async_test`, but only reports whether `first` terminated in time.
pub fn terminates_async<F, G>(time_ms: u64, first: F, second: G) -> bool
where
    F: FnOnce() + Send + 'static,
    G: FnOnce(),
{
    async_test(time_ms, first, second).is_some()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminates_detects_quick_completion() {
        assert!(terminates(200, || {}));
    }

    #[test]
    fn terminates_detects_timeout() {
        assert!(!terminates(50, || thread::sleep(Duration::from_millis(500))));
    }
}
