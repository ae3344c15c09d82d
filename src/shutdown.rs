//! Cooperative shutdown signal for the exchange dispatch loop.
//!
//! A `ShutdownFlag` is a monotonic boolean: once set it stays set for the
//! rest of its life. Waiters can block on it with a bounded timeout, which
//! is what lets the dispatch loop idle without busy-spinning.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct FlagInner {
    set: Mutex<bool>,
    cond: Condvar,
}

/// Thread-safe, one-way "finished" signal with a bounded wait.
///
/// Cloning yields another handle to the same underlying flag.
#[derive(Clone)]
pub struct ShutdownFlag {
    inner: Arc<FlagInner>,
}

impl ShutdownFlag {
    /// Create a new flag in the unset state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FlagInner {
                set: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Move the flag to the set state and wake all waiters. Idempotent.
    pub fn set(&self) {
        let mut set = self.inner.set.lock();
        if !*set {
            *set = true;
            self.inner.cond.notify_all();
        }
    }

    /// Non-blocking read of the current state.
    pub fn is_set(&self) -> bool {
        *self.inner.set.lock()
    }

    /// Block until the flag is set or `timeout` elapses.
    ///
    /// Returns `true` if the flag was set, `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut set = self.inner.set.lock();
        if !*set {
            self.inner.cond.wait_while_for(&mut set, |s| !*s, timeout);
        }
        *set
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownFlag")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_initially_unset() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
    }

    #[test]
    fn test_set_is_idempotent() {
        let flag = ShutdownFlag::new();
        flag.set();
        flag.set();
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn test_wait_returns_false_on_timeout() {
        let flag = ShutdownFlag::new();
        let start = Instant::now();
        assert!(!flag.wait(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_returns_immediately_when_already_set() {
        let flag = ShutdownFlag::new();
        flag.set();
        let start = Instant::now();
        assert!(flag.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_set_wakes_waiter() {
        let flag = ShutdownFlag::new();
        let waiter = flag.clone();

        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        flag.set();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_clone_observes_same_flag() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();
        flag.set();
        assert!(other.is_set());
    }
}
