//! One-shot cancellation signal
//!
//! The coordinator owns a [`CancelSignal`]. Sessions only ever see a
//! [`CancelObserver`], and interrupt handlers hold a [`StopTrigger`]. Every
//! side shares the same flag, which goes from unset to set exactly once.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Inner {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, bool> {
        // A poisoned flag is still a valid bool
        self.set.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self) -> bool {
        let mut set = self.lock();
        if *set {
            return false;
        }
        *set = true;
        self.cond.notify_all();
        true
    }

    fn is_set(&self) -> bool {
        *self.lock()
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.lock();
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            set = match self.cond.wait_timeout(set, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        *set
    }

    fn wait(&self) {
        let mut set = self.lock();
        while !*set {
            set = match self.cond.wait(set) {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
        }
    }
}

/// Owner side of the cancellation flag
pub struct CancelSignal {
    inner: Arc<Inner>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                set: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Set the flag. Returns `true` only for the call that flipped it.
    pub fn set(&self) -> bool {
        self.inner.set()
    }

    pub fn is_set(&self) -> bool {
        self.inner.is_set()
    }

    /// Read-only view handed to workers
    pub fn observer(&self) -> CancelObserver {
        CancelObserver {
            inner: self.inner.clone(),
        }
    }

    /// Set-only handle for interrupt sources
    pub fn trigger(&self) -> StopTrigger {
        StopTrigger {
            inner: self.inner.clone(),
        }
    }

    /// Block until some trigger sets the flag
    pub fn wait(&self) {
        self.inner.wait();
    }
}

/// Read-only view of a [`CancelSignal`]
#[derive(Clone)]
pub struct CancelObserver {
    inner: Arc<Inner>,
}

impl CancelObserver {
    pub fn is_set(&self) -> bool {
        self.inner.is_set()
    }

    /// Sleep for up to `timeout`, waking early on cancellation.
    /// Returns whether the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.inner.wait_timeout(timeout)
    }
}

/// Handle that can only fire the signal
#[derive(Clone)]
pub struct StopTrigger {
    inner: Arc<Inner>,
}

impl StopTrigger {
    /// Returns `true` if this call cancelled, `false` if it was already set
    pub fn fire(&self) -> bool {
        self.inner.set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_is_one_shot() {
        let signal = CancelSignal::new();
        assert!(!signal.is_set());
        assert!(signal.set());
        assert!(!signal.set());
        assert!(!signal.trigger().fire());
        assert!(signal.is_set());
        assert!(signal.observer().is_set());
    }

    #[test]
    fn test_wait_timeout_elapses_when_unset() {
        let signal = CancelSignal::new();
        let start = Instant::now();
        assert!(!signal.observer().wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_trigger_wakes_waiting_observer() {
        let signal = CancelSignal::new();
        let observer = signal.observer();
        let trigger = signal.trigger();

        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = observer.wait_timeout(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        assert!(trigger.fire());

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_owner_wait_returns_after_fire() {
        let signal = CancelSignal::new();
        let trigger = signal.trigger();
        let firer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            trigger.fire();
        });
        signal.wait();
        assert!(signal.is_set());
        firer.join().unwrap();
    }
}
