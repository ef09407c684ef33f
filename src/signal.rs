//! Set-once signals.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A set-once latch carrying a value.
///
/// The first call to [`set`](Signal::set) wins; every later call is a no-op.
/// Waiters woken by [`wait`](Signal::wait) all observe the stored value. A
/// single primitive with atomic set semantics replaces the usual
/// close-channel plus error-variable pair, which is easy to race on.
pub struct Signal<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Store `value` if the signal is not yet set and wake all waiters.
    ///
    /// Returns `true` if this call was the one that set the signal.
    pub fn set(&self, value: T) -> bool {
        {
            let mut slot = self.value.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }

    /// The stored value, if the signal has been set.
    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// Wait until the signal is set and return the stored value.
    pub async fn wait(&self) -> T {
        loop {
            // Register for notification before checking so a set() landing
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(value) = self.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("value", &*self.value.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_writer_wins() {
        let signal = Signal::new();
        assert!(!signal.is_set());
        assert!(signal.set(1));
        assert!(!signal.set(2));
        assert!(signal.is_set());
        assert_eq!(signal.get(), Some(1));
        assert_eq!(signal.wait().await, 1);
    }

    #[tokio::test]
    async fn test_wait_after_set_returns_immediately() {
        let signal = Signal::new();
        signal.set("done");
        assert_eq!(signal.wait().await, "done");
    }

    #[tokio::test]
    async fn test_all_waiters_observe_the_value() {
        let signal = Arc::new(Signal::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.set(7u32);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 7);
        }
    }
}
