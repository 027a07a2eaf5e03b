//! Cancellable stop flag shared between the caller thread and the scheduler.
//!
//! Waiters block on a channel nobody sends on; `raise` drops its only sender, which
//! wakes every waiter at once. `reset` installs a fresh channel.
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct Wake {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

impl Wake {
    fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self { tx: Some(tx), rx }
    }
}

/// Stop request observable from any thread, with a wait that wakes up early when the
/// stop is raised.
#[derive(Clone)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
    wake: Arc<Mutex<Wake>>,
}

impl StopSignal {
    /// Creates a signal in the lowered state.
    pub fn new() -> Self {
        Self {
            raised: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Mutex::new(Wake::new())),
        }
    }

    fn wake(&self) -> MutexGuard<'_, Wake> {
        self.wake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests a stop and wakes every thread blocked in `wait`.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        self.wake().tx.take();
    }

    /// `true` once `raise` has been called (until `reset`).
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Lowers the signal so the owner can be started again.
    pub fn reset(&self) {
        let mut wake = self.wake();
        self.raised.store(false, Ordering::SeqCst);
        *wake = Wake::new();
    }

    /// Sleeps for `timeout` or until the signal is raised. Returns `true` if raised.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_raised() {
            return true;
        }
        let rx = self.wake().rx.clone();
        let _ = rx.recv_timeout(timeout);
        self.is_raised()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
