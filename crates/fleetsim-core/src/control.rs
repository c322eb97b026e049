//! Per-session run flag, timer ownership, and stop signalling.
//!
//! A [`SessionControl`] is shared between a session's main loop, every
//! timer task it schedules, and the runner that owns it. All state that
//! decides whether a send may still happen sits behind one gate: a stop
//! takes the gate, flips `running` off, and aborts every tracked timer,
//! while a timer that fires takes the same gate and only sends if the
//! session is still running. Once [`SessionControl::stop`] returns, no
//! timer of that session can send again.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Run flag plus the set of outstanding timer tasks of one session.
#[derive(Debug)]
pub struct SessionControl {
    gate: Mutex<Gate>,
    stopped: Notify,
}

#[derive(Debug)]
struct Gate {
    running: bool,
    timers: Vec<AbortHandle>,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl {
    /// A running control with no timers.
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(Gate {
                running: true,
                timers: Vec::new(),
            }),
            stopped: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the session is still running.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Stop the session and cancel every tracked timer.
    ///
    /// Idempotent. Returns `true` only for the call that actually stopped
    /// the session.
    pub fn stop(&self) -> bool {
        let timers = {
            let mut gate = self.lock();
            if !gate.running {
                return false;
            }
            gate.running = false;
            std::mem::take(&mut gate.timers)
        };
        for timer in timers {
            timer.abort();
        }
        self.stopped.notify_one();
        true
    }

    /// Take ownership of a timer task so [`stop`](Self::stop) cancels it.
    ///
    /// If the session has already stopped the task is aborted on the spot
    /// and `false` is returned.
    pub fn track(&self, timer: AbortHandle) -> bool {
        let mut gate = self.lock();
        if !gate.running {
            drop(gate);
            timer.abort();
            return false;
        }
        gate.timers.retain(|t| !t.is_finished());
        gate.timers.push(timer);
        true
    }

    /// Run `action` only if the session is still running.
    ///
    /// The gate is held for the duration of `action`, so a concurrent
    /// [`stop`](Self::stop) either happens entirely before it (and
    /// `action` is skipped) or waits for it to finish.
    pub fn fire<T>(&self, action: impl FnOnce() -> T) -> Option<T> {
        let gate = self.lock();
        if gate.running { Some(action()) } else { None }
    }

    /// Number of tracked timers that have not finished yet.
    pub fn pending_timers(&self) -> usize {
        self.lock().timers.iter().filter(|t| !t.is_finished()).count()
    }

    /// Wait until the session is stopped.
    pub async fn stopped(&self) {
        while self.is_running() {
            self.stopped.notified().await;
        }
    }
}

/// How a unit session came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// [`SessionControl::stop`] was called from outside.
    Stopped,
    /// The session's duration elapsed.
    TimedOut,
    /// The connection closed.
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// A send failed and the session stopped itself.
    SendFailed,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn stop_is_idempotent() {
        let control = SessionControl::new();
        assert!(control.is_running());
        assert!(control.stop());
        assert!(!control.stop());
        assert!(!control.is_running());
    }

    #[test]
    fn fire_is_skipped_after_stop() {
        let control = SessionControl::new();
        assert_eq!(control.fire(|| 1), Some(1));
        control.stop();
        assert_eq!(control.fire(|| 2), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_tracked_timers() {
        let control = Arc::new(SessionControl::new());
        let fired = Arc::new(AtomicUsize::new(0));

        for offset in [100_u64, 200, 300] {
            let control_task = Arc::clone(&control);
            let fired_task = Arc::clone(&fired);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(offset)).await;
                control_task.fire(|| fired_task.fetch_add(1, Ordering::SeqCst));
            });
            assert!(control.track(handle.abort_handle()));
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        control.stop();
        assert_eq!(control.pending_timers(), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tracking_after_stop_aborts_immediately() {
        let control = SessionControl::new();
        control.stop();
        let handle = tokio::spawn(std::future::pending::<()>());
        assert!(!control.track(handle.abort_handle()));
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn stopped_resolves_after_stop() {
        let control = Arc::new(SessionControl::new());
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.stopped().await })
        };
        tokio::task::yield_now().await;
        control.stop();
        waiter.await.unwrap();
        // Already stopped: returns immediately.
        control.stopped().await;
    }
}
