//! Counted pause/resume gating for new job starts.

use std::sync::Arc;

use tokio::sync::watch;

/// Monotonic pause counter. New job starts wait until it returns to zero;
/// already-running jobs are never affected.
pub(crate) struct PauseGate {
    tx: watch::Sender<usize>,
}

impl PauseGate {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Raise the pause counter and hand back the matching resume function.
    pub(crate) fn pause(gate: &Arc<Self>) -> ResumeHandle {
        gate.tx.send_modify(|count| *count += 1);
        ResumeHandle {
            gate: Arc::clone(gate),
            resumed: false,
        }
    }

    /// Wait until every outstanding pause has been resumed.
    pub(crate) async fn ready(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for errs only when the sender is dropped, and the gate owns it.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Outstanding pause count.
    pub(crate) fn count(&self) -> usize {
        *self.tx.borrow()
    }

    fn release(&self) {
        self.tx.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Resume function returned by [`crate::scheduler::Scheduler::pause`].
///
/// New job starts stay queued until every outstanding handle has resumed.
pub struct ResumeHandle {
    gate: Arc<PauseGate>,
    resumed: bool,
}

impl ResumeHandle {
    /// Match the `pause()` call that produced this handle.
    pub fn resume(mut self) {
        self.resumed = true;
        self.gate.release();
    }
}

impl Drop for ResumeHandle {
    fn drop(&mut self) {
        if !self.resumed {
            // A leaked pause must not wedge the scheduler forever.
            tracing::warn!("pause handle dropped without resume; resuming");
            self.gate.release();
        }
    }
}
