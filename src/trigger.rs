//! Deferred work triggers
//!
//! The manager defers future-start and retry invocations to a host
//! scheduling facility through the [`WorkTrigger`] seam. The crate ships
//! [`TimerTrigger`], a tokio-timer implementation for hosts without a
//! platform scheduler. Delivery is at-least-once-or-never: a trigger may
//! fire for a download that was cancelled or paused in the meantime, and
//! the manager treats such firings as no-ops.

use crate::types::DownloadId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Operation a fired trigger should invoke on the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOp {
    /// Invoke `start(id)`
    Start,
    /// Invoke `retry(id)`
    Retry,
}

/// A fired trigger delivered to the manager's dispatch loop
pub type TriggerFire = (TriggerOp, DownloadId);

/// Facility that invokes a manager operation after a delay.
///
/// One pending invocation per download identifier; scheduling again
/// replaces any pending one.
pub trait WorkTrigger: Send + Sync {
    /// Arrange for `op(id)` to fire after `delay`
    fn schedule_after(&self, delay: Duration, op: TriggerOp, id: DownloadId);

    /// Cancel any pending invocation for `id`
    fn cancel(&self, id: DownloadId);
}

/// In-process trigger backed by tokio timers.
///
/// Fired invocations are pushed onto an mpsc channel; the manager drains
/// the receiver. Pending timers do not survive process restart; hosts
/// with a durable job scheduler supply their own [`WorkTrigger`].
pub struct TimerTrigger {
    self_ref: Weak<Self>,
    tx: mpsc::UnboundedSender<TriggerFire>,
    pending: Mutex<HashMap<DownloadId, JoinHandle<()>>>,
}

impl TimerTrigger {
    /// Create a trigger and the receiver its firings arrive on
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TriggerFire>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let trigger = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            tx,
            pending: Mutex::new(HashMap::new()),
        });
        (trigger, rx)
    }

    /// Number of timers currently armed
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl WorkTrigger for TimerTrigger {
    fn schedule_after(&self, delay: Duration, op: TriggerOp, id: DownloadId) {
        let tx = self.tx.clone();
        let weak = self.self_ref.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the manager shut down.
            let _ = tx.send((op, id));
            if let Some(trigger) = weak.upgrade() {
                trigger.pending.lock().remove(&id);
            }
        });

        if let Some(previous) = self.pending.lock().insert(id, task) {
            previous.abort();
        }
    }

    fn cancel(&self, id: DownloadId) {
        if let Some(task) = self.pending.lock().remove(&id) {
            task.abort();
        }
    }
}

impl Drop for TimerTrigger {
    fn drop(&mut self) {
        for (_, task) in self.pending.lock().drain() {
            task.abort();
        }
    }
}
