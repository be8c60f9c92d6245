//! Pause/resume/stop broadcast to workers
//!
//! The current [`Signal`] lives in a `watch` channel. Workers look at it only
//! between endpoints, so an in-flight probe always runs to completion or to
//! its own timeout. Every pause carries a fresh epoch, which lets a worker
//! count itself paused exactly once per pause cycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Run,
    Pause { epoch: u64 },
    Stop,
}

/// Sending side, owned by the manager
#[derive(Debug)]
pub struct ControlChannel {
    sender: watch::Sender<Signal>,
    epoch: u64,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Signal::Run);
        Self { sender, epoch: 0 }
    }

    /// Broadcast a new pause cycle and return its epoch
    pub fn pause(&mut self) -> u64 {
        self.epoch += 1;
        self.sender.send_replace(Signal::Pause { epoch: self.epoch });
        self.epoch
    }

    pub fn resume(&self) {
        self.sender.send_replace(Signal::Run);
    }

    pub fn stop(&self) {
        self.sender.send_replace(Signal::Stop);
    }

    pub fn current(&self) -> Signal {
        *self.sender.borrow()
    }

    /// A receiving gate for one worker
    pub fn gate(&self, paused_workers: Arc<AtomicUsize>) -> WorkerGate {
        WorkerGate {
            receiver: self.sender.subscribe(),
            paused_workers,
            counted_epoch: None,
        }
    }
}

/// Receiving side, one per worker
#[derive(Debug)]
pub struct WorkerGate {
    receiver: watch::Receiver<Signal>,
    paused_workers: Arc<AtomicUsize>,
    counted_epoch: Option<u64>,
}

impl WorkerGate {
    /// Wait at a job boundary.
    ///
    /// Returns immediately with `true` while running. While paused, counts
    /// the worker once for the current epoch and blocks until the signal
    /// changes. Returns `false` when the worker must exit, including when the
    /// channel has been replaced by a forced stop.
    pub async fn checkpoint(&mut self) -> bool {
        loop {
            let signal = *self.receiver.borrow_and_update();
            match signal {
                Signal::Run => return true,
                Signal::Stop => return false,
                Signal::Pause { epoch } => {
                    if self.counted_epoch != Some(epoch) {
                        self.counted_epoch = Some(epoch);
                        self.paused_workers.fetch_add(1, Ordering::SeqCst);
                    }
                    if self.receiver.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}
