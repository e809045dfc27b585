//! Preview frame delivery
//!
//! One bounded queue lives as long as the controller. Each preview run tags
//! its frames with a run number, and the receiver skips frames from runs
//! that have ended, so a restarted preview never shows the previous
//! source's leftovers.

use crate::capture::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

type Tagged = (u64, Frame);

/// Controller side of the preview queue
pub(crate) struct PreviewChannel {
    tx: mpsc::Sender<Tagged>,
    rx: Option<mpsc::Receiver<Tagged>>,
    run: Arc<AtomicU64>,
}

impl PreviewChannel {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        Self {
            tx,
            rx: Some(rx),
            run: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sender for the current run
    pub fn sender(&self) -> PreviewSender {
        PreviewSender {
            tx: self.tx.clone(),
            run: self.run.load(Ordering::SeqCst),
        }
    }

    /// End the current run; its queued frames will be skipped
    pub fn end_run(&self) {
        self.run.fetch_add(1, Ordering::SeqCst);
    }

    pub fn take_receiver(&mut self) -> Option<PreviewReceiver> {
        self.rx.take().map(|rx| PreviewReceiver {
            rx,
            run: self.run.clone(),
        })
    }
}

/// Frame pump side: never blocks, drops the frame when the queue is full
pub(crate) struct PreviewSender {
    tx: mpsc::Sender<Tagged>,
    run: u64,
}

impl PreviewSender {
    /// Returns false if the frame was dropped because the queue is full
    pub fn offer(&self, frame: Frame) -> bool {
        match self.tx.try_send((self.run, frame)) {
            Ok(()) | Err(TrySendError::Closed(_)) => true,
            Err(TrySendError::Full(_)) => false,
        }
    }
}

/// Preview frames for the UI, in capture order
pub struct PreviewReceiver {
    rx: mpsc::Receiver<Tagged>,
    run: Arc<AtomicU64>,
}

impl PreviewReceiver {
    fn is_current(&self, run: u64) -> bool {
        run == self.run.load(Ordering::SeqCst)
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let (run, frame) = self.rx.recv().await?;
            if self.is_current(run) {
                return Some(frame);
            }
        }
    }

    /// For use outside an async runtime
    pub fn blocking_recv(&mut self) -> Option<Frame> {
        loop {
            let (run, frame) = self.rx.blocking_recv()?;
            if self.is_current(run) {
                return Some(frame);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Frame, TryRecvError> {
        loop {
            let (run, frame) = self.rx.try_recv()?;
            if self.is_current(run) {
                return Ok(frame);
            }
        }
    }
}
