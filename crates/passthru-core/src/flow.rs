//! Per-direction flow control.
//!
//! Every relay direction owns a [`BufferAccount`]: the producer charges
//! bytes on enqueue, the draining writer credits them after the write
//! completes. Crossing the high watermark pauses the direction's
//! [`FlowGate`]; draining down to the low watermark resumes it. The
//! opposite side's read loop awaits [`FlowGate::wait_flowing`] before
//! each read, so a slow consumer stops its producer instead of growing
//! a queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    Flowing,
    Paused,
}

/// Two-state gate. Clones observe the same state.
#[derive(Clone, Debug)]
pub struct FlowGate {
    tx: Arc<watch::Sender<FlowState>>,
}

impl FlowGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(FlowState::Flowing);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> FlowState {
        *self.tx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == FlowState::Paused
    }

    /// Returns `true` if this call moved the gate from flowing to paused.
    pub fn pause(&self) -> bool {
        self.set(FlowState::Paused)
    }

    /// Returns `true` if this call moved the gate from paused to flowing.
    pub fn resume(&self) -> bool {
        self.set(FlowState::Flowing)
    }

    /// Resolves immediately when flowing, otherwise on the next resume.
    pub async fn wait_flowing(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|s| *s == FlowState::Flowing).await;
    }

    fn set(&self, next: FlowState) -> bool {
        self.tx.send_if_modified(|cur| {
            if *cur == next {
                false
            } else {
                *cur = next;
                true
            }
        })
    }
}

impl Default for FlowGate {
    fn default() -> Self {
        Self::new()
    }
}

/// High/low byte thresholds for a [`BufferAccount`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    pub fn new(high: usize, low: usize) -> Self {
        Self {
            high,
            low: low.min(high),
        }
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::new(1024 * 1024, 256 * 1024)
    }
}

/// Result of charging bytes to an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Flowing,
    /// The account is at or past its high watermark; the gate is paused.
    Saturated,
}

/// Byte count in flight for one direction, tied to a gate.
#[derive(Debug)]
pub struct BufferAccount {
    label: &'static str,
    pending: AtomicUsize,
    marks: Watermarks,
    gate: FlowGate,
}

impl BufferAccount {
    pub fn new(label: &'static str, marks: Watermarks) -> Arc<Self> {
        Arc::new(Self {
            label,
            pending: AtomicUsize::new(0),
            marks,
            gate: FlowGate::new(),
        })
    }

    pub fn gate(&self) -> &FlowGate {
        &self.gate
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Charge `n` bytes queued for writing.
    pub fn on_enqueue(&self, n: usize) -> WriteOutcome {
        let now = self.pending.fetch_add(n, Ordering::AcqRel).saturating_add(n);
        if now >= self.marks.high {
            if self.gate.pause() {
                warn!(
                    direction = self.label,
                    pending = now,
                    high = self.marks.high,
                    "backpressure: pausing producer"
                );
            }
            WriteOutcome::Saturated
        } else {
            WriteOutcome::Flowing
        }
    }

    /// Credit `n` bytes the writer has flushed.
    pub fn on_drain(&self, n: usize) {
        let prev = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(n)))
            .unwrap_or_else(|p| p);
        let now = prev.saturating_sub(n);
        if now <= self.marks.low && self.gate.resume() {
            debug!(
                direction = self.label,
                pending = now,
                low = self.marks.low,
                "backpressure: resuming producer"
            );
        }
    }
}
