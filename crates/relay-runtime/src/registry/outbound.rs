use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use relay_core::message::Priority;

/// A serialized frame awaiting transport write.
///
/// The bytes are the shared serialization buffer; cloning a frame clones a
/// reference, not the payload.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub bytes: Bytes,
    pub priority: Priority,
}

impl OutboundFrame {
    /// Wrap a serialized buffer at the given priority.
    pub fn new(bytes: Bytes, priority: Priority) -> Self {
        Self { bytes, priority }
    }

    /// Control-frame shortcut: normal priority.
    pub fn control(bytes: Bytes) -> Self {
        Self::new(bytes, Priority::Normal)
    }
}

/// Outcome of pushing a frame onto an outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued.
    Queued,
    /// Enqueued after evicting the oldest non-critical frame.
    QueuedEvictedOldest,
    /// Queue full of critical frames; the non-critical frame was dropped.
    Dropped,
    /// Queue full of critical frames and the frame is critical; the
    /// connection must be disconnected.
    RejectedCritical,
    /// The queue is closed.
    Closed,
}

impl PushOutcome {
    /// Whether the frame was admitted to the queue.
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued | Self::QueuedEvictedOldest)
    }
}

struct Inner {
    frames: VecDeque<OutboundFrame>,
    closed: bool,
}

/// Per-connection bounded outbound queue.
///
/// Single consumer: the connection's writer task. Producers push serialized
/// frames without blocking; when the queue is full the oldest non-critical
/// frame is evicted to admit the newcomer.
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue bounded at `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push a frame, applying the back-pressure policy when full.
    pub fn push(&self, frame: OutboundFrame) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            if inner.frames.len() < self.capacity {
                inner.frames.push_back(frame);
                PushOutcome::Queued
            } else {
                let evict = inner
                    .frames
                    .iter()
                    .position(|f| f.priority < Priority::Critical);
                match evict {
                    Some(idx) => {
                        inner.frames.remove(idx);
                        inner.frames.push_back(frame);
                        PushOutcome::QueuedEvictedOldest
                    }
                    None if frame.priority == Priority::Critical => PushOutcome::RejectedCritical,
                    None => PushOutcome::Dropped,
                }
            }
        };

        if outcome.is_queued() {
            self.notify.notify_one();
        }
        outcome
    }

    /// Receive the next frame; resolves to `None` once the queue is closed
    /// and drained.
    pub async fn recv(&self) -> Option<OutboundFrame> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking receive, for tests and draining.
    pub fn try_recv(&self) -> Option<OutboundFrame> {
        self.inner.lock().frames.pop_front()
    }

    /// Close the queue; pending frames are dropped.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.frames.clear();
        drop(inner);
        self.notify.notify_one();
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
