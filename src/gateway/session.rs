//! Per-socket session state: the bounded outbound queue and its
//! backpressure policy.
//!
//! Each accepted socket runs three tasks (inbound reader, outbound writer,
//! heartbeat ticker) joined by this queue. Overflow drops the oldest
//! non-critical frame; acks, errors and pongs are never dropped. Repeated
//! overflow is reported so the gateway can suspend the session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::warn;

use super::frames::ServerFrame;
use crate::core::domain::{OrgId, SessionId, TenantContext};

/// Default outbound queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Consecutive overflows after which the session is suspended.
pub const OVERFLOW_SUSPEND_THRESHOLD: u32 = 3;

/// Result of enqueueing one outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest non-critical frame was dropped to make
    /// room. Carries the consecutive-overflow count.
    Overflowed(u32),
    /// Queue is closed; the frame was discarded.
    Closed,
}

/// Bounded frame queue between the dispatch path and the writer task.
pub struct OutboundQueue {
    frames: Mutex<VecDeque<ServerFrame>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    consecutive_overflows: AtomicU32,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            consecutive_overflows: AtomicU32::new(0),
        }
    }

    /// Enqueue a frame, applying the overflow policy when full.
    pub fn push(&self, frame: ServerFrame) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut frames = self.frames.lock();
            if frames.len() < self.capacity {
                self.consecutive_overflows.store(0, Ordering::Relaxed);
                frames.push_back(frame);
                PushOutcome::Queued
            } else if let Some(pos) = frames.iter().position(|f| !f.is_critical()) {
                frames.remove(pos);
                frames.push_back(frame);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let overflows = self.consecutive_overflows.fetch_add(1, Ordering::Relaxed) + 1;
                PushOutcome::Overflowed(overflows)
            } else if frame.is_critical() {
                // Every queued frame is critical; grow past capacity
                // rather than lose an ack or error.
                frames.push_back(frame);
                let overflows = self.consecutive_overflows.fetch_add(1, Ordering::Relaxed) + 1;
                PushOutcome::Overflowed(overflows)
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let overflows = self.consecutive_overflows.fetch_add(1, Ordering::Relaxed) + 1;
                PushOutcome::Overflowed(overflows)
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Await the next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<ServerFrame> {
        loop {
            if let Some(frame) = self.frames.lock().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue; the writer drains what is left and exits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

/// Shared handle to one live socket session.
pub struct SessionHandle {
    pub session_id: SessionId,
    pub ctx: TenantContext,
    pub is_admin: bool,
    pub queue: Arc<OutboundQueue>,
    /// Cancels the session's tasks in reader -> engine -> writer order.
    pub cancel: watch::Sender<bool>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(session_id: SessionId, ctx: TenantContext, queue_capacity: usize) -> Self {
        let (cancel, _) = watch::channel(false);
        let is_admin = ctx.is_admin();
        Self {
            session_id,
            ctx,
            is_admin,
            queue: Arc::new(OutboundQueue::new(queue_capacity)),
            cancel,
        }
    }

    #[must_use]
    pub fn org(&self) -> &OrgId {
        &self.ctx.organization_id
    }

    /// Enqueue with the slow-consumer policy applied; returns true when
    /// the session should be suspended.
    pub fn send(&self, frame: ServerFrame) -> bool {
        match self.queue.push(frame) {
            PushOutcome::Queued | PushOutcome::Closed => false,
            PushOutcome::Overflowed(count) => {
                warn!(
                    session = %self.session_id,
                    consecutive = count,
                    dropped_total = self.queue.dropped(),
                    "SLOW_CONSUMER: outbound queue overflow"
                );
                count >= OVERFLOW_SUSPEND_THRESHOLD
            }
        }
    }

    /// Begin teardown: stop the reader, close the queue so the writer
    /// drains and exits.
    pub fn shutdown(&self) {
        let _ = self.cancel.send(true);
        self.queue.close();
    }
}
