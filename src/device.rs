//! One hardware queue: its state, request/pending queues and counters.

use alloc::collections::{BTreeSet, VecDeque};
use core::sync::atomic::{AtomicU64, Ordering};

use axerrno::{ax_err, AxResult};
use spin::{Mutex, MutexGuard};
use timer_list::TimeValue;

use crate::hw::QueueId;
use crate::message::{ApMessage, ApReplyError, Completions};
use crate::sm::{ApState, InterruptMode};

/// Counters for one device. Updated without taking the device lock.
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Requests accepted by the hardware.
    pub send_count: AtomicU64,
    /// Replies matched to a pending request.
    pub reply_count: AtomicU64,
    /// Requests the hardware refused.
    pub reject_count: AtomicU64,
    /// Replies that matched no pending request.
    pub discard_count: AtomicU64,
    /// Queue resets issued.
    pub reset_count: AtomicU64,
    /// Request timeouts.
    pub timeout_count: AtomicU64,
}

impl DeviceStats {
    #[inline]
    pub(crate) fn record_send(&self) {
        self.send_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reply(&self) {
        self.reply_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reject(&self) {
        self.reject_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_discard(&self) {
        self.discard_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reset(&self) {
        self.reset_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_timeout(&self) {
        self.timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests accepted by the hardware.
    #[inline]
    pub fn sends(&self) -> u64 {
        self.send_count.load(Ordering::Relaxed)
    }

    /// Replies delivered to callbacks.
    #[inline]
    pub fn replies(&self) -> u64 {
        self.reply_count.load(Ordering::Relaxed)
    }

    /// Requests refused by the hardware.
    #[inline]
    pub fn rejects(&self) -> u64 {
        self.reject_count.load(Ordering::Relaxed)
    }

    /// Replies discarded because nobody waited for them any more.
    #[inline]
    pub fn discards(&self) -> u64 {
        self.discard_count.load(Ordering::Relaxed)
    }

    /// Queue resets issued.
    #[inline]
    pub fn resets(&self) -> u64 {
        self.reset_count.load(Ordering::Relaxed)
    }

    /// Request timeouts seen.
    #[inline]
    pub fn timeouts(&self) -> u64 {
        self.timeout_count.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub qid: QueueId,
    pub state: ApState,
    pub interrupt: InterruptMode,
    pub queue_depth: usize,
    /// Requests held by the hardware.
    pub queue_count: usize,
    /// Requests not yet sent.
    pub requestq_count: usize,
    /// Requests sent and still awaited.
    pub pendingq_count: usize,
    /// Requests ever submitted.
    pub total_request_count: u64,
}

/// State guarded by the device lock.
pub(crate) struct DeviceInner {
    pub(crate) state: ApState,
    pub(crate) interrupt: InterruptMode,
    pub(crate) queue_depth: usize,
    pub(crate) queue_count: usize,
    pub(crate) requestq: VecDeque<ApMessage>,
    pub(crate) pendingq: VecDeque<ApMessage>,
    /// Ids failed by a stall whose requests may still sit on the hardware.
    /// Their replies are dropped without giving back a slot.
    pub(crate) abandoned: BTreeSet<u64>,
    pub(crate) deadline: Option<TimeValue>,
    pub(crate) total_request_count: u64,
    pub(crate) removed: bool,
}

impl DeviceInner {
    pub(crate) fn new(queue_depth: usize) -> Self {
        Self {
            state: ApState::ResetStart,
            interrupt: InterruptMode::Disabled,
            queue_depth,
            queue_count: 0,
            requestq: VecDeque::new(),
            pendingq: VecDeque::new(),
            abandoned: BTreeSet::new(),
            deadline: None,
            total_request_count: 0,
            removed: false,
        }
    }

    /// Whether `psmid` is queued or pending on this device.
    pub(crate) fn contains(&self, psmid: u64) -> bool {
        self.requestq
            .iter()
            .chain(self.pendingq.iter())
            .any(|msg| msg.psmid() == psmid)
    }

    /// Appends `msg` to the request queue.
    pub(crate) fn enqueue(&mut self, msg: ApMessage) -> AxResult {
        if self.removed {
            return ax_err!(BadState, "device has been removed");
        }
        if self.contains(msg.psmid()) {
            return ax_err!(AlreadyExists, "correlation id already queued");
        }
        self.requestq.push_back(msg);
        self.total_request_count += 1;
        Ok(())
    }

    /// Unlinks the message with `psmid` from either queue.
    ///
    /// A message that was already sent stays on the hardware; its reply is
    /// discarded when it arrives.
    pub(crate) fn cancel(&mut self, psmid: u64) -> Option<ApMessage> {
        if let Some(pos) = self.requestq.iter().position(|m| m.psmid() == psmid) {
            return self.requestq.remove(pos);
        }
        let pos = self.pendingq.iter().position(|m| m.psmid() == psmid)?;
        self.pendingq.remove(pos)
    }

    /// Fails every queued and pending message with a retryable error.
    pub(crate) fn flush(&mut self, done: &mut Completions) {
        for msg in self.pendingq.drain(..).chain(self.requestq.drain(..)) {
            done.push(msg, Err(ApReplyError::Retry));
        }
    }

    /// The request window has been outstanding past its deadline.
    #[inline]
    pub(crate) fn deadline_expired(&self, now: TimeValue) -> bool {
        self.queue_count > 0 && self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// One hardware command queue.
///
/// All queue state sits behind a per-device lock; devices never share a lock,
/// so passes over several devices take one lock at a time.
pub struct ApDevice {
    qid: QueueId,
    inner: Mutex<DeviceInner>,
    stats: DeviceStats,
}

impl ApDevice {
    pub(crate) fn new(qid: QueueId, queue_depth: usize) -> Self {
        Self {
            qid,
            inner: Mutex::new(DeviceInner::new(queue_depth)),
            stats: DeviceStats::default(),
        }
    }

    /// The hardware queue this device drives.
    #[inline]
    pub fn qid(&self) -> QueueId {
        self.qid
    }

    /// Device counters.
    #[inline]
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Current state of the state machine.
    pub fn state(&self) -> ApState {
        self.inner.lock().state
    }

    /// Snapshot of the device.
    pub fn info(&self) -> DeviceInfo {
        let inner = self.inner.lock();
        DeviceInfo {
            qid: self.qid,
            state: inner.state,
            interrupt: inner.interrupt,
            queue_depth: inner.queue_depth,
            queue_count: inner.queue_count,
            requestq_count: inner.requestq.len(),
            pendingq_count: inner.pendingq.len(),
            total_request_count: inner.total_request_count,
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock()
    }
}

impl core::fmt::Debug for ApDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ApDevice").field("qid", &self.qid).finish()
    }
}
