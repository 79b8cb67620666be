//! Per-device state machine.
//!
//! ```text
//! ResetStart ──> ResetWait ──> SetIrqWait ──> Idle <──> Working <──> QueueFull
//!                    ^                                     │             │
//!                    └──────────── Timeout (stall) ────────┴─────────────┘
//!
//! SuspendWait: drain replies only (power transitions)
//! Borked:      terminal
//! ```
//!
//! Each handler makes at most one send and one receive attempt and answers
//! with an [`ApWait`] hint telling the coordinator when to come back.

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use timer_list::TimeValue;

use crate::config::StallPolicy;
use crate::device::{DeviceInner, DeviceStats};
use crate::hw::{ApQueueOps, ApReply, InterruptIndicator, QueueId, QueueStatus, ResponseCode};
use crate::message::{ApReplyError, Completions};

/// Device states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApState {
    /// A queue reset has to be issued.
    ResetStart,
    /// Waiting for the reset to finish.
    ResetWait,
    /// Waiting for the hardware to arm interrupts.
    SetIrqWait,
    /// Nothing outstanding on the hardware.
    Idle,
    /// Requests outstanding, room for more.
    Working,
    /// Requests outstanding, no room for more.
    QueueFull,
    /// Draining replies ahead of a power transition.
    SuspendWait,
    /// The queue is unusable until the device is destroyed and rediscovered.
    Borked,
}

/// Events fed into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApEvent {
    /// The device might be able to make progress.
    Poll,
    /// The outstanding request window has exceeded its deadline.
    Timeout,
}

/// When the state machine wants to run again.
///
/// Ordered from most to least urgent; combining two hints keeps the more
/// urgent one (`min`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApWait {
    /// Run again right away.
    Again,
    /// Run again after the poll period.
    Timeout,
    /// Run again when the hardware interrupt fires.
    Interrupt,
    /// Nothing to do.
    None,
}

/// Adapter interrupt state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    Disabled,
    EnablePending,
    Enabled,
}

/// Everything a handler needs besides the locked device state.
pub(crate) struct SmContext<'a> {
    pub(crate) qid: QueueId,
    pub(crate) ops: &'a dyn ApQueueOps,
    /// Present when the bus uses adapter interrupts.
    pub(crate) indicator: Option<&'a InterruptIndicator>,
    pub(crate) now: TimeValue,
    pub(crate) request_timeout: Duration,
    pub(crate) stall_policy: StallPolicy,
    pub(crate) inflight: &'a AtomicUsize,
    pub(crate) stats: &'a DeviceStats,
    pub(crate) done: &'a mut Completions,
}

impl DeviceInner {
    /// Runs the handler for `event` in the current state once.
    pub(crate) fn event(&mut self, event: ApEvent, ctx: &mut SmContext<'_>) -> ApWait {
        let wait = match (self.state, event) {
            (ApState::Borked, _) => ApWait::None,
            (ApState::ResetStart, ApEvent::Poll) => self.sm_reset(ctx),
            (ApState::ResetWait, ApEvent::Poll) => self.sm_reset_wait(ctx),
            (ApState::SetIrqWait, ApEvent::Poll) => self.sm_setirq_wait(ctx),
            (ApState::Idle, ApEvent::Poll) => self.sm_write(ctx),
            (ApState::Working, ApEvent::Poll) => self.sm_read_write(ctx),
            (ApState::QueueFull, ApEvent::Poll) => self.sm_read(ctx),
            (ApState::SuspendWait, ApEvent::Poll) => self.sm_suspend_read(ctx),
            (ApState::Working | ApState::QueueFull, ApEvent::Timeout) => self.sm_stall(ctx),
            (_, ApEvent::Timeout) => ApWait::None,
        };
        trace!("{}: {:?} -> {:?}, wait {:?}", ctx.qid, event, self.state, wait);
        wait
    }

    /// Runs `event` until the state machine stops asking to run again.
    pub(crate) fn event_loop(&mut self, event: ApEvent, ctx: &mut SmContext<'_>) -> ApWait {
        loop {
            let wait = self.event(event, ctx);
            match wait {
                // The suspend drain loops on its own, outside the lock.
                ApWait::Again if self.state == ApState::SuspendWait => return ApWait::Timeout,
                ApWait::Again => continue,
                _ => return wait,
            }
        }
    }

    pub(crate) fn set_state(&mut self, qid: QueueId, state: ApState) {
        if self.state != state {
            debug!("{}: {:?} => {:?}", qid, self.state, state);
            self.state = state;
        }
    }

    fn bork(&mut self, ctx: &SmContext<'_>, code: ResponseCode) -> ApWait {
        error!("{}: queue unusable ({:?})", ctx.qid, code);
        self.set_state(ctx.qid, ApState::Borked);
        self.deadline = None;
        ApWait::None
    }

    /// `Idle` or `Working`, depending on outstanding hardware work.
    fn operating_state(&self) -> ApState {
        if self.queue_count > 0 {
            ApState::Working
        } else {
            ApState::Idle
        }
    }

    fn acquire_slot(&mut self, ctx: &SmContext<'_>) {
        self.queue_count += 1;
        ctx.inflight.fetch_add(1, Ordering::AcqRel);
        if self.queue_count == 1 {
            self.deadline = Some(ctx.now + ctx.request_timeout);
        }
    }

    /// Gives back `n` hardware slots; `n` never exceeds `queue_count`.
    pub(crate) fn release_slots(&mut self, n: usize, inflight: &AtomicUsize) {
        let n = n.min(self.queue_count);
        if n == 0 {
            return;
        }
        self.queue_count -= n;
        inflight.fetch_sub(n, Ordering::AcqRel);
        if self.queue_count == 0 {
            self.deadline = None;
        }
    }

    /// Fails every pending request and forgets the hardware slots they held.
    ///
    /// Their ids are remembered until the hardware reports an empty queue, so
    /// a late reply does not free a slot owned by a newer request.
    pub(crate) fn abandon_pending(&mut self, ctx: &mut SmContext<'_>) {
        let outstanding = self.queue_count;
        self.release_slots(outstanding, ctx.inflight);
        for msg in self.pendingq.drain(..) {
            self.abandoned.insert(msg.psmid());
            ctx.done.push(msg, Err(ApReplyError::Retry));
        }
    }

    /// Forgets abandoned ids once the hardware holds nothing.
    fn note_queue_empty(&mut self, status: &QueueStatus) {
        if status.queue_empty && !self.abandoned.is_empty() {
            self.abandoned.clear();
        }
    }

    /// Hands one dequeued reply to the request waiting for it.
    fn complete_reply(&mut self, reply: ApReply, ctx: &mut SmContext<'_>) {
        if self.abandoned.remove(&reply.psmid) {
            debug!("{}: dropping late reply {:#x}", ctx.qid, reply.psmid);
            ctx.stats.record_discard();
            return;
        }
        self.release_slots(1, ctx.inflight);
        if self.queue_count > 0 {
            self.deadline = Some(ctx.now + ctx.request_timeout);
        }
        let pos = self.pendingq.iter().position(|m| m.psmid() == reply.psmid);
        match pos.and_then(|pos| self.pendingq.remove(pos)) {
            Some(msg) => {
                ctx.stats.record_reply();
                ctx.done.push(msg, Ok(reply));
            }
            None => {
                debug!("{}: discarding reply {:#x}", ctx.qid, reply.psmid);
                ctx.stats.record_discard();
            }
        }
    }

    /// Dequeues at most one reply without changing state.
    fn sm_recv(&mut self, ctx: &mut SmContext<'_>) -> QueueStatus {
        let (status, reply) = ctx.ops.receive(ctx.qid);
        match status.response_code {
            ResponseCode::Normal | ResponseCode::NoPendingReply => {
                if let Some(reply) = reply {
                    self.complete_reply(reply, ctx);
                }
                self.note_queue_empty(&status);
                if status.queue_empty && self.queue_count > 0 {
                    // The hardware forgot accepted requests: send them again.
                    warn!(
                        "{}: hardware lost {} request(s), requeueing",
                        ctx.qid, self.queue_count
                    );
                    let lost = self.queue_count;
                    self.release_slots(lost, ctx.inflight);
                    while let Some(msg) = self.pendingq.pop_back() {
                        self.requestq.push_front(msg);
                    }
                }
            }
            _ => {}
        }
        status
    }

    fn sm_read(&mut self, ctx: &mut SmContext<'_>) -> ApWait {
        let status = self.sm_recv(ctx);
        match status.response_code {
            ResponseCode::Normal => {
                if self.queue_count > 0 {
                    self.set_state(ctx.qid, ApState::Working);
                    return ApWait::Again;
                }
                self.set_state(ctx.qid, ApState::Idle);
                if self.requestq.is_empty() {
                    ApWait::None
                } else {
                    ApWait::Again
                }
            }
            ResponseCode::NoPendingReply => {
                if self.queue_count > 0 {
                    return ApWait::Interrupt;
                }
                self.set_state(ctx.qid, ApState::Idle);
                if self.requestq.is_empty() {
                    ApWait::None
                } else {
                    ApWait::Timeout
                }
            }
            code => self.bork(ctx, code),
        }
    }

    fn sm_suspend_read(&mut self, ctx: &mut SmContext<'_>) -> ApWait {
        let status = self.sm_recv(ctx);
        match status.response_code {
            ResponseCode::Normal | ResponseCode::NoPendingReply if self.queue_count > 0 => {
                ApWait::Again
            }
            _ => ApWait::None,
        }
    }

    fn sm_write(&mut self, ctx: &mut SmContext<'_>) -> ApWait {
        let Some(msg) = self.requestq.front() else {
            return ApWait::None;
        };
        if self.queue_count >= self.queue_depth {
            self.set_state(ctx.qid, ApState::QueueFull);
            return ApWait::Interrupt;
        }
        let status = ctx.ops.send(ctx.qid, msg.psmid(), msg.payload(), msg.is_special());
        trace!("{}: send {:#x}: {:?}", ctx.qid, msg.psmid(), status.response_code);
        match status.response_code {
            ResponseCode::Normal => {
                if let Some(msg) = self.requestq.pop_front() {
                    self.pendingq.push_back(msg);
                }
                self.acquire_slot(ctx);
                ctx.stats.record_send();
                if self.queue_count < self.queue_depth {
                    self.set_state(ctx.qid, ApState::Working);
                    ApWait::Again
                } else {
                    self.set_state(ctx.qid, ApState::QueueFull);
                    ApWait::Interrupt
                }
            }
            ResponseCode::QueueFull => {
                self.set_state(ctx.qid, ApState::QueueFull);
                ApWait::Interrupt
            }
            ResponseCode::ResetInProgress | ResponseCode::Busy => {
                self.set_state(ctx.qid, ApState::ResetWait);
                ApWait::Timeout
            }
            code if code.is_request_error() => {
                if let Some(msg) = self.requestq.pop_front() {
                    debug!("{}: request {:#x} rejected: {:?}", ctx.qid, msg.psmid(), code);
                    ctx.stats.record_reject();
                    ctx.done.push(msg, Err(ApReplyError::Rejected));
                }
                ApWait::Again
            }
            code => self.bork(ctx, code),
        }
    }

    fn sm_read_write(&mut self, ctx: &mut SmContext<'_>) -> ApWait {
        let read = self.sm_read(ctx);
        if self.state == ApState::Borked {
            return read;
        }
        read.min(self.sm_write(ctx))
    }

    fn sm_reset(&mut self, ctx: &mut SmContext<'_>) -> ApWait {
        let status = ctx.ops.reset(ctx.qid);
        match status.response_code {
            ResponseCode::Normal | ResponseCode::ResetInProgress => {
                ctx.stats.record_reset();
                self.interrupt = InterruptMode::Disabled;
                self.set_state(ctx.qid, ApState::ResetWait);
                ApWait::Timeout
            }
            ResponseCode::Busy => ApWait::Timeout,
            code => self.bork(ctx, code),
        }
    }

    /// Probes the queue: a reply read when work is outstanding, a plain test
    /// otherwise.
    fn probe(&mut self, ctx: &mut SmContext<'_>) -> QueueStatus {
        if self.queue_count > 0 {
            self.sm_recv(ctx)
        } else {
            let status = ctx.ops.test(ctx.qid).0;
            self.note_queue_empty(&status);
            status
        }
    }

    fn sm_reset_wait(&mut self, ctx: &mut SmContext<'_>) -> ApWait {
        let status = self.probe(ctx);
        match status.response_code {
            ResponseCode::Normal | ResponseCode::NoPendingReply => {
                let next = if self.request_interrupts(ctx) {
                    ApState::SetIrqWait
                } else {
                    self.operating_state()
                };
                self.set_state(ctx.qid, next);
                ApWait::Again
            }
            ResponseCode::Busy | ResponseCode::ResetInProgress => ApWait::Timeout,
            code => self.bork(ctx, code),
        }
    }

    /// Asks the hardware to arm interrupts, if the bus uses them.
    fn request_interrupts(&mut self, ctx: &SmContext<'_>) -> bool {
        let Some(indicator) = ctx.indicator else {
            return false;
        };
        if self.interrupt == InterruptMode::Enabled {
            return false;
        }
        let status = ctx.ops.enable_interrupt(ctx.qid, indicator);
        match status.response_code {
            ResponseCode::Normal | ResponseCode::OtherwiseChanged => {
                self.interrupt = InterruptMode::EnablePending;
                true
            }
            code if code.is_fatal() => {
                error!("{}: registering adapter interrupts failed: {:?}", ctx.qid, code);
                false
            }
            _ => false,
        }
    }

    fn sm_setirq_wait(&mut self, ctx: &mut SmContext<'_>) -> ApWait {
        let status = self.probe(ctx);
        if status.int_enabled {
            self.interrupt = InterruptMode::Enabled;
            let next = self.operating_state();
            self.set_state(ctx.qid, next);
        }
        match status.response_code {
            ResponseCode::Normal | ResponseCode::NoPendingReply if status.int_enabled => {
                ApWait::Again
            }
            ResponseCode::Normal if self.queue_count > 0 => ApWait::Again,
            ResponseCode::Normal | ResponseCode::NoPendingReply => ApWait::Timeout,
            code => self.bork(ctx, code),
        }
    }

    /// A request window exceeded its deadline: reset the queue.
    fn sm_stall(&mut self, ctx: &mut SmContext<'_>) -> ApWait {
        warn!(
            "{}: request timeout with {} outstanding, resetting queue",
            ctx.qid, self.queue_count
        );
        ctx.stats.record_timeout();
        match ctx.stall_policy {
            StallPolicy::FlushPending => self.abandon_pending(ctx),
            StallPolicy::KeepPending => {
                if self.queue_count > 0 {
                    self.deadline = Some(ctx.now + ctx.request_timeout);
                }
            }
        }
        // A busy reset is retried from here on the next pass.
        self.set_state(ctx.qid, ApState::ResetStart);
        self.sm_reset(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::QueueInfo;
    use crate::message::ApMessage;
    use alloc::collections::VecDeque;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// Hardware whose answers are scripted per primitive. Unscripted calls
    /// answer `Normal` (send/reset/test) or `NoPendingReply` (receive).
    #[derive(Default)]
    struct Script {
        send: Mutex<VecDeque<ResponseCode>>,
        reset: Mutex<VecDeque<ResponseCode>>,
        test: Mutex<VecDeque<QueueStatus>>,
        replies: Mutex<VecDeque<u64>>,
        sent: Mutex<Vec<u64>>,
        reset_calls: Mutex<usize>,
    }

    impl ApQueueOps for Script {
        fn test(&self, _qid: QueueId) -> (QueueStatus, QueueInfo) {
            let status = self
                .test
                .lock()
                .pop_front()
                .unwrap_or(QueueStatus::new(ResponseCode::Normal));
            (status, QueueInfo::default())
        }
        fn reset(&self, _qid: QueueId) -> QueueStatus {
            *self.reset_calls.lock() += 1;
            QueueStatus::new(self.reset.lock().pop_front().unwrap_or(ResponseCode::Normal))
        }
        fn enable_interrupt(&self, _qid: QueueId, _ind: &InterruptIndicator) -> QueueStatus {
            QueueStatus::new(ResponseCode::Normal)
        }
        fn send(&self, _qid: QueueId, psmid: u64, _payload: &[u8], _special: bool) -> QueueStatus {
            let code = self.send.lock().pop_front().unwrap_or(ResponseCode::Normal);
            if code == ResponseCode::Normal {
                self.sent.lock().push(psmid);
            }
            QueueStatus::new(code)
        }
        fn receive(&self, _qid: QueueId) -> (QueueStatus, Option<ApReply>) {
            match self.replies.lock().pop_front() {
                Some(psmid) => (
                    QueueStatus::new(ResponseCode::Normal),
                    Some(ApReply { psmid, payload: Vec::new() }),
                ),
                None => (QueueStatus::new(ResponseCode::NoPendingReply), None),
            }
        }
    }

    struct Harness {
        hw: Script,
        inflight: AtomicUsize,
        stats: DeviceStats,
        inner: DeviceInner,
        log: Arc<Mutex<Vec<(u64, Result<(), ApReplyError>)>>>,
        policy: StallPolicy,
    }

    impl Harness {
        fn new(depth: usize) -> Self {
            let mut inner = DeviceInner::new(depth);
            inner.state = ApState::Idle;
            Self {
                hw: Script::default(),
                inflight: AtomicUsize::new(0),
                stats: DeviceStats::default(),
                inner,
                log: Arc::new(Mutex::new(Vec::new())),
                policy: StallPolicy::FlushPending,
            }
        }

        fn submit(&mut self, psmid: u64) {
            let log = self.log.clone();
            let msg = ApMessage::new(psmid, Vec::new(), move |res| {
                log.lock().push((psmid, res.map(|_| ())));
            });
            self.inner.enqueue(msg).unwrap();
        }

        fn run(&mut self, event: ApEvent) -> ApWait {
            let mut done = Completions::new();
            let wait = {
                let mut ctx = SmContext {
                    qid: QueueId::new(1, 0),
                    ops: &self.hw,
                    indicator: None,
                    now: Duration::from_secs(1),
                    request_timeout: Duration::from_secs(5),
                    stall_policy: self.policy,
                    inflight: &self.inflight,
                    stats: &self.stats,
                    done: &mut done,
                };
                self.inner.event_loop(event, &mut ctx)
            };
            done.run();
            wait
        }
    }

    #[test]
    fn test_wait_ordering() {
        assert_eq!(ApWait::Again.min(ApWait::None), ApWait::Again);
        assert_eq!(ApWait::Interrupt.min(ApWait::Timeout), ApWait::Timeout);
        assert_eq!(ApWait::None.min(ApWait::Interrupt), ApWait::Interrupt);
    }

    #[test]
    fn test_idle_sends_until_full() {
        let mut h = Harness::new(2);
        for psmid in 1..=3 {
            h.submit(psmid);
        }
        assert_eq!(h.run(ApEvent::Poll), ApWait::Interrupt);
        assert_eq!(h.inner.state, ApState::QueueFull);
        assert_eq!(h.inner.queue_count, 2);
        assert_eq!(h.inflight.load(Ordering::SeqCst), 2);
        assert_eq!(*h.hw.sent.lock(), alloc::vec![1, 2]);
        assert_eq!(h.inner.requestq.len(), 1);
        assert!(h.inner.deadline.is_some());
    }

    #[test]
    fn test_reject_fails_only_that_message() {
        let mut h = Harness::new(4);
        h.hw.send.lock().push_back(ResponseCode::MessageTooBig);
        h.submit(1);
        h.submit(2);
        assert_eq!(h.run(ApEvent::Poll), ApWait::Interrupt);
        assert_eq!(*h.log.lock(), alloc::vec![(1, Err(ApReplyError::Rejected))]);
        assert_eq!(h.inner.state, ApState::Working);
        assert_eq!(h.stats.rejects(), 1);
    }

    #[test]
    fn test_busy_send_goes_to_reset_wait() {
        let mut h = Harness::new(4);
        h.hw.send.lock().push_back(ResponseCode::ResetInProgress);
        h.submit(1);
        assert_eq!(h.run(ApEvent::Poll), ApWait::Timeout);
        assert_eq!(h.inner.state, ApState::ResetWait);
        assert_eq!(h.inner.requestq.len(), 1);

        // Reset finished: back to work, the message goes out.
        assert_eq!(h.run(ApEvent::Poll), ApWait::Interrupt);
        assert_eq!(h.inner.state, ApState::Working);
        assert_eq!(*h.hw.sent.lock(), alloc::vec![1]);
    }

    #[test]
    fn test_fatal_send_borks() {
        let mut h = Harness::new(4);
        h.hw.send.lock().push_back(ResponseCode::Checkstopped);
        h.submit(1);
        assert_eq!(h.run(ApEvent::Poll), ApWait::None);
        assert_eq!(h.inner.state, ApState::Borked);
        // Borked does not drain by itself.
        assert_eq!(h.inner.requestq.len(), 1);
        assert!(h.log.lock().is_empty());
        assert_eq!(h.run(ApEvent::Timeout), ApWait::None);
        assert_eq!(h.run(ApEvent::Poll), ApWait::None);
    }

    #[test]
    fn test_stale_reply_discarded() {
        let mut h = Harness::new(4);
        h.submit(1);
        h.run(ApEvent::Poll);
        assert!(h.inner.cancel(1).is_some());
        h.hw.replies.lock().push_back(1);
        assert_eq!(h.run(ApEvent::Poll), ApWait::None);
        assert_eq!(h.inner.state, ApState::Idle);
        assert_eq!(h.inner.queue_count, 0);
        assert_eq!(h.stats.discards(), 1);
        assert!(h.log.lock().is_empty());
    }

    #[test]
    fn test_stall_flushes_pending() {
        let mut h = Harness::new(4);
        h.submit(1);
        h.submit(2);
        h.run(ApEvent::Poll);
        assert_eq!(h.inner.queue_count, 2);

        assert_eq!(h.run(ApEvent::Timeout), ApWait::Timeout);
        assert_eq!(h.inner.state, ApState::ResetWait);
        assert_eq!(h.inner.queue_count, 0);
        assert_eq!(h.inflight.load(Ordering::SeqCst), 0);
        assert_eq!(
            *h.log.lock(),
            alloc::vec![(1, Err(ApReplyError::Retry)), (2, Err(ApReplyError::Retry))]
        );
        assert_eq!(h.stats.timeouts(), 1);
    }

    #[test]
    fn test_stall_keeps_pending() {
        let mut h = Harness::new(4);
        h.policy = StallPolicy::KeepPending;
        h.submit(1);
        h.run(ApEvent::Poll);
        h.run(ApEvent::Timeout);
        assert_eq!(h.inner.state, ApState::ResetWait);
        assert_eq!(h.inner.queue_count, 1);
        assert_eq!(h.inner.pendingq.len(), 1);

        // The reply still arrives after the reset.
        h.hw.replies.lock().push_back(1);
        h.run(ApEvent::Poll);
        assert_eq!(*h.log.lock(), alloc::vec![(1, Ok(()))]);
        assert_eq!(h.inner.state, ApState::Idle);
    }

    #[test]
    fn test_late_reply_after_stall_keeps_slot() {
        let mut h = Harness::new(4);
        h.submit(1);
        h.run(ApEvent::Poll);
        h.run(ApEvent::Timeout);
        assert_eq!(h.run(ApEvent::Poll), ApWait::None);
        assert_eq!(h.inner.state, ApState::Idle);

        h.submit(2);
        assert_eq!(h.run(ApEvent::Poll), ApWait::Interrupt);
        assert_eq!(h.inner.queue_count, 1);

        // The reset left request 1 on the hardware and its reply shows up.
        h.hw.replies.lock().push_back(1);
        assert_eq!(h.run(ApEvent::Poll), ApWait::Interrupt);
        assert_eq!(h.inner.state, ApState::Working);
        assert_eq!(h.inner.queue_count, 1);
        assert_eq!(h.inflight.load(Ordering::SeqCst), 1);
        assert!(h.inner.deadline.is_some());
        assert_eq!(h.stats.discards(), 1);

        h.hw.replies.lock().push_back(2);
        assert_eq!(h.run(ApEvent::Poll), ApWait::None);
        assert_eq!(
            *h.log.lock(),
            alloc::vec![(1, Err(ApReplyError::Retry)), (2, Ok(()))]
        );
        assert_eq!(h.inner.queue_count, 0);
        assert_eq!(h.inflight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abandoned_ids_forgotten_on_empty_queue() {
        let mut h = Harness::new(4);
        h.submit(1);
        h.run(ApEvent::Poll);
        h.hw
            .test
            .lock()
            .push_back(QueueStatus::new(ResponseCode::Normal).with_queue_empty(true));
        h.run(ApEvent::Timeout);
        assert!(h.inner.abandoned.contains(&1));
        assert_eq!(h.run(ApEvent::Poll), ApWait::None);
        assert!(h.inner.abandoned.is_empty());
        assert_eq!(h.inner.state, ApState::Idle);
    }

    #[test]
    fn test_busy_stall_reset_is_retried() {
        let mut h = Harness::new(4);
        h.submit(1);
        h.run(ApEvent::Poll);
        h.hw.reset.lock().push_back(ResponseCode::Busy);
        assert_eq!(h.run(ApEvent::Timeout), ApWait::Timeout);
        assert_eq!(h.inner.state, ApState::ResetStart);
        assert_eq!(*h.hw.reset_calls.lock(), 1);
        assert_eq!(h.stats.resets(), 0);

        // New work waits for the reset instead of going out.
        h.submit(2);
        assert_eq!(h.run(ApEvent::Poll), ApWait::Timeout);
        assert_eq!(*h.hw.reset_calls.lock(), 2);
        assert_eq!(h.stats.resets(), 1);
        assert_eq!(h.inner.state, ApState::ResetWait);
        assert_eq!(*h.hw.sent.lock(), alloc::vec![1]);

        assert_eq!(h.run(ApEvent::Poll), ApWait::Interrupt);
        assert_eq!(h.inner.state, ApState::Working);
        assert_eq!(*h.hw.sent.lock(), alloc::vec![1, 2]);
    }

    #[test]
    fn test_lost_requests_are_requeued() {
        let mut h = Harness::new(4);
        h.submit(1);
        h.submit(2);
        h.run(ApEvent::Poll);
        h.submit(3);
        // Keep 3 from being sent before the loss is noticed.
        h.inner.queue_depth = 2;
        h.inner.state = ApState::QueueFull;

        struct Forgetful;
        impl ApQueueOps for Forgetful {
            fn test(&self, _q: QueueId) -> (QueueStatus, QueueInfo) {
                (QueueStatus::new(ResponseCode::Normal), QueueInfo::default())
            }
            fn reset(&self, _q: QueueId) -> QueueStatus {
                QueueStatus::new(ResponseCode::Normal)
            }
            fn enable_interrupt(&self, _q: QueueId, _i: &InterruptIndicator) -> QueueStatus {
                QueueStatus::new(ResponseCode::Normal)
            }
            fn send(&self, _q: QueueId, _p: u64, _d: &[u8], _s: bool) -> QueueStatus {
                QueueStatus::new(ResponseCode::QueueFull)
            }
            fn receive(&self, _q: QueueId) -> (QueueStatus, Option<ApReply>) {
                let status = QueueStatus::new(ResponseCode::NoPendingReply).with_queue_empty(true);
                (status, None)
            }
        }

        let mut done = Completions::new();
        let mut ctx = SmContext {
            qid: QueueId::new(1, 0),
            ops: &Forgetful,
            indicator: None,
            now: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            stall_policy: StallPolicy::FlushPending,
            inflight: &h.inflight,
            stats: &h.stats,
            done: &mut done,
        };
        h.inner.event(ApEvent::Poll, &mut ctx);
        assert_eq!(h.inner.queue_count, 0);
        assert_eq!(h.inflight.load(Ordering::SeqCst), 0);
        let order: Vec<u64> = h.inner.requestq.iter().map(|m| m.psmid()).collect();
        assert_eq!(order, alloc::vec![1, 2, 3]);
        assert_eq!(done.len(), 0);
    }

    #[test]
    fn test_reset_fatal_is_terminal() {
        let mut h = Harness::new(4);
        h.inner.state = ApState::ResetStart;
        h.hw.reset.lock().push_back(ResponseCode::Deconfigured);
        assert_eq!(h.run(ApEvent::Poll), ApWait::None);
        assert_eq!(h.inner.state, ApState::Borked);
        for _ in 0..3 {
            assert_eq!(h.run(ApEvent::Poll), ApWait::None);
            assert_eq!(h.run(ApEvent::Timeout), ApWait::None);
        }
        assert_eq!(h.inner.state, ApState::Borked);
    }

    #[test]
    fn test_reset_wait_polls_until_ready() {
        let mut h = Harness::new(4);
        h.inner.state = ApState::ResetStart;
        h.hw
            .test
            .lock()
            .push_back(QueueStatus::new(ResponseCode::ResetInProgress));
        assert_eq!(h.run(ApEvent::Poll), ApWait::Timeout);
        assert_eq!(h.inner.state, ApState::ResetWait);
        assert_eq!(h.run(ApEvent::Poll), ApWait::Timeout);
        assert_eq!(h.inner.state, ApState::ResetWait);
        assert_eq!(h.run(ApEvent::Poll), ApWait::None);
        assert_eq!(h.inner.state, ApState::Idle);
        assert_eq!(h.stats.resets(), 1);
    }
}
