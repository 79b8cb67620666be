//! Suspend/resume, periodic rediscovery and shutdown.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use axerrno::AxError;

use super::ApBus;
use crate::device::ApDevice;
use crate::hw::{query_queue, QueueId};
use crate::sm::{ApEvent, ApState, ApWait};

impl ApBus {
    /// Quiesces every device ahead of a power transition.
    ///
    /// Each device stops sending and drains the replies already in flight,
    /// then ends up [`Borked`](ApState::Borked) with nothing held by the
    /// hardware. Draining one device gives up after the request timeout;
    /// whatever is still pending then fails with a retryable error.
    /// Unsent messages stay queued until [`resume_all`](Self::resume_all)
    /// flushes them.
    pub fn suspend_all(&self) {
        if self.suspended.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("suspending {} device(s)", self.registry.device_count());
        for dev in self.registry.snapshot() {
            self.drain(&dev);
        }
        self.timer.lock().cancel_all();
        let was_running = self.stop_poll_thread();
        self.resume_thread.store(was_running, Ordering::Release);
    }

    fn drain(&self, dev: &ApDevice) {
        let limit = self.clock.now() + self.config.request_timeout;
        dev.lock().set_state(dev.qid(), ApState::SuspendWait);
        loop {
            let wait = self.step(dev, |inner, ctx| inner.event(ApEvent::Poll, ctx));
            if wait == ApWait::None {
                break;
            }
            if self.clock.now() >= limit {
                warn!("{}: replies still outstanding at suspend", dev.qid());
                break;
            }
            core::hint::spin_loop();
        }
        self.step(dev, |inner, ctx| {
            inner.abandon_pending(ctx);
            inner.set_state(ctx.qid, ApState::Borked);
            inner.deadline = None;
            ApWait::None
        });
    }

    /// Brings the bus back after a power transition.
    ///
    /// The hardware is assumed to have lost all queue state: every device is
    /// destroyed and each previously known queue that still answers is
    /// created anew. Returns the new devices.
    pub fn resume_all(&self) -> Vec<Arc<ApDevice>> {
        for dev in self.registry.drain_all() {
            self.teardown(&dev);
        }
        self.indicator.take();
        self.suspended.store(false, Ordering::Release);
        if self.resume_thread.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.start_poll_thread() {
                warn!("poll thread not restarted: {:?}", err);
            }
        }
        self.arm_rescan();

        let devices: Vec<_> = self
            .known_queues()
            .into_iter()
            .filter_map(|qid| self.discover(qid))
            .collect();
        debug!("resumed with {} device(s)", devices.len());
        devices
    }

    /// Creates the device for `qid` if the queue answers.
    fn discover(&self, qid: QueueId) -> Option<Arc<ApDevice>> {
        let info = match query_queue(&*self.ops, qid) {
            Ok(info) => info,
            Err(err) => {
                debug!("{}: not rediscovered: {:?}", qid, err);
                return None;
            }
        };
        match self.device_create(qid, info.queue_depth) {
            Ok(dev) => Some(dev),
            Err(err) => {
                warn!("{}: device not created: {:?}", qid, err);
                None
            }
        }
    }

    /// Reconciles the devices with the hardware.
    ///
    /// Over every known queue: a device whose queue is gone is marked
    /// [`Borked`](ApState::Borked), borked devices are destroyed, and known
    /// queues without a device are created again. Re-arms itself.
    pub fn rescan(&self) {
        if self.is_suspended() {
            return;
        }
        trace!("rescan");
        for qid in self.known_queues() {
            let present = query_queue(&*self.ops, qid);
            if let Some(dev) = self.registry.get_device(qid) {
                if present == Err(AxError::NotFound) {
                    let mut inner = dev.lock();
                    if inner.state != ApState::Borked {
                        warn!("{}: queue disappeared", qid);
                        inner.set_state(qid, ApState::Borked);
                        inner.deadline = None;
                    }
                }
                if dev.state() != ApState::Borked {
                    continue;
                }
                // Lost a race with another destroy.
                if self.device_destroy(&dev).is_err() {
                    continue;
                }
            }
            if present.is_ok() {
                self.discover(qid);
            }
        }
        self.arm_rescan();
    }

    /// Stops the subsystem: no more passes, threads or timers, every device
    /// destroyed and every hardware queue reset.
    pub fn shutdown(&self) {
        self.suspended.store(true, Ordering::Release);
        self.stop_poll_thread();
        self.timer.lock().cancel_all();
        for dev in self.registry.drain_all() {
            self.teardown(&dev);
            let status = self.ops.reset(dev.qid());
            trace!("{}: reset at shutdown: {:?}", dev.qid(), status.response_code);
        }
        debug!("ap bus shut down");
    }
}
