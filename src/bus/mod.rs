//! Poll/interrupt coordinator and the queue manager API.
//!
//! [`ApBus`] decides *when* each device's state machine runs. Four sources
//! drive it:
//!
//! - callers, through [`ApBus::submit`];
//! - the hardware interrupt, through [`ApBus::on_hardware_interrupt`];
//! - the shared poll timer, through [`ApBus::check_timer`];
//! - the optional `appoll` thread (`std` only).
//!
//! All of them funnel into the same per-device step: take the device lock,
//! run the state machine until it stops asking for [`ApWait::Again`], release
//! the lock, run completion callbacks, then act on the returned hint. No bus
//! lock is ever held while a device steps, and a pass locks one device at a
//! time.

mod power;
mod thread;
mod timer;

use alloc::collections::BTreeSet;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use axerrno::{ax_err, AxResult};
use spin::Mutex;
use timer_list::TimeValue;

use crate::config::{validate_poll_timeout, ApBusConfig};
use crate::device::{ApDevice, DeviceInfo, DeviceInner};
use crate::hw::{ApQueueOps, InterruptIndicator, QueueId};
use crate::message::{ApMessage, Completions};
use crate::registry::DeviceRegistry;
use crate::sm::{ApEvent, ApWait, InterruptMode, SmContext};

#[cfg(feature = "std")]
pub use self::timer::StdClock;
pub use self::timer::Clock;

use self::timer::BusTimer;

/// The request scheduler for one AP bus.
pub struct ApBus {
    this: Weak<ApBus>,
    ops: Arc<dyn ApQueueOps>,
    clock: Arc<dyn Clock>,
    config: ApBusConfig,
    poll_timeout_ns: AtomicU64,
    registry: DeviceRegistry,
    /// Every queue id ever created; rediscovery works from this set.
    known: Mutex<BTreeSet<QueueId>>,
    /// Sum of `queue_count` over all devices.
    inflight: AtomicUsize,
    indicator: InterruptIndicator,
    suspended: AtomicBool,
    /// Restart the poll thread on resume.
    resume_thread: AtomicBool,
    timer: Mutex<BusTimer>,
    #[cfg(feature = "std")]
    poll_thread: Mutex<Option<thread::PollThread>>,
}

impl ApBus {
    /// Creates a bus driving the queues behind `ops`.
    ///
    /// Starts the poll thread if the configuration asks for it and arms the
    /// rescan timer.
    ///
    /// # Errors
    ///
    /// [`InvalidInput`](axerrno::AxError::InvalidInput) if `config` does not
    /// validate.
    pub fn new(
        ops: Arc<dyn ApQueueOps>,
        clock: Arc<dyn Clock>,
        config: ApBusConfig,
    ) -> AxResult<Arc<Self>> {
        config.validate()?;
        let bus = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ops,
            clock,
            poll_timeout_ns: AtomicU64::new(config.poll_timeout.as_nanos() as u64),
            config,
            registry: DeviceRegistry::new(),
            known: Mutex::new(BTreeSet::new()),
            inflight: AtomicUsize::new(0),
            indicator: InterruptIndicator::new(),
            suspended: AtomicBool::new(false),
            resume_thread: AtomicBool::new(false),
            timer: Mutex::new(BusTimer::new()),
            #[cfg(feature = "std")]
            poll_thread: Mutex::new(None),
        });
        if bus.config.poll_thread {
            if bus.config.use_interrupts {
                debug!("adapter interrupts in use, not starting the poll thread");
            } else if let Err(err) = bus.start_poll_thread() {
                warn!("poll thread not started: {:?}", err);
            }
        }
        bus.arm_rescan();
        debug!(
            "ap bus up: poll {:?}, request timeout {:?}, interrupts {}",
            bus.poll_timeout(),
            bus.config.request_timeout,
            bus.config.use_interrupts
        );
        Ok(bus)
    }

    /// The configuration the bus was created with.
    pub fn config(&self) -> &ApBusConfig {
        &self.config
    }

    /// The clock driving deadlines and timers.
    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// Requests currently held by the hardware, over all devices.
    ///
    /// A scheduling hint only; it may be stale by the time it is read.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Whether adapter interrupts are in use.
    pub fn using_interrupts(&self) -> bool {
        self.config.use_interrupts
    }

    /// The summary indicator the hardware raises with the adapter interrupt.
    pub fn indicator(&self) -> &InterruptIndicator {
        &self.indicator
    }

    /// Current period of the shared poll timer.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_nanos(self.poll_timeout_ns.load(Ordering::Relaxed))
    }

    /// Changes the period of the shared poll timer.
    ///
    /// Takes effect the next time the timer is armed.
    ///
    /// # Errors
    ///
    /// [`InvalidInput`](axerrno::AxError::InvalidInput) for a zero period or
    /// one above [`MAX_POLL_TIMEOUT`](crate::MAX_POLL_TIMEOUT).
    pub fn set_poll_timeout(&self, poll_timeout: Duration) -> AxResult {
        validate_poll_timeout(poll_timeout)?;
        self.poll_timeout_ns
            .store(poll_timeout.as_nanos() as u64, Ordering::Relaxed);
        debug!("poll timeout set to {:?}", poll_timeout);
        Ok(())
    }

    /// Whether passes are suspended for a power transition.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Looks up the device driving `qid`.
    pub fn device(&self, qid: QueueId) -> Option<Arc<ApDevice>> {
        self.registry.get_device(qid)
    }

    /// Every registered device, in queue id order.
    pub fn devices(&self) -> Vec<Arc<ApDevice>> {
        self.registry.snapshot().into_iter().collect()
    }

    /// Snapshot of the device driving `qid`.
    ///
    /// # Errors
    ///
    /// [`NotFound`](axerrno::AxError::NotFound) if no device drives `qid`.
    pub fn device_info(&self, qid: QueueId) -> AxResult<DeviceInfo> {
        match self.registry.get_device(qid) {
            Some(dev) => Ok(dev.info()),
            None => ax_err!(NotFound, "no such device"),
        }
    }

    /// Queue ids the bus has created devices for, past and present.
    pub fn known_queues(&self) -> Vec<QueueId> {
        self.known.lock().iter().copied().collect()
    }

    /// Creates and registers the device for `qid` and starts its reset.
    ///
    /// The device table is sized for one domain, one queue per card. Spreading
    /// devices over several domains still counts every queue against
    /// [`MAX_DEVICES`](crate::MAX_DEVICES).
    ///
    /// # Errors
    ///
    /// - [`InvalidInput`](axerrno::AxError::InvalidInput) for a zero depth.
    /// - [`AlreadyExists`](axerrno::AxError::AlreadyExists) if `qid` already
    ///   has a device.
    /// - [`NoMemory`](axerrno::AxError::NoMemory) once [`MAX_DEVICES`](crate::MAX_DEVICES)
    ///   devices exist.
    /// - [`ResourceBusy`](axerrno::AxError::ResourceBusy) while suspended.
    pub fn device_create(&self, qid: QueueId, queue_depth: usize) -> AxResult<Arc<ApDevice>> {
        if queue_depth == 0 {
            return ax_err!(InvalidInput, "queue depth must not be zero");
        }
        if self.is_suspended() {
            return ax_err!(ResourceBusy, "bus suspended");
        }
        let dev = Arc::new(ApDevice::new(qid, queue_depth));
        self.registry.add_device(dev.clone())?;
        self.known.lock().insert(qid);
        debug!("{}: device created, depth {}", qid, queue_depth);
        self.drive(&dev, ApEvent::Poll);
        Ok(dev)
    }

    /// Unregisters `dev` and fails everything still queued on it with a
    /// retryable error.
    ///
    /// # Errors
    ///
    /// [`NotFound`](axerrno::AxError::NotFound) if `dev` is not registered.
    pub fn device_destroy(&self, dev: &Arc<ApDevice>) -> AxResult {
        self.registry.remove_device(dev)?;
        self.teardown(dev);
        Ok(())
    }

    /// Queues `msg` on `dev` and lets the device make progress right away.
    ///
    /// The outcome arrives through the message callback.
    ///
    /// # Errors
    ///
    /// - [`AlreadyExists`](axerrno::AxError::AlreadyExists) if the correlation
    ///   id is already queued or pending on `dev`.
    /// - [`BadState`](axerrno::AxError::BadState) if `dev` has been destroyed.
    /// - [`ResourceBusy`](axerrno::AxError::ResourceBusy) while suspended.
    ///
    /// A rejected message is dropped without its callback running.
    pub fn submit(&self, dev: &ApDevice, msg: ApMessage) -> AxResult {
        if self.is_suspended() {
            return ax_err!(ResourceBusy, "bus suspended");
        }
        let psmid = msg.psmid();
        dev.lock().enqueue(msg)?;
        trace!("{}: queued {:#x}", dev.qid(), psmid);
        self.drive(dev, ApEvent::Poll);
        Ok(())
    }

    /// Forgets the message with `psmid`.
    ///
    /// Returns `false` if it is in neither queue, typically because it has
    /// already completed. A cancelled message never sees its callback; a
    /// late hardware reply for it is discarded.
    pub fn cancel(&self, dev: &ApDevice, psmid: u64) -> bool {
        let cancelled = dev.lock().cancel(psmid);
        if cancelled.is_some() {
            trace!("{}: cancelled {:#x}", dev.qid(), psmid);
        }
        cancelled.is_some()
    }

    /// Fails every queued and pending message on `dev` with a retryable
    /// error.
    pub fn flush_all(&self, dev: &ApDevice) {
        let mut done = Completions::new();
        dev.lock().flush(&mut done);
        done.run();
    }

    /// Runs `event` on `dev` until the state machine settles, then acts on
    /// the resulting hint.
    pub fn drive(&self, dev: &ApDevice, event: ApEvent) -> ApWait {
        self.step(dev, |inner, ctx| inner.event_loop(event, ctx))
    }

    /// One coordination pass over every device.
    ///
    /// Returns the most urgent hint any device produced.
    pub fn poll_all(&self) -> ApWait {
        if self.is_suspended() {
            return ApWait::None;
        }
        if self.config.use_interrupts {
            // Completions signalled from here on raise a fresh interrupt.
            self.indicator.take();
        }
        self.registry
            .snapshot()
            .iter()
            .fold(ApWait::None, |wait, dev| wait.min(self.poll_device(dev)))
    }

    /// Entry point for the adapter interrupt.
    pub fn on_hardware_interrupt(&self) {
        trace!("adapter interrupt");
        self.poll_all();
    }

    /// Runs every expired bus timer. Called from the host's timer tick.
    ///
    /// Returns whether any timer fired.
    pub fn check_timer(&self, now: TimeValue) -> bool {
        let mut expired = Vec::new();
        {
            let mut timer = self.timer.lock();
            while let Some(event) = timer.expire_one(now) {
                expired.push(event);
            }
        }
        let fired = !expired.is_empty();
        for event in expired {
            timer_list::TimerEvent::callback(event, now);
        }
        fired
    }

    /// Earliest armed timer deadline, for hosts that program a one-shot
    /// timer.
    pub fn next_timer_deadline(&self) -> Option<TimeValue> {
        self.timer.lock().next_deadline()
    }

    /// Whether the shared poll timer is armed.
    pub fn poll_timer_armed(&self) -> bool {
        self.timer.lock().poll_deadline().is_some()
    }

    fn on_poll_timer(&self, _now: TimeValue) {
        self.poll_all();
    }

    /// Checks the request deadline, then polls.
    fn poll_device(&self, dev: &ApDevice) -> ApWait {
        self.step(dev, |inner, ctx| {
            let mut wait = ApWait::None;
            if inner.deadline_expired(ctx.now) {
                wait = inner.event_loop(ApEvent::Timeout, ctx);
            }
            wait.min(inner.event_loop(ApEvent::Poll, ctx))
        })
    }

    /// Runs `f` under the device lock, then completions, then scheduling.
    fn step<F>(&self, dev: &ApDevice, f: F) -> ApWait
    where
        F: FnOnce(&mut DeviceInner, &mut SmContext<'_>) -> ApWait,
    {
        let now = self.clock.now();
        let mut done = Completions::new();
        let (wait, irq_armed, deadline) = {
            let mut inner = dev.lock();
            let mut ctx = self.context(dev, now, &mut done);
            let wait = f(&mut inner, &mut ctx);
            (wait, inner.interrupt == InterruptMode::Enabled, inner.deadline)
        };
        done.run();
        self.schedule(wait, irq_armed, deadline, now);
        wait
    }

    fn context<'a>(
        &'a self,
        dev: &'a ApDevice,
        now: TimeValue,
        done: &'a mut Completions,
    ) -> SmContext<'a> {
        SmContext {
            qid: dev.qid(),
            ops: &*self.ops,
            indicator: self.config.use_interrupts.then_some(&self.indicator),
            now,
            request_timeout: self.config.request_timeout,
            stall_policy: self.config.stall_policy,
            inflight: &self.inflight,
            stats: dev.stats(),
            done,
        }
    }

    /// Acts on a settled hint.
    ///
    /// A device waiting for an interrupt that cannot come is handed to the
    /// poll thread, or to the timer if there is no thread.
    fn schedule(&self, wait: ApWait, irq_armed: bool, deadline: Option<TimeValue>, now: TimeValue) {
        if self.is_suspended() {
            return;
        }
        let next_poll = now + self.poll_timeout();
        match wait {
            ApWait::Again | ApWait::Interrupt if !irq_armed => {
                if !self.wake_poll_thread() {
                    self.arm_poll_timer(next_poll);
                }
            }
            ApWait::Timeout => self.arm_poll_timer(next_poll),
            _ => {}
        }
        if let Some(deadline) = deadline {
            self.arm_poll_timer(deadline.max(next_poll));
        }
    }

    fn arm_poll_timer(&self, deadline: TimeValue) {
        self.timer.lock().arm_poll(deadline, self.this.clone());
    }

    fn arm_rescan(&self) {
        if let Some(period) = self.config.config_time {
            let deadline = self.clock.now() + period;
            self.timer.lock().arm_rescan(deadline, self.this.clone());
        }
    }

    /// Marks `dev` removed, fails its messages and returns its hardware slots
    /// to the global count.
    fn teardown(&self, dev: &ApDevice) {
        let mut done = Completions::new();
        {
            let mut inner = dev.lock();
            inner.removed = true;
            inner.flush(&mut done);
            let outstanding = inner.queue_count;
            inner.release_slots(outstanding, &self.inflight);
            inner.deadline = None;
        }
        debug!("{}: device destroyed, {} message(s) flushed", dev.qid(), done.len());
        done.run();
    }
}

impl core::fmt::Debug for ApBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ApBus")
            .field("devices", &self.registry.device_count())
            .field("inflight", &self.inflight())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}
