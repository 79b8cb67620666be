use alloc::sync::Weak;

use timer_list::{TimeValue, TimerEvent, TimerList};

use super::ApBus;

/// Monotonic time source driving deadlines and the poll timer.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> TimeValue;
}

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        /// [`Clock`] backed by [`std::time::Instant`].
        pub struct StdClock {
            origin: std::time::Instant,
        }

        impl StdClock {
            pub fn new() -> Self {
                Self {
                    origin: std::time::Instant::now(),
                }
            }
        }

        impl Default for StdClock {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Clock for StdClock {
            fn now(&self) -> TimeValue {
                self.origin.elapsed()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Next scheduler pass.
    Poll,
    /// Next rediscovery scan.
    Rescan,
}

pub(crate) struct BusTimerEvent {
    kind: TimerKind,
    bus: Weak<ApBus>,
}

impl TimerEvent for BusTimerEvent {
    fn callback(self, now: TimeValue) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        match self.kind {
            TimerKind::Poll => bus.on_poll_timer(now),
            TimerKind::Rescan => bus.rescan(),
        }
    }
}

/// The bus timers: one shared poll timer and the rescan timer.
///
/// At most one event of each kind is armed. Re-arming the poll timer for a
/// later deadline than the armed one is a no-op, so every device that asks
/// for the timer during one pass shares the same expiry.
pub(crate) struct BusTimer {
    timer_list: TimerList<BusTimerEvent>,
    poll_deadline: Option<TimeValue>,
}

impl BusTimer {
    pub(crate) fn new() -> Self {
        Self {
            timer_list: TimerList::new(),
            poll_deadline: None,
        }
    }

    /// Arms the poll timer to fire no later than `deadline`.
    pub(crate) fn arm_poll(&mut self, deadline: TimeValue, bus: Weak<ApBus>) {
        if self.poll_deadline.is_some_and(|armed| armed <= deadline) {
            return;
        }
        self.timer_list.cancel(|event| event.kind == TimerKind::Poll);
        self.timer_list.set(
            deadline,
            BusTimerEvent {
                kind: TimerKind::Poll,
                bus,
            },
        );
        self.poll_deadline = Some(deadline);
    }

    /// Arms the rescan timer at `deadline`, replacing any armed rescan.
    pub(crate) fn arm_rescan(&mut self, deadline: TimeValue, bus: Weak<ApBus>) {
        self.timer_list.cancel(|event| event.kind == TimerKind::Rescan);
        self.timer_list.set(
            deadline,
            BusTimerEvent {
                kind: TimerKind::Rescan,
                bus,
            },
        );
    }

    pub(crate) fn cancel_all(&mut self) {
        self.timer_list.cancel(|_| true);
        self.poll_deadline = None;
    }

    /// Deadline of the armed poll timer.
    pub(crate) fn poll_deadline(&self) -> Option<TimeValue> {
        self.poll_deadline
    }

    /// Earliest armed deadline of either kind.
    pub(crate) fn next_deadline(&self) -> Option<TimeValue> {
        self.timer_list.next_deadline()
    }

    /// Removes one expired event, if any.
    ///
    /// The caller runs its callback after releasing the timer lock.
    pub(crate) fn expire_one(&mut self, now: TimeValue) -> Option<BusTimerEvent> {
        let (deadline, event) = self.timer_list.expire_one(now)?;
        trace!("timer {:?} expired at {:?} (due {:?})", event.kind, now, deadline);
        if event.kind == TimerKind::Poll {
            self.poll_deadline = None;
        }
        Some(event)
    }
}
