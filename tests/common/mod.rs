#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apqueue::{
    ApBus, ApBusConfig, ApDevice, ApMessage, ApQueueOps, ApReply, ApReplyError, Clock,
    InterruptIndicator, QueueId, QueueInfo, QueueStatus, ResponseCode,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// State of one simulated hardware queue.
#[derive(Default)]
pub struct MockQueue {
    pub depth: usize,
    /// Accepted requests without a reply yet, oldest first.
    pub held: VecDeque<u64>,
    /// Replies ready to be dequeued.
    pub ready: VecDeque<u64>,
    /// Scripted answers, consumed before the default behaviour applies.
    pub send_script: VecDeque<ResponseCode>,
    pub reset_script: VecDeque<ResponseCode>,
    pub test_script: VecDeque<ResponseCode>,
    /// Answer every primitive with this code.
    pub gone: Option<ResponseCode>,
    /// Make every accepted request ready right away.
    pub auto_reply: bool,
    /// Let resets leave accepted requests in place.
    pub keep_on_reset: bool,
    pub irq_enabled: bool,
    /// Every psmid accepted, in order.
    pub sent: Vec<u64>,
    pub resets: usize,
    /// Sends attempted while the hardware was full.
    pub overfull_sends: usize,
    pub max_held: usize,
}

impl MockQueue {
    fn outstanding(&self) -> usize {
        self.held.len() + self.ready.len()
    }

    fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }

    fn status(&self, code: ResponseCode) -> QueueStatus {
        QueueStatus::new(code)
            .with_queue_empty(self.is_empty())
            .with_int_enabled(self.irq_enabled)
    }
}

/// Simulated AP hardware.
#[derive(Default)]
pub struct MockAp {
    queues: Mutex<BTreeMap<QueueId, MockQueue>>,
    indicator: Mutex<Option<InterruptIndicator>>,
}

impl MockAp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Plugs in a queue of `depth`.
    pub fn add_queue(&self, qid: QueueId, depth: usize) {
        self.queues.lock().unwrap().insert(
            qid,
            MockQueue {
                depth,
                ..Default::default()
            },
        );
    }

    /// Runs `f` on the state of `qid`.
    pub fn with<R>(&self, qid: QueueId, f: impl FnOnce(&mut MockQueue) -> R) -> R {
        let mut queues = self.queues.lock().unwrap();
        f(queues.get_mut(&qid).expect("queue not plugged in"))
    }

    /// Finishes the `n` oldest accepted requests of `qid`.
    pub fn complete(&self, qid: QueueId, n: usize) {
        let irq = self.with(qid, |q| {
            for _ in 0..n {
                if let Some(psmid) = q.held.pop_front() {
                    q.ready.push_back(psmid);
                }
            }
            q.irq_enabled
        });
        if irq {
            self.raise();
        }
    }

    /// Finishes every accepted request of `qid`.
    pub fn complete_all(&self, qid: QueueId) {
        let n = self.with(qid, |q| q.held.len());
        self.complete(qid, n);
    }

    pub fn sent(&self, qid: QueueId) -> Vec<u64> {
        self.with(qid, |q| q.sent.clone())
    }

    /// Whether an adapter interrupt is raised and not yet taken.
    pub fn interrupt_pending(&self) -> bool {
        self.indicator
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|ind| ind.is_raised())
    }

    fn raise(&self) {
        if let Some(ind) = self.indicator.lock().unwrap().as_ref() {
            ind.raise();
        }
    }
}

impl ApQueueOps for MockAp {
    fn test(&self, qid: QueueId) -> (QueueStatus, QueueInfo) {
        let mut queues = self.queues.lock().unwrap();
        let Some(q) = queues.get_mut(&qid) else {
            return (
                QueueStatus::new(ResponseCode::QueueNotAvailable),
                QueueInfo::default(),
            );
        };
        let info = QueueInfo {
            queue_depth: q.depth,
            device_type: 11,
            facilities: 0,
        };
        if let Some(code) = q.gone {
            return (QueueStatus::new(code), info);
        }
        let code = q.test_script.pop_front().unwrap_or(ResponseCode::Normal);
        (q.status(code), info)
    }

    fn reset(&self, qid: QueueId) -> QueueStatus {
        let mut queues = self.queues.lock().unwrap();
        let Some(q) = queues.get_mut(&qid) else {
            return QueueStatus::new(ResponseCode::QueueNotAvailable);
        };
        if let Some(code) = q.gone {
            return QueueStatus::new(code);
        }
        let code = q.reset_script.pop_front().unwrap_or(ResponseCode::Normal);
        if code == ResponseCode::Normal {
            q.resets += 1;
            if !q.keep_on_reset {
                q.held.clear();
                q.ready.clear();
            }
            q.irq_enabled = false;
        }
        q.status(code)
    }

    fn enable_interrupt(&self, qid: QueueId, indicator: &InterruptIndicator) -> QueueStatus {
        *self.indicator.lock().unwrap() = Some(indicator.clone());
        let mut queues = self.queues.lock().unwrap();
        let Some(q) = queues.get_mut(&qid) else {
            return QueueStatus::new(ResponseCode::QueueNotAvailable);
        };
        if let Some(code) = q.gone {
            return QueueStatus::new(code);
        }
        q.irq_enabled = true;
        q.status(ResponseCode::Normal)
    }

    fn send(&self, qid: QueueId, psmid: u64, _payload: &[u8], _special: bool) -> QueueStatus {
        let mut queues = self.queues.lock().unwrap();
        let Some(q) = queues.get_mut(&qid) else {
            return QueueStatus::new(ResponseCode::QueueNotAvailable);
        };
        if let Some(code) = q.gone {
            return QueueStatus::new(code);
        }
        if let Some(code) = q.send_script.pop_front() {
            return q.status(code);
        }
        if q.outstanding() >= q.depth {
            q.overfull_sends += 1;
            return q.status(ResponseCode::QueueFull);
        }
        q.sent.push(psmid);
        if q.auto_reply {
            q.ready.push_back(psmid);
        } else {
            q.held.push_back(psmid);
        }
        q.max_held = q.max_held.max(q.outstanding());
        let status = q.status(ResponseCode::Normal);
        let irq = q.auto_reply && q.irq_enabled;
        drop(queues);
        if irq {
            self.raise();
        }
        status
    }

    fn receive(&self, qid: QueueId) -> (QueueStatus, Option<ApReply>) {
        let mut queues = self.queues.lock().unwrap();
        let Some(q) = queues.get_mut(&qid) else {
            return (QueueStatus::new(ResponseCode::QueueNotAvailable), None);
        };
        if let Some(code) = q.gone {
            return (QueueStatus::new(code), None);
        }
        match q.ready.pop_front() {
            Some(psmid) => {
                let reply = ApReply {
                    psmid,
                    payload: psmid.to_be_bytes().to_vec(),
                };
                (q.status(ResponseCode::Normal), Some(reply))
            }
            None => (q.status(ResponseCode::NoPendingReply), None),
        }
    }
}

/// Clock that only moves when told to, optionally by `step` per reading.
#[derive(Default)]
pub struct ManualClock {
    nanos: AtomicU64,
    step: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A clock moving forward by `step` every time it is read.
    pub fn ticking(step: Duration) -> Arc<Self> {
        let clock = Self::default();
        clock.step.store(step.as_nanos() as u64, Ordering::SeqCst);
        Arc::new(clock)
    }

    pub fn advance(&self, d: Duration) {
        self.nanos.fetch_add(d.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        let step = self.step.load(Ordering::SeqCst);
        Duration::from_nanos(self.nanos.fetch_add(step, Ordering::SeqCst))
    }
}

pub type Outcome = Result<Vec<u8>, ApReplyError>;

/// Records callback outcomes in completion order.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<(u64, Outcome)>>>);

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(&self, psmid: u64) -> ApMessage {
        let log = self.0.clone();
        ApMessage::new(psmid, vec![0u8; 16], move |res| {
            log.lock().unwrap().push((psmid, res.map(|r| r.payload)));
        })
    }

    pub fn outcomes(&self) -> Vec<(u64, Outcome)> {
        self.0.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.0.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub const POLL: Duration = Duration::from_millis(1);

/// Timer-driven test configuration: no interrupts, no thread, no rescans.
pub fn test_config() -> ApBusConfig {
    ApBusConfig::new()
        .with_poll_timeout(POLL)
        .with_request_timeout(Duration::from_millis(50))
        .with_config_time(None)
}

/// Advances the clock by one poll period and runs the timers.
pub fn tick(bus: &ApBus, clock: &ManualClock) -> bool {
    clock.advance(POLL);
    bus.check_timer(clock.now())
}

/// Creates the device for `qid` and ticks until its reset has finished.
pub fn bring_up(bus: &ApBus, clock: &ManualClock, qid: QueueId, depth: usize) -> Arc<ApDevice> {
    let dev = bus.device_create(qid, depth).unwrap();
    for _ in 0..8 {
        if dev.info().queue_count == 0 && dev.state() == apqueue::ApState::Idle {
            break;
        }
        tick(bus, clock);
    }
    dev
}
