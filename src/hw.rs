//! Hardware queue proxy.
//!
//! Thin, stateless view of the four queue primitives (test, reset, send,
//! receive) plus interrupt enablement. Every primitive is non-blocking and
//! reports its outcome through a [`QueueStatus`]; interpreting those outcomes
//! is the job of the state machine, never of the callers above it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{ax_err, AxResult};

/// Number of cards addressable on the bus.
pub const AP_DEVICES: usize = 64;

/// Number of domains addressable on the bus.
pub const AP_DOMAINS: usize = 256;

/// Identifier of one hardware queue: a card/domain pair.
///
/// Layout: `[card(6 bits) << 8 | domain(8 bits)]`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub u16);

impl QueueId {
    /// Builds the queue id for `card` in `domain`.
    #[inline]
    pub const fn new(card: u8, domain: u8) -> Self {
        Self((((card as u16) & 0x3f) << 8) | domain as u16)
    }

    /// The card (adapter) number.
    #[inline]
    pub const fn card(&self) -> u8 {
        ((self.0 >> 8) & 0x3f) as u8
    }

    /// The domain (queue index on the card).
    #[inline]
    pub const fn domain(&self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}.{:04x}", self.card(), self.domain())
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Response codes reported by the hardware queue primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// The primitive completed.
    Normal,
    /// The queue does not exist.
    QueueNotAvailable,
    /// A reset of the queue is still running.
    ResetInProgress,
    /// The card has been deconfigured.
    Deconfigured,
    /// The card is checkstopped.
    Checkstopped,
    /// The queue is temporarily busy.
    Busy,
    /// An address handed to the hardware is invalid.
    InvalidAddress,
    /// The request was accepted but some other state changed meanwhile.
    OtherwiseChanged,
    /// No more requests can be enqueued.
    QueueFull,
    /// No reply is ready to be dequeued.
    NoPendingReply,
    /// The request exceeds the hardware size limit.
    MessageTooBig,
    /// The request uses a facility the card does not have.
    RequestedFacilityNotInstalled,
}

impl ResponseCode {
    /// The queue is gone for good; the device must be torn down.
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::QueueNotAvailable | Self::Deconfigured | Self::Checkstopped | Self::InvalidAddress
        )
    }

    /// The condition clears by itself; retry later.
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Busy | Self::ResetInProgress | Self::QueueFull | Self::OtherwiseChanged
        )
    }

    /// The request itself is malformed; only that request fails.
    #[inline]
    pub const fn is_request_error(self) -> bool {
        matches!(self, Self::MessageTooBig | Self::RequestedFacilityNotInstalled)
    }
}

/// Status word returned by every queue primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// Outcome of the primitive.
    pub response_code: ResponseCode,
    /// The hardware holds neither requests nor replies for this queue.
    pub queue_empty: bool,
    /// Adapter interrupts are armed for this queue.
    pub int_enabled: bool,
}

impl QueueStatus {
    /// A status with the given code and both indicator bits clear.
    pub const fn new(response_code: ResponseCode) -> Self {
        Self {
            response_code,
            queue_empty: false,
            int_enabled: false,
        }
    }

    /// Sets the queue-empty bit.
    pub const fn with_queue_empty(mut self, queue_empty: bool) -> Self {
        self.queue_empty = queue_empty;
        self
    }

    /// Sets the interrupts-enabled bit.
    pub const fn with_int_enabled(mut self, int_enabled: bool) -> Self {
        self.int_enabled = int_enabled;
        self
    }
}

/// Queue properties reported by [`ApQueueOps::test`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    /// Maximum number of requests the hardware accepts at once.
    pub queue_depth: usize,
    /// Hardware type of the card.
    pub device_type: u8,
    /// Facility bits of the card.
    pub facilities: u32,
}

/// A reply dequeued from the hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApReply {
    /// Correlation id of the request this reply answers.
    pub psmid: u64,
    /// Reply payload.
    pub payload: Vec<u8>,
}

/// Summary indicator set by the hardware when it raises the adapter
/// interrupt.
///
/// The coordinator clears it at the start of each pass so that completions
/// signalled while the pass runs raise a fresh interrupt.
#[derive(Debug, Clone, Default)]
pub struct InterruptIndicator(Arc<AtomicBool>);

impl InterruptIndicator {
    /// Creates a cleared indicator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the indicator (hardware side).
    #[inline]
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Reads and clears the indicator.
    #[inline]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Reads the indicator without clearing it.
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The hardware queue primitives.
///
/// Implementations must not block: every call returns the current status
/// immediately, whether or not the underlying operation has finished.
pub trait ApQueueOps: Send + Sync {
    /// Tests the queue and reports its properties.
    fn test(&self, qid: QueueId) -> (QueueStatus, QueueInfo);

    /// Starts a reset of the queue.
    fn reset(&self, qid: QueueId) -> QueueStatus;

    /// Asks the hardware to raise `indicator` when replies become available.
    fn enable_interrupt(&self, qid: QueueId, indicator: &InterruptIndicator) -> QueueStatus;

    /// Enqueues one request. `special` selects the alternate protocol variant.
    fn send(&self, qid: QueueId, psmid: u64, payload: &[u8], special: bool) -> QueueStatus;

    /// Dequeues one reply, if any is ready.
    ///
    /// A `Normal` status always comes with a reply.
    fn receive(&self, qid: QueueId) -> (QueueStatus, Option<ApReply>);
}

/// Checks whether a queue is present and usable.
///
/// # Errors
///
/// - [`NotFound`](axerrno::AxError::NotFound) if the queue is gone.
/// - [`ResourceBusy`](axerrno::AxError::ResourceBusy) if it is transiently
///   unavailable.
pub fn query_queue(ops: &dyn ApQueueOps, qid: QueueId) -> AxResult<QueueInfo> {
    let (status, info) = ops.test(qid);
    trace!("test {}: {:?} {:?}", qid, status.response_code, info);
    match status.response_code {
        ResponseCode::Normal => Ok(info),
        code if code.is_fatal() => ax_err!(NotFound, "queue not available"),
        _ => ax_err!(ResourceBusy, "queue busy"),
    }
}
