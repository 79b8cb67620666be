//! Request messages and their completion outcomes.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use axerrno::AxError;

use crate::hw::ApReply;

/// Why a message completed without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApReplyError {
    /// The device went away or was reset underneath the request; submitting
    /// it again may succeed.
    Retry,
    /// The hardware refused this particular request.
    Rejected,
}

impl ApReplyError {
    /// Whether resubmitting the same message may succeed.
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retry)
    }
}

impl From<ApReplyError> for AxError {
    fn from(err: ApReplyError) -> Self {
        match err {
            ApReplyError::Retry => AxError::WouldBlock,
            ApReplyError::Rejected => AxError::InvalidInput,
        }
    }
}

/// Outcome handed to a message's completion callback.
pub type ApResult = Result<ApReply, ApReplyError>;

type ReceiveFn = Box<dyn FnOnce(ApResult) + Send>;

/// One request awaiting exactly one hardware reply.
///
/// The message is owned by whichever device queue it currently sits in.
/// Its completion callback is consumed when the message completes, so it runs
/// at most once; the scheduler guarantees it runs exactly once for every
/// accepted message that is not cancelled.
pub struct ApMessage {
    psmid: u64,
    payload: Vec<u8>,
    special: bool,
    receive: ReceiveFn,
}

impl ApMessage {
    /// Creates a message with correlation id `psmid`.
    ///
    /// `receive` is invoked with the outcome once the message completes.
    pub fn new<F>(psmid: u64, payload: Vec<u8>, receive: F) -> Self
    where
        F: FnOnce(ApResult) + Send + 'static,
    {
        Self {
            psmid,
            payload,
            special: false,
            receive: Box::new(receive),
        }
    }

    /// Marks the message for the alternate protocol variant.
    pub fn with_special(mut self, special: bool) -> Self {
        self.special = special;
        self
    }

    /// The correlation id.
    #[inline]
    pub fn psmid(&self) -> u64 {
        self.psmid
    }

    /// The request payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the alternate protocol variant is used.
    #[inline]
    pub fn is_special(&self) -> bool {
        self.special
    }

    /// Consumes the message and runs its completion callback.
    pub(crate) fn complete(self, result: ApResult) {
        (self.receive)(result)
    }
}

impl fmt::Debug for ApMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApMessage")
            .field("psmid", &self.psmid)
            .field("length", &self.payload.len())
            .field("special", &self.special)
            .finish()
    }
}

/// Messages whose outcome is known, waiting for the device lock to be
/// released before their callbacks run.
#[derive(Default)]
pub(crate) struct Completions(Vec<(ApMessage, ApResult)>);

impl Completions {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }

    #[inline]
    pub(crate) fn push(&mut self, msg: ApMessage, result: ApResult) {
        self.0.push((msg, result));
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    /// Runs every collected callback, in completion order.
    pub(crate) fn run(self) {
        for (msg, result) in self.0 {
            msg.complete(result);
        }
    }
}
