use core::time::Duration;

use axerrno::{ax_err, AxResult};

/// Poll period used on bare hardware (4 kHz).
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_micros(250);

/// Poll period used when running under a hypervisor.
pub const HYPERVISOR_POLL_TIMEOUT: Duration = Duration::from_micros(1500);

/// Longest accepted poll period.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(120);

/// What happens to requests already accepted by the hardware when a stalled
/// queue is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StallPolicy {
    /// Fail every pending request with a retryable error and forget it.
    #[default]
    FlushPending,
    /// Keep pending requests across the reset and keep waiting for their
    /// replies.
    KeepPending,
}

/// Bus-wide scheduler configuration.
#[derive(Debug, Clone)]
pub struct ApBusConfig {
    /// Period of the shared poll timer.
    pub poll_timeout: Duration,
    /// Time a device may hold outstanding requests without a reply before it
    /// is reset.
    pub request_timeout: Duration,
    /// Whether adapter interrupts are available and registered.
    pub use_interrupts: bool,
    /// Start the dedicated poll thread at bring-up.
    pub poll_thread: bool,
    /// Handling of pending requests on a stall reset.
    pub stall_policy: StallPolicy,
    /// Period of the rediscovery scan; `None` disables it.
    pub config_time: Option<Duration>,
}

impl ApBusConfig {
    /// The default configuration for bare hardware.
    pub fn new() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            request_timeout: Duration::from_secs(30),
            use_interrupts: false,
            poll_thread: false,
            stall_policy: StallPolicy::FlushPending,
            config_time: Some(Duration::from_secs(30)),
        }
    }

    /// The default configuration with the slower hypervisor poll rate.
    pub fn hypervisor() -> Self {
        Self {
            poll_timeout: HYPERVISOR_POLL_TIMEOUT,
            ..Self::new()
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_interrupts(mut self, use_interrupts: bool) -> Self {
        self.use_interrupts = use_interrupts;
        self
    }

    pub fn with_poll_thread(mut self, poll_thread: bool) -> Self {
        self.poll_thread = poll_thread;
        self
    }

    pub fn with_stall_policy(mut self, stall_policy: StallPolicy) -> Self {
        self.stall_policy = stall_policy;
        self
    }

    pub fn with_config_time(mut self, config_time: Option<Duration>) -> Self {
        self.config_time = config_time;
        self
    }

    /// Checks the configuration for consistency.
    ///
    /// # Errors
    ///
    /// [`InvalidInput`](axerrno::AxError::InvalidInput) if the poll period is
    /// out of range or longer than the request timeout.
    pub fn validate(&self) -> AxResult {
        validate_poll_timeout(self.poll_timeout)?;
        if self.request_timeout < self.poll_timeout {
            return ax_err!(InvalidInput, "request timeout shorter than poll period");
        }
        Ok(())
    }
}

impl Default for ApBusConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn validate_poll_timeout(poll_timeout: Duration) -> AxResult {
    if poll_timeout.is_zero() || poll_timeout > MAX_POLL_TIMEOUT {
        return ax_err!(InvalidInput, "poll timeout out of range");
    }
    Ok(())
}
