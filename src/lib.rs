#![cfg_attr(not(feature = "std"), no_std)]

//! # AP queue request scheduler
//!
//! This crate multiplexes software requests onto Adjunct Processor style
//! hardware command queues: small, slow queues that accept a bounded number
//! of outstanding requests, complete them asynchronously, may or may not
//! raise interrupts, and go through transient busy and reset conditions.
//!
//! ## Architecture
//!
//! - [`ApQueueOps`]: the hardware primitives (test, reset, send, receive,
//!   interrupt enablement), supplied by the platform.
//! - [`ApDevice`]: one hardware queue, driven by a per-device state machine
//!   ([`ApState`]) under its own lock.
//! - [`ApBus`]: the coordinator deciding when each device runs (submission,
//!   hardware interrupt, shared poll timer, optional poll thread), plus the
//!   queue manager API ([`ApBus::submit`], [`ApBus::cancel`],
//!   [`ApBus::flush_all`]) and power management.
//!
//! Every accepted [`ApMessage`] sees its completion callback exactly once:
//! with the reply, with [`ApReplyError::Rejected`] if the hardware refused
//! it, or with [`ApReplyError::Retry`] if its device went away. Only
//! [`ApBus::cancel`] suppresses the callback.
//!
//! ## Features
//!
//! - `std` (default): the `appoll` poll thread and [`StdClock`]. Without it
//!   the host supplies a [`Clock`] and calls [`ApBus::check_timer`] from its
//!   timer tick.
//!
//! ## Example
//!
//! ```rust,ignore
//! use apqueue::{ApBus, ApBusConfig, ApMessage, QueueId, StdClock};
//!
//! let bus = ApBus::new(hardware, Arc::new(StdClock::new()), ApBusConfig::new())?;
//! apqueue::init(bus.clone())?;
//!
//! let dev = bus.device_create(QueueId::new(3, 0x0d), 32)?;
//! bus.submit(&dev, ApMessage::new(1, request, |reply| {
//!     // ...
//! }))?;
//!
//! // Wired to the platform:
//! //   adapter interrupt  -> apqueue::on_hardware_interrupt()
//! //   timer tick         -> bus.check_timer(now)
//! //   PM hooks           -> apqueue::suspend_all() / apqueue::resume_all()
//! ```

extern crate alloc;
#[macro_use]
extern crate log;

mod bus;
mod config;
mod device;
mod hw;
mod message;
mod registry;
mod sm;

use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};

pub use bus::{ApBus, Clock};
pub use config::{
    ApBusConfig, StallPolicy, DEFAULT_POLL_TIMEOUT, HYPERVISOR_POLL_TIMEOUT, MAX_POLL_TIMEOUT,
};
pub use device::{ApDevice, DeviceInfo, DeviceStats};
pub use hw::{
    query_queue, ApQueueOps, ApReply, InterruptIndicator, QueueId, QueueInfo, QueueStatus,
    ResponseCode, AP_DEVICES, AP_DOMAINS,
};
pub use message::{ApMessage, ApReplyError, ApResult};
pub use registry::{DeviceRegistry, MAX_DEVICES};
pub use sm::{ApEvent, ApState, ApWait, InterruptMode};

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        pub use bus::StdClock;
    }
}

/// The process-wide bus.
static AP_BUS: spin::Once<Arc<ApBus>> = spin::Once::new();

/// Installs the process-wide bus.
///
/// # Errors
///
/// [`AlreadyExists`](axerrno::AxError::AlreadyExists) if a bus is already
/// installed.
pub fn init(bus: Arc<ApBus>) -> AxResult {
    let mut installed = false;
    AP_BUS.call_once(|| {
        installed = true;
        bus
    });
    if installed {
        Ok(())
    } else {
        ax_err!(AlreadyExists, "ap bus already initialized")
    }
}

/// The process-wide bus, once [`init`] has run.
pub fn ap_bus() -> Option<&'static Arc<ApBus>> {
    AP_BUS.get()
}

/// Adapter interrupt hook.
pub fn on_hardware_interrupt() {
    if let Some(bus) = AP_BUS.get() {
        bus.on_hardware_interrupt();
    }
}

/// Power management hook: quiesce every device.
pub fn suspend_all() {
    if let Some(bus) = AP_BUS.get() {
        bus.suspend_all();
    }
}

/// Power management hook: rebuild the devices after a power transition.
pub fn resume_all() -> Vec<Arc<ApDevice>> {
    match AP_BUS.get() {
        Some(bus) => bus.resume_all(),
        None => Vec::new(),
    }
}
