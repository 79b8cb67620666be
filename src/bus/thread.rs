//! The dedicated poll thread.
//!
//! Only used when adapter interrupts are not: it runs passes back to back
//! while the hardware holds requests and sleeps otherwise.

use axerrno::{ax_err, AxResult};

use super::ApBus;

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use alloc::sync::{Arc, Weak};
        use core::sync::atomic::{AtomicBool, Ordering};
        use core::time::Duration;
        use std::sync::{Condvar, Mutex, PoisonError};
        use std::thread::{self, JoinHandle};

        use axerrno::AxError;

        /// Upper bound on one idle sleep, in case a wakeup is missed.
        const IDLE_WAIT: Duration = Duration::from_millis(10);

        struct PollWait {
            woken: Mutex<bool>,
            cond: Condvar,
            stop: AtomicBool,
        }

        impl PollWait {
            fn wake(&self) {
                let mut woken = self.woken.lock().unwrap_or_else(PoisonError::into_inner);
                *woken = true;
                self.cond.notify_one();
            }

            fn sleep(&self, timeout: Duration) {
                let woken = self.woken.lock().unwrap_or_else(PoisonError::into_inner);
                let (mut woken, _) = self
                    .cond
                    .wait_timeout_while(woken, timeout, |woken| {
                        !*woken && !self.stop.load(Ordering::Acquire)
                    })
                    .unwrap_or_else(PoisonError::into_inner);
                *woken = false;
            }
        }

        pub(crate) struct PollThread {
            handle: Option<JoinHandle<()>>,
            shared: Arc<PollWait>,
        }

        impl PollThread {
            fn spawn(bus: Weak<ApBus>) -> AxResult<Self> {
                let shared = Arc::new(PollWait {
                    woken: Mutex::new(false),
                    cond: Condvar::new(),
                    stop: AtomicBool::new(false),
                });
                let thread_shared = shared.clone();
                let handle = thread::Builder::new()
                    .name("appoll".into())
                    .spawn(move || poll_loop(bus, thread_shared))
                    .map_err(|_| AxError::NoMemory)?;
                Ok(Self {
                    handle: Some(handle),
                    shared,
                })
            }

            fn wake(&self) {
                self.shared.wake();
            }

            fn signal_stop(&self) {
                self.shared.stop.store(true, Ordering::Release);
                self.shared.wake();
            }

            /// Stops the thread and waits for it, unless called from it.
            fn stop(mut self) {
                self.signal_stop();
                if let Some(handle) = self.handle.take() {
                    if handle.thread().id() != thread::current().id() {
                        let _ = handle.join();
                    }
                }
            }
        }

        impl Drop for PollThread {
            fn drop(&mut self) {
                self.signal_stop();
            }
        }

        fn poll_loop(bus: Weak<ApBus>, shared: Arc<PollWait>) {
            debug!("poll thread started");
            while !shared.stop.load(Ordering::Acquire) {
                let idle = match bus.upgrade() {
                    None => break,
                    Some(bus) if bus.is_suspended() || bus.inflight() == 0 => true,
                    Some(bus) => {
                        bus.poll_all();
                        false
                    }
                };
                if idle {
                    shared.sleep(IDLE_WAIT);
                } else {
                    thread::yield_now();
                }
            }
            debug!("poll thread stopped");
        }

        impl ApBus {
            /// Starts the `appoll` thread.
            ///
            /// Starting an already running thread is a no-op.
            ///
            /// # Errors
            ///
            /// [`Unsupported`](axerrno::AxError::Unsupported) when adapter
            /// interrupts are in use.
            pub fn start_poll_thread(&self) -> AxResult {
                if self.config.use_interrupts {
                    return ax_err!(Unsupported, "adapter interrupts in use");
                }
                let mut slot = self.poll_thread.lock();
                if slot.is_none() {
                    *slot = Some(PollThread::spawn(self.this.clone())?);
                }
                Ok(())
            }

            /// Stops the `appoll` thread. Returns whether it was running.
            pub fn stop_poll_thread(&self) -> bool {
                let thread = self.poll_thread.lock().take();
                match thread {
                    Some(thread) => {
                        thread.stop();
                        true
                    }
                    None => false,
                }
            }

            pub fn poll_thread_running(&self) -> bool {
                self.poll_thread.lock().is_some()
            }

            /// Hands pending work to the poll thread, if it runs.
            pub(super) fn wake_poll_thread(&self) -> bool {
                match self.poll_thread.lock().as_ref() {
                    Some(thread) => {
                        thread.wake();
                        true
                    }
                    None => false,
                }
            }
        }
    } else {
        impl ApBus {
            /// Poll threads need the `std` feature; the host drives passes.
            pub fn start_poll_thread(&self) -> AxResult {
                ax_err!(Unsupported, "poll thread needs the std feature")
            }

            pub fn stop_poll_thread(&self) -> bool {
                false
            }

            pub fn poll_thread_running(&self) -> bool {
                false
            }

            pub(super) fn wake_poll_thread(&self) -> bool {
                false
            }
        }
    }
}
