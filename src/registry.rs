//! Registry of the devices currently bound to the bus.
//!
//! Devices are keyed by queue id. Lookups take the read lock only, so
//! submitters never serialize behind each other; each device carries its own
//! lock for its queue state.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use axerrno::{ax_err, AxResult};
use spin::RwLock;

use crate::device::ApDevice;
use crate::hw::{QueueId, AP_DEVICES};

/// Maximum number of devices the bus drives at once.
///
/// One queue per card: a bus serves a single usage domain, so queues of
/// other domains are not expected to share the table.
pub const MAX_DEVICES: usize = AP_DEVICES;

/// Device snapshot taken at the start of a pass.
pub type DeviceSnapshot = ArrayVec<Arc<ApDevice>, MAX_DEVICES>;

/// Device registry with lookup by queue id.
///
/// # Concurrency
///
/// The registry uses a read-write lock around the map. Passes work on a
/// [`snapshot`](Self::snapshot) so that devices can be added or removed while
/// a pass is running; a removed device is simply visited one last time.
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<QueueId, Arc<ApDevice>>>,
}

impl DeviceRegistry {
    /// Creates a new empty device registry.
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Adds a device to the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A device for the same queue is already registered
    /// - The registry already holds [`MAX_DEVICES`] devices
    pub fn add_device(&self, device: Arc<ApDevice>) -> AxResult {
        let mut devices = self.devices.write();
        if devices.contains_key(&device.qid()) {
            return ax_err!(AlreadyExists, "device already registered");
        }
        if devices.len() >= MAX_DEVICES {
            return ax_err!(NoMemory, "device table full");
        }
        devices.insert(device.qid(), device);
        Ok(())
    }

    /// Removes `device` from the registry.
    ///
    /// A different device registered under the same queue id is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound`](axerrno::AxError::NotFound) if `device` is not
    /// registered.
    pub fn remove_device(&self, device: &Arc<ApDevice>) -> AxResult {
        let mut devices = self.devices.write();
        match devices.get(&device.qid()) {
            Some(found) if Arc::ptr_eq(found, device) => {
                devices.remove(&device.qid());
                Ok(())
            }
            _ => ax_err!(NotFound, "device not registered"),
        }
    }

    /// Gets a device by its queue id.
    pub fn get_device(&self, qid: QueueId) -> Option<Arc<ApDevice>> {
        self.devices.read().get(&qid).cloned()
    }

    /// Lists all registered queue ids.
    pub fn list_devices(&self) -> Vec<QueueId> {
        self.devices.read().keys().copied().collect()
    }

    /// References to every registered device, in queue id order.
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.devices.read().values().cloned().collect()
    }

    /// Unregisters every device and hands them back.
    pub fn drain_all(&self) -> Vec<Arc<ApDevice>> {
        let mut devices = self.devices.write();
        core::mem::take(&mut *devices).into_values().collect()
    }

    /// Gets the number of registered devices.
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
