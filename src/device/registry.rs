//! Flat registry of every device across all plugins.

use super::Device;
use crate::error::{Error, Result};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Registry of devices indexed by global device number.
///
/// The sequence is append-only: once a device occupies slot `i`, slot `i`
/// never changes identity. Every access goes through one exclusive guard,
/// held only for the duration of the access.
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<Device>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Device>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Look up a device by global number.
    ///
    /// The returned handle stays valid whatever is appended afterwards.
    pub fn get(&self, device_no: usize) -> Result<Arc<Device>> {
        let devices = self.lock();
        devices
            .get(device_no)
            .cloned()
            .ok_or(Error::OutOfRange {
                requested: device_no,
                available: devices.len(),
            })
    }

    /// Handles to every registered device, in global order.
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.lock().clone()
    }

    /// Append initialized devices, returning the slots they occupy.
    ///
    /// Callers serialize appends among themselves (plugin activation runs
    /// under the registration guard), so the first device's number equals
    /// the registry size observed when its plugin reserved its offset.
    pub(crate) fn append(&self, new_devices: Vec<Device>) -> Range<usize> {
        let mut devices = self.lock();
        let start = devices.len();
        debug_assert!(
            new_devices
                .iter()
                .enumerate()
                .all(|(i, d)| d.device_id() == start + i),
            "device numbers must continue the registry"
        );
        devices.extend(new_devices.into_iter().map(Arc::new));
        start..devices.len()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .finish()
    }
}
