//! Capability contract every offload backend implements.

use crate::error::BackendError;
use crate::image::{DeviceImage, OffloadEntry, TargetTable};
use std::sync::Arc;

/// Result of a backend call.
pub type BackendResult<T = ()> = std::result::Result<T, BackendError>;

/// An accelerator backend.
///
/// Device indices passed to a backend are plugin-local (`0..number_of_devices()`).
/// The required methods are the mandatory part of the contract; the provided
/// methods are optional capabilities with a neutral default.
pub trait Backend: Send + Sync {
    /// Number of physical devices this backend controls.
    fn number_of_devices(&self) -> u32;

    /// Whether the backend understands the binary format of `image`.
    ///
    /// Must not mutate backend state.
    fn is_valid_binary(&self, image: &DeviceImage) -> bool;

    /// Initialize one device.
    fn init_device(&self, device: u32) -> BackendResult;

    /// Finalize one device.
    fn deinit_device(&self, device: u32) -> BackendResult;

    /// Load `image` on a device and return its target table.
    fn load_binary(&self, device: u32, image: &DeviceImage) -> BackendResult<TargetTable>;

    /// Issue the kernel behind `entry` on a device.
    fn launch_kernel(&self, device: u32, entry: &OffloadEntry) -> BackendResult;

    /// Wait for every operation issued on a device.
    fn synchronize(&self, device: u32) -> BackendResult;

    /// Plugin-level initialization, called once before any other query.
    fn init_plugin(&self) -> BackendResult {
        Ok(())
    }

    /// Plugin-level teardown, called once at process teardown.
    fn deinit_plugin(&self) -> BackendResult {
        Ok(())
    }

    /// Tell the backend where its devices start in the global numbering.
    fn set_device_offset(&self, _offset: usize) {}

    /// Whether a device suggests automatic zero-copy mapping.
    fn use_auto_zero_copy(&self, _device: u32) -> bool {
        false
    }

    /// NUMA node the device is attached to, if known.
    fn device_numa_node(&self, _device: u32) -> Option<usize> {
        None
    }
}

/// Entry of a static backend list, for backends linked into the process.
///
/// ```rust,ignore
/// static BACKENDS: &[BackendRegistration] = &[
///     BackendRegistration { name: "host", create: || Arc::new(HostBackend::new()) },
/// ];
/// manager.add_backends(BACKENDS);
/// ```
#[derive(Clone, Copy)]
pub struct BackendRegistration {
    /// Plugin name.
    pub name: &'static str,
    /// Constructor, called once at discovery.
    pub create: fn() -> Arc<dyn Backend>,
}

impl std::fmt::Debug for BackendRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistration")
            .field("name", &self.name)
            .finish()
    }
}
