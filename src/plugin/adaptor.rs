//! Runtime-side owner of one loaded backend.

use super::backend::Backend;
use crate::device::{Device, DeviceRegistry, ProgramId};
use crate::error::{Error, Result};
use crate::image::{DeviceImage, ImageId};
use crate::observability::{
    record_device_init_failure, record_devices_initialized, span_plugin,
};
use crate::requirements::{RequirementFlags, Requirements};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Position of a plugin in discovery order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdaptorId(pub usize);

impl fmt::Display for AdaptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plugin({})", self.0)
    }
}

/// A loaded backend together with its slice of the global device numbering.
///
/// An adaptor starts *unused*. Its first activation reserves the global
/// device numbers `[offset, offset + n)` for good; later activations are
/// no-ops.
pub struct PluginAdaptor {
    id: AdaptorId,
    name: Arc<str>,
    backend: Arc<dyn Backend>,
    number_of_plugin_devices: u32,
    device_offset: Option<usize>,
    number_of_user_devices: usize,
    used_images: HashSet<ImageId>,
}

impl PluginAdaptor {
    /// Validate a backend and wrap it.
    ///
    /// Fails if the plugin-level init hook reports an error or if the backend
    /// controls no device. No device is constructed yet.
    pub fn create(id: AdaptorId, name: &str, backend: Arc<dyn Backend>) -> Result<Self> {
        let _span = span_plugin(name).entered();

        backend.init_plugin().map_err(|err| Error::Initialization {
            name: name.to_string(),
            reason: format!("unable to initialize library: {err}"),
        })?;

        let number_of_plugin_devices = backend.number_of_devices();
        if number_of_plugin_devices == 0 {
            return Err(Error::Initialization {
                name: name.to_string(),
                reason: "no devices supported".to_string(),
            });
        }

        tracing::info!(
            plugin = name,
            devices = number_of_plugin_devices,
            "registered plugin"
        );

        Ok(Self {
            id,
            name: Arc::from(name),
            backend,
            number_of_plugin_devices,
            device_offset: None,
            number_of_user_devices: 0,
            used_images: HashSet::new(),
        })
    }

    /// Discovery position.
    pub fn id(&self) -> AdaptorId {
        self.id
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Devices the backend reports.
    pub fn number_of_plugin_devices(&self) -> u32 {
        self.number_of_plugin_devices
    }

    /// Devices that initialized successfully.
    pub fn number_of_user_devices(&self) -> usize {
        self.number_of_user_devices
    }

    /// Whether the adaptor has been activated.
    pub fn is_used(&self) -> bool {
        self.device_offset.is_some()
    }

    /// First global device number, once activated.
    pub fn device_offset(&self) -> Option<usize> {
        self.device_offset
    }

    /// Global device numbers owned by this adaptor.
    pub fn device_range(&self) -> Range<usize> {
        match self.device_offset {
            Some(offset) => offset..offset + self.number_of_user_devices,
            None => 0..0,
        }
    }

    /// Whether the backend understands `image`.
    pub fn is_valid_binary(&self, image: &DeviceImage) -> bool {
        self.backend.is_valid_binary(image)
    }

    /// Activate the adaptor: create and initialize its devices.
    ///
    /// Devices failing initialization are skipped. If every initialized
    /// device suggests automatic zero-copy, the process-wide requirement is
    /// raised. Must be called under the registration guard, which serializes
    /// every append to `registry`.
    pub fn init_devices(&mut self, registry: &DeviceRegistry, requirements: &Requirements) {
        if self.is_used() {
            return;
        }
        let _span = span_plugin(&self.name).entered();

        let offset = registry.len();
        self.backend.set_device_offset(offset);

        let mut devices = Vec::with_capacity(self.number_of_plugin_devices as usize);
        let mut auto_zero_copy = true;
        for local_id in 0..self.number_of_plugin_devices {
            let mut device = Device::new(
                self.id,
                Arc::clone(&self.name),
                Arc::clone(&self.backend),
                offset + devices.len(),
                local_id,
            );
            if let Err(err) = device.init() {
                tracing::warn!(plugin = %self.name, local_id, error = %err, "skipping device");
                record_device_init_failure(&self.name);
                continue;
            }
            auto_zero_copy &= device.use_auto_zero_copy();
            devices.push(device);
        }

        let count = devices.len();
        let range = registry.append(devices);
        debug_assert_eq!(range.start, offset);
        self.device_offset = Some(range.start);
        self.number_of_user_devices = count;

        if auto_zero_copy && count > 0 {
            requirements.add(RequirementFlags::AUTO_ZERO_COPY);
        }

        tracing::info!(
            plugin = %self.name,
            offset = range.start,
            exposed = count,
            total = self.number_of_plugin_devices,
            "plugin activated"
        );
        record_devices_initialized(&self.name, count, range.end);
    }

    /// Register the entries of `image` with every device of this adaptor and
    /// queue its global constructors and destructors for `program`.
    pub fn add_offload_entries(
        &self,
        registry: &DeviceRegistry,
        program: ProgramId,
        image: &DeviceImage,
    ) -> Result<()> {
        for device_no in self.device_range() {
            let device = registry.get(device_no)?;
            for entry in image.entries() {
                device.add_offload_entry(image.id(), entry);
            }
            device.add_pending_globals(program, image.entries());
        }
        Ok(())
    }

    /// Remember that this adaptor accepted `image`.
    pub(crate) fn mark_image_used(&mut self, image: ImageId) {
        self.used_images.insert(image);
    }

    /// Whether this adaptor accepted `image`.
    pub fn uses_image(&self, image: ImageId) -> bool {
        self.used_images.contains(&image)
    }

    /// Forget an accepted image.
    pub(crate) fn release_image(&mut self, image: ImageId) -> bool {
        self.used_images.remove(&image)
    }
}

impl Drop for PluginAdaptor {
    fn drop(&mut self) {
        if let Err(err) = self.backend.deinit_plugin() {
            tracing::warn!(plugin = %self.name, error = %err, "plugin deinitialization failed");
        }
    }
}

impl fmt::Debug for PluginAdaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginAdaptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("plugin_devices", &self.number_of_plugin_devices)
            .field("device_offset", &self.device_offset)
            .field("user_devices", &self.number_of_user_devices)
            .field("used_images", &self.used_images.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageDescriptor, OffloadEntry};
    use crate::plugin::test_support::FakeBackend;

    fn adaptor(backend: FakeBackend) -> Result<PluginAdaptor> {
        PluginAdaptor::create(AdaptorId(0), "fake", Arc::new(backend))
    }

    #[test]
    fn test_zero_devices_rejected() {
        let err = adaptor(FakeBackend::new(0, 0xAA)).unwrap_err();
        assert!(matches!(err, Error::Initialization { .. }));
    }

    #[test]
    fn test_init_plugin_failure_rejected() {
        let mut backend = FakeBackend::new(2, 0xAA);
        backend.init_rc = 3;
        let err = adaptor(backend).unwrap_err();
        assert!(matches!(err, Error::Initialization { .. }));
    }

    #[test]
    fn test_init_devices_idempotent() {
        let registry = DeviceRegistry::new();
        let requirements = Requirements::new();
        let mut adaptor = adaptor(FakeBackend::new(3, 0xAA)).unwrap();
        assert!(!adaptor.is_used());
        assert!(adaptor.device_range().is_empty());

        adaptor.init_devices(&registry, &requirements);
        assert_eq!(registry.len(), 3);
        assert_eq!(adaptor.device_range(), 0..3);

        adaptor.init_devices(&registry, &requirements);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_failing_device_is_skipped() {
        let registry = DeviceRegistry::new();
        let requirements = Requirements::new();
        let mut backend = FakeBackend::new(3, 0xAA);
        backend.failing_devices.insert(1);
        let mut adaptor = adaptor(backend).unwrap();

        adaptor.init_devices(&registry, &requirements);
        assert_eq!(adaptor.number_of_user_devices(), 2);
        assert_eq!(registry.get(1).unwrap().rtl_device_id(), 2);
    }

    #[test]
    fn test_offset_follows_registry_size() {
        let registry = DeviceRegistry::new();
        let requirements = Requirements::new();
        let mut first = adaptor(FakeBackend::new(2, 0xAA)).unwrap();
        let backend = Arc::new(FakeBackend::new(1, 0xBB));
        let mut second =
            PluginAdaptor::create(AdaptorId(1), "second", Arc::clone(&backend) as _).unwrap();

        first.init_devices(&registry, &requirements);
        second.init_devices(&registry, &requirements);
        assert_eq!(second.device_offset(), Some(2));
        assert_eq!(*backend.offset.lock().unwrap(), Some(2));
    }

    #[test]
    fn test_auto_zero_copy_requires_every_device() {
        let registry = DeviceRegistry::new();
        let requirements = Requirements::new();
        let mut backend = FakeBackend::new(2, 0xAA);
        backend.zero_copy_devices.extend([0, 1]);
        let mut adaptor = adaptor(backend).unwrap();
        adaptor.init_devices(&registry, &requirements);
        assert!(requirements.contains(RequirementFlags::AUTO_ZERO_COPY));

        // All devices failing leaves the flag alone.
        let requirements = Requirements::new();
        let mut backend = FakeBackend::new(1, 0xAA);
        backend.zero_copy_devices.insert(0);
        backend.failing_devices.insert(0);
        let mut adaptor = PluginAdaptor::create(AdaptorId(1), "dead", Arc::new(backend)).unwrap();
        adaptor.init_devices(&registry, &requirements);
        assert!(!requirements.contains(RequirementFlags::AUTO_ZERO_COPY));
    }

    #[test]
    fn test_auto_zero_copy_one_device_declines() {
        let registry = DeviceRegistry::new();
        let requirements = Requirements::new();
        let mut backend = FakeBackend::new(3, 0xAA);
        backend.zero_copy_devices.extend([0, 2]);
        let mut adaptor = adaptor(backend).unwrap();
        adaptor.init_devices(&registry, &requirements);

        assert_eq!(adaptor.number_of_user_devices(), 3);
        assert!(registry.get(0).unwrap().use_auto_zero_copy());
        assert!(!registry.get(1).unwrap().use_auto_zero_copy());
        assert!(!requirements.contains(RequirementFlags::AUTO_ZERO_COPY));
    }

    #[test]
    fn test_auto_zero_copy_ignores_failed_devices() {
        let registry = DeviceRegistry::new();
        let requirements = Requirements::new();
        let mut backend = FakeBackend::new(2, 0xAA);
        backend.zero_copy_devices.insert(0);
        backend.failing_devices.insert(1);
        let mut adaptor = adaptor(backend).unwrap();
        adaptor.init_devices(&registry, &requirements);

        assert_eq!(adaptor.number_of_user_devices(), 1);
        assert!(requirements.contains(RequirementFlags::AUTO_ZERO_COPY));
    }

    #[test]
    fn test_add_offload_entries() {
        let registry = DeviceRegistry::new();
        let mut adaptor = adaptor(FakeBackend::new(2, 0xAA)).unwrap();
        adaptor.init_devices(&registry, &Requirements::new());

        let image = DeviceImage::extract(&ImageDescriptor::new(
            vec![0xAA],
            vec![OffloadEntry::function("kernel", 0x10), OffloadEntry::dtor("fini", 0x20)],
        ));
        adaptor
            .add_offload_entries(&registry, ProgramId(0), &image)
            .unwrap();

        for device in registry.snapshot() {
            assert!(device.offload_entry("kernel").is_some());
            let pending = device.pending_globals(ProgramId(0)).unwrap();
            assert_eq!(pending.dtors.len(), 1);
            assert!(pending.ctors.is_empty());
        }
    }
}
