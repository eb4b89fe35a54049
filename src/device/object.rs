//! A single accelerator device.

use crate::error::{Error, Result};
use crate::image::{DeviceImage, ImageId, OffloadEntry, TargetTable};
use crate::plugin::{AdaptorId, Backend};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Stable index of a registered program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub usize);

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Program({})", self.0)
    }
}

/// Global constructors and destructors a program still owes one device.
#[derive(Debug, Default, Clone)]
pub struct PendingCtorsDtors {
    /// Constructors not yet run, in registration order.
    pub ctors: Vec<OffloadEntry>,
    /// Destructors to run at unregistration, in registration order.
    pub dtors: Vec<OffloadEntry>,
}

/// Offload entry known to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOffloadEntry {
    /// Image the entry came from.
    pub image: ImageId,
    /// The entry.
    pub entry: OffloadEntry,
}

/// What unregistration did on one device for one program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructorOutcome {
    /// Constructors had run; this many destructors were issued and awaited.
    Ran(usize),
    /// Constructors never ran, so no destructor was run. The program's
    /// queued constructors were discarded with its record.
    Skipped,
    /// The device holds no record for the program.
    NotRecorded,
}

/// One physical or logical accelerator.
///
/// The owning plugin is referenced by id; the device shares the backend
/// handle but not the plugin itself.
pub struct Device {
    device_id: usize,
    rtl_device_id: u32,
    plugin: AdaptorId,
    plugin_name: Arc<str>,
    backend: Arc<dyn Backend>,
    initialized: bool,
    auto_zero_copy: bool,
    offload_entries: RwLock<HashMap<String, DeviceOffloadEntry>>,
    pending_globals: Mutex<HashMap<ProgramId, PendingCtorsDtors>>,
}

impl Device {
    /// Create an uninitialized device.
    pub fn new(
        plugin: AdaptorId,
        plugin_name: Arc<str>,
        backend: Arc<dyn Backend>,
        device_id: usize,
        rtl_device_id: u32,
    ) -> Self {
        Self {
            device_id,
            rtl_device_id,
            plugin,
            plugin_name,
            backend,
            initialized: false,
            auto_zero_copy: false,
            offload_entries: RwLock::new(HashMap::new()),
            pending_globals: Mutex::new(HashMap::new()),
        }
    }

    /// Initialize the device through its backend.
    pub fn init(&mut self) -> Result<()> {
        self.backend
            .init_device(self.rtl_device_id)
            .map_err(|source| Error::DeviceInit {
                plugin: self.plugin_name.to_string(),
                local_id: self.rtl_device_id,
                source,
            })?;
        self.initialized = true;
        self.auto_zero_copy = self.backend.use_auto_zero_copy(self.rtl_device_id);
        Ok(())
    }

    /// Global device number.
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Plugin-local device index.
    pub fn rtl_device_id(&self) -> u32 {
        self.rtl_device_id
    }

    /// Owning plugin.
    pub fn plugin(&self) -> AdaptorId {
        self.plugin
    }

    /// Name of the owning plugin.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Whether the device asked for automatic zero-copy.
    pub fn use_auto_zero_copy(&self) -> bool {
        self.auto_zero_copy
    }

    /// NUMA node the device is attached to, if the backend knows it.
    pub fn numa_node(&self) -> Option<usize> {
        self.backend.device_numa_node(self.rtl_device_id)
    }

    /// Load an image on this device.
    pub fn load_binary(&self, image: &DeviceImage) -> Result<TargetTable> {
        Ok(self.backend.load_binary(self.rtl_device_id, image)?)
    }

    /// Record an offload entry of `image`.
    pub fn add_offload_entry(&self, image: ImageId, entry: &OffloadEntry) {
        let mut entries = self
            .offload_entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            entry.name.clone(),
            DeviceOffloadEntry {
                image,
                entry: entry.clone(),
            },
        );
    }

    /// Look up an offload entry by symbol name.
    pub fn offload_entry(&self, name: &str) -> Option<DeviceOffloadEntry> {
        let entries = self
            .offload_entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        entries.get(name).cloned()
    }

    /// Number of known offload entries.
    pub fn num_offload_entries(&self) -> usize {
        self.offload_entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue the constructors and destructors found in `entries` for `program`.
    pub fn add_pending_globals(&self, program: ProgramId, entries: &[OffloadEntry]) {
        let mut pending = self.lock_pending();
        for entry in entries {
            if entry.is_ctor() {
                pending.entry(program).or_default().ctors.push(entry.clone());
            } else if entry.is_dtor() {
                pending.entry(program).or_default().dtors.push(entry.clone());
            }
        }
    }

    /// Snapshot of the pending globals of `program`.
    pub fn pending_globals(&self, program: ProgramId) -> Option<PendingCtorsDtors> {
        self.lock_pending().get(&program).cloned()
    }

    /// Whether any program still has constructors pending on this device.
    pub fn has_pending_ctors(&self) -> bool {
        self.lock_pending().values().any(|p| !p.ctors.is_empty())
    }

    /// Run every pending constructor on this device and wait for them.
    ///
    /// Queues are emptied only after synchronization succeeded, so a failing
    /// constructor keeps its program's destructors from running later.
    pub fn run_pending_ctors(&self) -> Result<usize> {
        let mut pending = self.lock_pending();
        let mut programs: Vec<_> = pending
            .iter()
            .filter(|(_, p)| !p.ctors.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if programs.is_empty() {
            return Ok(0);
        }
        programs.sort();

        let mut issued = 0;
        for program in &programs {
            for ctor in &pending[program].ctors {
                self.backend.launch_kernel(self.rtl_device_id, ctor)?;
                issued += 1;
            }
        }
        self.backend.synchronize(self.rtl_device_id)?;

        for program in &programs {
            if let Some(p) = pending.get_mut(program) {
                p.ctors.clear();
            }
        }
        tracing::debug!(device = self.device_id, constructors = issued, "ran pending constructors");
        Ok(issued)
    }

    /// Run the destructors of `program` if all its constructors have run,
    /// then drop the program's record.
    ///
    /// Destructors are issued in registration order and awaited before the
    /// per-device guard is released. A failing destructor is logged. If
    /// constructors are still pending, nothing is issued and the record is
    /// dropped all the same: an unregistered program never runs code here.
    pub fn run_pending_dtors(&self, program: ProgramId) -> DestructorOutcome {
        let mut pending = self.lock_pending();
        let Some(record) = pending.get(&program) else {
            return DestructorOutcome::NotRecorded;
        };
        if !record.ctors.is_empty() {
            tracing::debug!(
                device = self.device_id,
                %program,
                constructors = record.ctors.len(),
                "constructors never ran, skipping destructors"
            );
            pending.remove(&program);
            return DestructorOutcome::Skipped;
        }

        let mut issued = 0;
        for dtor in &record.dtors {
            if let Err(err) = self.backend.launch_kernel(self.rtl_device_id, dtor) {
                tracing::warn!(
                    device = self.device_id,
                    dtor = %dtor.name,
                    addr = format_args!("{:#x}", dtor.addr),
                    error = %err,
                    "running destructor failed"
                );
            }
            issued += 1;
        }
        pending.remove(&program);

        if let Err(err) = self.backend.synchronize(self.rtl_device_id) {
            tracing::warn!(device = self.device_id, error = %err, "failed synchronizing destructors");
        }
        DestructorOutcome::Ran(issued)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<ProgramId, PendingCtorsDtors>> {
        self.pending_globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        if let Err(err) = self.backend.deinit_device(self.rtl_device_id) {
            tracing::warn!(device = self.device_id, error = %err, "device deinitialization failed");
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.device_id)
            .field("rtl_device_id", &self.rtl_device_id)
            .field("plugin", &self.plugin_name)
            .field("auto_zero_copy", &self.auto_zero_copy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::{Call, FakeBackend};

    fn device(backend: &Arc<FakeBackend>) -> Device {
        let mut dev = Device::new(
            AdaptorId(0),
            Arc::from("fake"),
            Arc::clone(backend) as Arc<dyn Backend>,
            4,
            1,
        );
        dev.init().unwrap();
        dev
    }

    #[test]
    fn test_init_failure_is_device_error() {
        let mut backend = FakeBackend::new(2, 0xAA);
        backend.failing_devices.insert(1);
        let backend = Arc::new(backend);
        let mut dev = Device::new(
            AdaptorId(0),
            Arc::from("fake"),
            Arc::clone(&backend) as Arc<dyn Backend>,
            0,
            1,
        );
        let err = dev.init().unwrap_err();
        assert!(matches!(err, Error::DeviceInit { local_id: 1, .. }));

        // Never initialized, so never finalized.
        drop(dev);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_dtors_skipped_while_ctors_pending() {
        let backend = Arc::new(FakeBackend::new(2, 0xAA));
        let dev = device(&backend);
        let program = ProgramId(3);
        dev.add_pending_globals(
            program,
            &[OffloadEntry::ctor("init", 0x10), OffloadEntry::dtor("fini", 0x20)],
        );

        assert_eq!(dev.run_pending_dtors(program), DestructorOutcome::Skipped);
        assert!(dev.pending_globals(program).is_none());
        assert!(!dev.has_pending_ctors());

        // The discarded constructor is never issued.
        assert_eq!(dev.run_pending_ctors().unwrap(), 0);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_ctors_then_dtors_in_order() {
        let backend = Arc::new(FakeBackend::new(2, 0xAA));
        let dev = device(&backend);
        let program = ProgramId(0);
        dev.add_pending_globals(
            program,
            &[
                OffloadEntry::ctor("init", 0x10),
                OffloadEntry::dtor("fini_a", 0x20),
                OffloadEntry::function("kernel", 0x30),
                OffloadEntry::dtor("fini_b", 0x40),
            ],
        );

        assert!(dev.has_pending_ctors());
        assert_eq!(dev.run_pending_ctors().unwrap(), 1);
        assert!(!dev.has_pending_ctors());
        assert_eq!(dev.run_pending_ctors().unwrap(), 0);

        assert_eq!(dev.run_pending_dtors(program), DestructorOutcome::Ran(2));
        assert_eq!(dev.run_pending_dtors(program), DestructorOutcome::NotRecorded);

        assert_eq!(
            backend.calls(),
            vec![
                Call::Launch(1, "init".into()),
                Call::Sync(1),
                Call::Launch(1, "fini_a".into()),
                Call::Launch(1, "fini_b".into()),
                Call::Sync(1),
            ]
        );
    }

    #[test]
    fn test_offload_entries() {
        let backend = Arc::new(FakeBackend::new(1, 0xAA));
        let dev = device(&backend);
        dev.add_offload_entry(ImageId(9), &OffloadEntry::function("kernel", 0x30));
        assert_eq!(dev.num_offload_entries(), 1);
        assert_eq!(dev.offload_entry("kernel").map(|e| e.image), Some(ImageId(9)));
        assert!(dev.offload_entry("missing").is_none());
    }

    #[test]
    fn test_drop_deinitializes() {
        let backend = Arc::new(FakeBackend::new(2, 0xAA));
        drop(device(&backend));
        assert_eq!(backend.calls(), vec![Call::Deinit(1)]);
    }
}
