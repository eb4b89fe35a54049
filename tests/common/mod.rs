//! Shared helpers for integration tests.

#![allow(dead_code)]

use offload::error::BackendError;
use offload::image::{DeviceImage, TargetEntry, TargetTable};
use offload::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Backend call observed by [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Init(u32),
    Deinit(u32),
    Launch(u32, String),
    Sync(u32),
    Load(u32),
    DeinitPlugin,
}

/// In-process backend recognizing binaries that start with `magic`.
pub struct MockBackend {
    pub devices: u32,
    pub magic: u8,
    pub failing: HashSet<u32>,
    pub zero_copy: HashSet<u32>,
    pub numa_nodes: Vec<Option<usize>>,
    pub events: Mutex<Vec<Event>>,
}

impl MockBackend {
    pub fn new(devices: u32, magic: u8) -> Self {
        Self {
            devices,
            magic,
            failing: HashSet::new(),
            zero_copy: HashSet::new(),
            numa_nodes: Vec::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, device: u32) -> Self {
        self.failing.insert(device);
        self
    }

    /// Every device asks for automatic zero-copy.
    pub fn zero_copy(mut self) -> Self {
        self.zero_copy = (0..self.devices).collect();
        self
    }

    /// Only `devices` ask for automatic zero-copy.
    pub fn zero_copy_on(mut self, devices: &[u32]) -> Self {
        self.zero_copy = devices.iter().copied().collect();
        self
    }

    pub fn on_nodes(mut self, nodes: &[Option<usize>]) -> Self {
        self.numa_nodes = nodes.to_vec();
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Names of the kernels launched on `device`, in issue order.
    pub fn launched(&self, device: u32) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Launch(d, name) if d == device => Some(name),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Backend for MockBackend {
    fn number_of_devices(&self) -> u32 {
        self.devices
    }

    fn is_valid_binary(&self, image: &DeviceImage) -> bool {
        image.binary().first() == Some(&self.magic)
    }

    fn init_device(&self, device: u32) -> BackendResult {
        self.push(Event::Init(device));
        if self.failing.contains(&device) {
            return Err(BackendError::FAIL);
        }
        Ok(())
    }

    fn deinit_device(&self, device: u32) -> BackendResult {
        self.push(Event::Deinit(device));
        Ok(())
    }

    fn load_binary(&self, device: u32, image: &DeviceImage) -> BackendResult<TargetTable> {
        self.push(Event::Load(device));
        Ok(TargetTable {
            entries: image
                .entries()
                .iter()
                .map(|e| TargetEntry {
                    name: e.name.clone(),
                    device_addr: (u64::from(device) << 32) | e.addr as u64,
                    size: e.size,
                })
                .collect(),
        })
    }

    fn launch_kernel(&self, device: u32, entry: &OffloadEntry) -> BackendResult {
        self.push(Event::Launch(device, entry.name.clone()));
        Ok(())
    }

    fn synchronize(&self, device: u32) -> BackendResult {
        self.push(Event::Sync(device));
        Ok(())
    }

    fn deinit_plugin(&self) -> BackendResult {
        self.push(Event::DeinitPlugin);
        Ok(())
    }

    fn use_auto_zero_copy(&self, device: u32) -> bool {
        self.zero_copy.contains(&device)
    }

    fn device_numa_node(&self, device: u32) -> Option<usize> {
        self.numa_nodes.get(device as usize).copied().flatten()
    }
}

/// Descriptor for a program at `begin` with one image per magic byte.
///
/// Every image offloads one kernel named `kernel` at `begin`.
pub fn program(begin: usize, magics: &[u8]) -> BinaryDescriptor {
    program_with(begin, magics, Vec::new())
}

/// Like [`program`], with extra entries added to every image.
pub fn program_with(begin: usize, magics: &[u8], extra: Vec<OffloadEntry>) -> BinaryDescriptor {
    let mut entries = vec![OffloadEntry::function("kernel", begin)];
    entries.extend(extra);
    BinaryDescriptor::new(
        HostEntryRange::new(begin, begin + 0x100),
        entries.clone(),
        magics
            .iter()
            .map(|&m| ImageDescriptor::new(vec![m, 0, 0, 0], entries.clone()))
            .collect(),
    )
}

/// Manager with the given backends added in order.
pub fn manager_with(backends: &[(&str, Arc<MockBackend>)]) -> PluginManager {
    let manager = PluginManager::new(ManagerConfig::empty());
    for (name, backend) in backends {
        manager
            .add_backend(name, Arc::clone(backend) as Arc<dyn Backend>)
            .unwrap();
    }
    manager
}

/// Install a test subscriber once; output only shows with `--nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
