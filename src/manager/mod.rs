//! The process-scoped registry context.
//!
//! [`PluginManager`] owns every loaded plugin, the device registry, the
//! per-program translation tables and the host-pointer map. Construct one at
//! startup and pass it to every call path; nothing here is a global.
//!
//! # Locking
//!
//! | Guard | Protects |
//! |-------|----------|
//! | registration | plugin list, program arena; serializes (un)registration and discovery |
//! | translation tables | creation, update and removal of translation tables |
//! | host-pointer map | host entry address to program lookups |
//! | device registry | the device sequence, held only for one access |
//! | per device | pending constructors/destructors of that device |
//!
//! The registration guard may be held while taking any other guard. The
//! translation-table and host-pointer guards are never held together, and the
//! device registry guard is never held across a backend call.

mod program;

use crate::affinity::{AffinityTable, NumaTopology, SysfsTopology};
use crate::config::ManagerConfig;
use crate::device::{DestructorOutcome, Device, DeviceRegistry, ProgramId};
use crate::error::{Error, Result};
use crate::image::{
    BinaryDescriptor, DeviceImage, HostAddr, HostEntryRange, ImageId, TargetEntry,
    TranslationTables,
};
use crate::observability::{
    init_metrics, instrument_registration, record_destructors_run, record_image_registered,
    record_image_unbound, record_plugin_loaded, record_plugin_rejected,
};
use crate::plugin::{AdaptorId, Backend, BackendRegistration, PluginAdaptor, PluginLoader};
use crate::requirements::{RequirementFlags, Requirements};
use program::ProgramArena;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where one image of a registered program ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBinding {
    /// Extracted image.
    pub image: ImageId,
    /// Plugin that accepted the image, `None` if no plugin did.
    pub plugin: Option<String>,
    /// Global device numbers the image is bound to.
    pub devices: Range<usize>,
}

impl ImageBinding {
    /// Whether a plugin accepted the image.
    pub fn is_bound(&self) -> bool {
        self.plugin.is_some()
    }
}

/// Outcome of unregistering a program.
#[derive(Debug, Default)]
pub struct UnregisterReport {
    /// Destructors issued and awaited, over all devices.
    pub destructors_run: usize,
    /// Devices whose destructors were skipped because constructors never ran.
    /// The program's queued constructors there were discarded too.
    pub skipped_devices: Vec<usize>,
    /// Conditions logged along the way; none of them stopped unregistration.
    pub diagnostics: Vec<Error>,
}

/// Snapshot of one loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSummary {
    /// Discovery position.
    pub id: AdaptorId,
    /// Plugin name.
    pub name: String,
    /// Devices the backend reports.
    pub plugin_devices: u32,
    /// Global device numbers, once the plugin is activated.
    pub devices: Option<Range<usize>>,
}

struct RegistrationState {
    adaptors: Vec<PluginAdaptor>,
    programs: ProgramArena,
    discovered: bool,
}

/// Offload plugin and device registry.
pub struct PluginManager {
    config: ManagerConfig,
    // Declared before `registration`: devices the registry holds the last
    // handle to are finalized before their plugins are deinitialized.
    devices: DeviceRegistry,
    registration: Mutex<RegistrationState>,
    translation_tables: Mutex<TranslationTables>,
    host_ptr_map: Mutex<HashMap<HostAddr, HostEntryRange>>,
    requirements: Requirements,
    topology: Option<Arc<dyn NumaTopology>>,
    affinity: Mutex<Option<Arc<AffinityTable>>>,
}

impl PluginManager {
    /// Create a manager with no plugin loaded.
    pub fn new(config: ManagerConfig) -> Self {
        init_metrics();
        Self {
            config,
            devices: DeviceRegistry::new(),
            registration: Mutex::new(RegistrationState {
                adaptors: Vec::new(),
                programs: ProgramArena::new(),
                discovered: false,
            }),
            translation_tables: Mutex::new(TranslationTables::new()),
            host_ptr_map: Mutex::new(HashMap::new()),
            requirements: Requirements::new(),
            topology: None,
            affinity: Mutex::new(None),
        }
    }

    /// Use `topology` instead of probing sysfs for locality ordering.
    pub fn with_topology(mut self, topology: Arc<dyn NumaTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn lock_registration(&self) -> MutexGuard<'_, RegistrationState> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tables(&self) -> MutexGuard<'_, TranslationTables> {
        self.translation_tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_host_ptrs(&self) -> MutexGuard<'_, HashMap<HostAddr, HostEntryRange>> {
        self.host_ptr_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open every configured plugin library, in configuration order.
    ///
    /// Runs once per manager; later calls return 0. Plugins that fail to load
    /// or initialize are logged and skipped. Returns the number of plugins
    /// accepted.
    ///
    /// # Safety
    ///
    /// Loading plugins executes code from shared libraries. Every configured
    /// plugin must be trusted and implement the plugin ABI.
    pub unsafe fn load_plugins(&self) -> usize {
        let mut state = self.lock_registration();
        if state.discovered {
            return 0;
        }
        state.discovered = true;

        let loader = PluginLoader::with_search_paths(
            self.config
                .search_paths
                .iter()
                .chain(PluginLoader::new().search_paths())
                .cloned(),
        );

        tracing::debug!(plugins = ?self.config.plugins, "loading plugins");
        let mut loaded = 0;
        for name in &self.config.plugins {
            // SAFETY: Caller guarantees configured plugins are trusted.
            let backend = match unsafe { loader.load_by_name(name) } {
                Ok(backend) => backend,
                Err(err) => {
                    tracing::debug!(plugin = %name, error = %err, "plugin not loaded");
                    record_plugin_rejected(name);
                    continue;
                }
            };
            if Self::add_adaptor(&mut state, name, Arc::new(backend)).is_ok() {
                loaded += 1;
            }
        }
        tracing::debug!(loaded, "plugins loaded");
        loaded
    }

    /// Register a backend linked into the process.
    ///
    /// The backend joins the end of the discovery order.
    pub fn add_backend(&self, name: &str, backend: Arc<dyn Backend>) -> Result<AdaptorId> {
        let mut state = self.lock_registration();
        Self::add_adaptor(&mut state, name, backend)
    }

    /// Register every backend of a static list, in list order.
    ///
    /// Returns the number of backends accepted.
    pub fn add_backends(&self, registrations: &[BackendRegistration]) -> usize {
        let mut state = self.lock_registration();
        registrations
            .iter()
            .filter(|r| Self::add_adaptor(&mut state, r.name, (r.create)()).is_ok())
            .count()
    }

    fn add_adaptor(
        state: &mut RegistrationState,
        name: &str,
        backend: Arc<dyn Backend>,
    ) -> Result<AdaptorId> {
        let id = AdaptorId(state.adaptors.len());
        match PluginAdaptor::create(id, name, backend) {
            Ok(adaptor) => {
                state.adaptors.push(adaptor);
                record_plugin_loaded(name);
                Ok(id)
            }
            Err(err) => {
                tracing::debug!(plugin = name, error = %err, "plugin rejected");
                record_plugin_rejected(name);
                Err(err)
            }
        }
    }

    /// Activate every loaded plugin.
    pub fn init_all_plugins(&self) {
        let mut state = self.lock_registration();
        for adaptor in &mut state.adaptors {
            adaptor.init_devices(&self.devices, &self.requirements);
        }
    }

    /// Register the device images of a loaded host program.
    ///
    /// Each image binds to the first plugin, in discovery order, that accepts
    /// it. Images nobody accepts are logged and reported unbound.
    pub fn register_lib(&self, desc: &BinaryDescriptor) -> Result<Vec<ImageBinding>> {
        let range = desc.range();
        let _span = instrument_registration("register", range);

        let mut guard = self.lock_registration();
        let state = &mut *guard;

        let program = state.programs.get_or_insert(desc);
        let images: Vec<Arc<DeviceImage>> = desc
            .device_images
            .iter()
            .map(|d| Arc::new(DeviceImage::extract(d)))
            .collect();
        let Some(record) = state.programs.get_mut(program) else {
            return Err(Error::stale(range));
        };
        record.images.extend(images.iter().cloned());
        let host_table = Arc::clone(&record.host_table);

        {
            let mut host_ptrs = self.lock_host_ptrs();
            for entry in &host_table.entries {
                host_ptrs.entry(entry.addr).or_insert(range);
            }
        }

        let mut bindings = Vec::with_capacity(images.len());
        for image in &images {
            let found = state.adaptors.iter_mut().find(|adaptor| {
                let valid = adaptor.is_valid_binary(image);
                tracing::debug!(
                    image = %image.id(),
                    plugin = adaptor.name(),
                    compatible = valid,
                    "checked image compatibility"
                );
                valid
            });

            let Some(adaptor) = found else {
                let err = Error::UnboundImage(image.id());
                tracing::debug!(error = %err, "image left unbound");
                record_image_unbound();
                bindings.push(ImageBinding {
                    image: image.id(),
                    plugin: None,
                    devices: 0..0,
                });
                continue;
            };

            adaptor.init_devices(&self.devices, &self.requirements);
            let devices = adaptor.device_range();
            {
                let mut tables = self.lock_tables();
                tables
                    .get_or_create(&host_table)
                    .register_image(devices.start, devices.len(), image);
            }
            adaptor.mark_image_used(image.id());
            adaptor.add_offload_entries(&self.devices, program, image)?;

            tracing::debug!(image = %image.id(), plugin = adaptor.name(), ?devices, "registered image");
            record_image_registered(adaptor.name());
            bindings.push(ImageBinding {
                image: image.id(),
                plugin: Some(adaptor.name().to_string()),
                devices,
            });
        }

        tracing::debug!("done registering entries");
        Ok(bindings)
    }

    /// Unregister a host program.
    ///
    /// On every device an image of the program is bound to, destructors run
    /// only if all of the program's constructors already ran there. Missing
    /// records are logged and treated as already clean.
    pub fn unregister_lib(&self, desc: &BinaryDescriptor) -> UnregisterReport {
        let range = desc.range();
        let _span = instrument_registration("unregister", range);
        let mut report = UnregisterReport::default();

        {
            let mut guard = self.lock_registration();
            let state = &mut *guard;
            match state.programs.remove(&range) {
                None => {
                    let err = Error::stale(format_args!("program {range}"));
                    tracing::debug!(error = %err, "unregistering unknown program");
                    report.diagnostics.push(err);
                }
                Some((program, record)) => {
                    for image in &record.images {
                        self.unregister_image(state, program, image, &mut report);
                    }
                }
            }
        }
        report.skipped_devices.sort_unstable();
        report.skipped_devices.dedup();

        self.lock_host_ptrs().retain(|_, owner| *owner != range);

        if self.lock_tables().remove(&range).is_some() {
            tracing::debug!(program = %range, "removed translation table");
        } else {
            let err = Error::stale(format_args!("translation table {range}"));
            tracing::debug!(error = %err, "translation table already removed");
            report.diagnostics.push(err);
        }

        tracing::debug!(destructors = report.destructors_run, "done unregistering library");
        report
    }

    fn unregister_image(
        &self,
        state: &mut RegistrationState,
        program: ProgramId,
        image: &DeviceImage,
        report: &mut UnregisterReport,
    ) {
        let Some(adaptor) = state
            .adaptors
            .iter_mut()
            .find(|a| a.is_used() && a.uses_image(image.id()))
        else {
            let err = Error::stale(image.id());
            tracing::debug!(error = %err, "no plugin in use supports the image");
            report.diagnostics.push(err);
            return;
        };

        for device_no in adaptor.device_range() {
            let device = match self.devices.get(device_no) {
                Ok(device) => device,
                Err(err) => {
                    tracing::warn!(error = %err, "device of a used plugin is missing");
                    report.diagnostics.push(err);
                    continue;
                }
            };
            match device.run_pending_dtors(program) {
                DestructorOutcome::Ran(n) => {
                    report.destructors_run += n;
                    record_destructors_run(adaptor.name(), n);
                }
                DestructorOutcome::Skipped => report.skipped_devices.push(device_no),
                DestructorOutcome::NotRecorded => {}
            }
        }
        adaptor.release_image(image.id());
        tracing::debug!(image = %image.id(), plugin = adaptor.name(), "unregistered image");
    }

    /// Look up a device by global number.
    ///
    /// The handle keeps the device alive. A handle still held when the
    /// manager is dropped delays that device's finalization past its
    /// plugin's teardown, so drop handles first.
    pub fn get_device(&self, device_no: usize) -> Result<Arc<Device>> {
        self.devices.get(device_no)
    }

    /// Look up a device and run its pending global constructors.
    pub fn check_device_and_ctors(&self, device_no: usize) -> Result<Arc<Device>> {
        let device = self.devices.get(device_no)?;
        device.run_pending_ctors()?;
        Ok(device)
    }

    /// Number of devices in the registry.
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Every device, in global order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.snapshot()
    }

    /// Snapshot of every loaded plugin, in discovery order.
    pub fn plugins(&self) -> Vec<PluginSummary> {
        self.lock_registration()
            .adaptors
            .iter()
            .map(|a| PluginSummary {
                id: a.id(),
                name: a.name().to_string(),
                plugin_devices: a.number_of_plugin_devices(),
                devices: a.is_used().then(|| a.device_range()),
            })
            .collect()
    }

    /// Number of activated plugins.
    pub fn num_used_plugins(&self) -> usize {
        self.lock_registration()
            .adaptors
            .iter()
            .filter(|a| a.is_used())
            .count()
    }

    /// Number of registered programs.
    pub fn num_programs(&self) -> usize {
        self.lock_registration().programs.len()
    }

    /// Images extracted for a registered program, in registration order.
    ///
    /// `None` if the program is not registered.
    pub fn program_images(&self, range: &HostEntryRange) -> Option<Vec<ImageId>> {
        let state = self.lock_registration();
        let id = state.programs.lookup(range)?;
        state
            .programs
            .get(id)
            .map(|record| record.images.iter().map(|i| i.id()).collect())
    }

    /// Resolve a host entry address to its entry on a device.
    ///
    /// The bound image is loaded on the device on first use and the result
    /// cached in the program's translation table.
    pub fn resolve_entry(&self, device_no: usize, host_addr: HostAddr) -> Result<TargetEntry> {
        let range = self
            .program_for_host_ptr(host_addr)
            .ok_or(Error::UnknownHostEntry(host_addr))?;
        let device = self.devices.get(device_no)?;

        let mut tables = self.lock_tables();
        let no_image = || Error::NoImageForDevice {
            device: device_no,
            range,
        };
        let table = tables.get_mut(&range).ok_or_else(no_image)?;
        let name = table
            .host_table()
            .entries
            .iter()
            .find(|e| e.addr == host_addr)
            .map(|e| e.name.clone())
            .ok_or(Error::UnknownHostEntry(host_addr))?;

        let target = match table.target_table(device_no) {
            Some(target) => Arc::clone(target),
            None => {
                let image = Arc::clone(table.image(device_no).ok_or_else(no_image)?);
                let loaded = Arc::new(device.load_binary(&image)?);
                tracing::debug!(device = device_no, image = %image.id(), "loaded image on device");
                table.set_target_table(device_no, Arc::clone(&loaded));
                loaded
            }
        };
        target
            .entry(&name)
            .cloned()
            .ok_or(Error::UnknownHostEntry(host_addr))
    }

    /// Program owning a host entry address.
    pub fn program_for_host_ptr(&self, host_addr: HostAddr) -> Option<HostEntryRange> {
        self.lock_host_ptrs().get(&host_addr).copied()
    }

    /// Number of host entry addresses currently mapped.
    pub fn num_host_ptrs(&self) -> usize {
        self.lock_host_ptrs().len()
    }

    /// Whether a program has a translation table.
    pub fn has_translation_table(&self, range: &HostEntryRange) -> bool {
        self.lock_tables().get(range).is_some()
    }

    /// Image bound to a device for a program.
    pub fn bound_image(&self, range: &HostEntryRange, device_no: usize) -> Option<ImageId> {
        self.lock_tables()
            .get(range)
            .and_then(|t| t.image(device_no).map(|i| i.id()))
    }

    /// Raise process-wide requirements.
    pub fn add_requirements(&self, flags: RequirementFlags) {
        self.requirements.add(flags);
    }

    /// Current process-wide requirements.
    pub fn requirements(&self) -> RequirementFlags {
        self.requirements.get()
    }

    /// Locality table covering every registered device.
    ///
    /// Node distances are sorted once, on first use. The device order is
    /// recomputed whenever the registry has grown since the last call.
    pub fn affinity(&self) -> Arc<AffinityTable> {
        let mut cached = self
            .affinity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let devices = self.devices.snapshot();

        if let Some(table) = cached.as_ref() {
            if !table.is_available() || table.num_devices() == devices.len() {
                return Arc::clone(table);
            }
        }
        let table = match cached.as_deref() {
            Some(table) => table.with_devices(&Self::device_nodes(&devices)),
            None => self.build_affinity(&devices),
        };
        let table = Arc::new(table);
        *cached = Some(Arc::clone(&table));
        table
    }

    fn device_nodes(devices: &[Arc<Device>]) -> Vec<Option<usize>> {
        devices.iter().map(|d| d.numa_node()).collect()
    }

    fn build_affinity(&self, devices: &[Arc<Device>]) -> AffinityTable {
        if !self.config.numa_affinity {
            return AffinityTable::Unavailable;
        }
        let topology = self.topology.clone().or_else(|| {
            SysfsTopology::detect().map(|t| Arc::new(t) as Arc<dyn NumaTopology>)
        });
        AffinityTable::build(topology.as_deref(), &Self::device_nodes(devices))
    }

    /// Copy up to `count` device numbers ordered by distance from `node`
    /// into `out`, returning how many were written.
    pub fn devices_in_order(&self, node: usize, count: usize, out: &mut [usize]) -> usize {
        let table = self.affinity();
        table.devices_in_order(node, count, self.num_devices(), out)
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.plugins().len())
            .field("devices", &self.num_devices())
            .field("requirements", &self.requirements())
            .finish()
    }
}
