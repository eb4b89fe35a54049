//! Dynamic plugin loading using libloading.

use super::backend::{Backend, BackendResult};
use super::descriptor::{PluginApi, target_table_from_raw, with_raw_image};
use crate::error::{BackendError, Error, Result};
use crate::image::{DeviceImage, OffloadEntry, TargetTable};
use libloading::Library;
use std::ffi::{CString, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A backend living in a shared library.
///
/// The library stays loaded for as long as the backend exists.
pub struct DylibBackend {
    _library: Arc<Library>,
    api: PluginApi,
    path: PathBuf,
}

impl DylibBackend {
    /// Path the library was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for DylibBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DylibBackend")
            .field("path", &self.path)
            .finish()
    }
}

/// Device index as passed over the plugin ABI.
fn abi_device(device: u32) -> BackendResult<i32> {
    i32::try_from(device).map_err(|_| BackendError::FAIL)
}

// Every call below goes through a pointer bound at load time from a library
// that `_library` keeps alive; the plugin ABI contract covers the arguments.
impl Backend for DylibBackend {
    fn number_of_devices(&self) -> u32 {
        // SAFETY: See impl comment.
        let n = unsafe { (self.api.number_of_devices)() };
        u32::try_from(n).unwrap_or(0)
    }

    fn is_valid_binary(&self, image: &DeviceImage) -> bool {
        // SAFETY: See impl comment; the image view outlives the call.
        with_raw_image(image, |raw| unsafe { (self.api.is_valid_binary)(raw) } != 0)
    }

    fn init_device(&self, device: u32) -> BackendResult {
        let device = abi_device(device)?;
        // SAFETY: See impl comment.
        BackendError::check(unsafe { (self.api.init_device)(device) })
    }

    fn deinit_device(&self, device: u32) -> BackendResult {
        let device = abi_device(device)?;
        // SAFETY: See impl comment.
        BackendError::check(unsafe { (self.api.deinit_device)(device) })
    }

    fn load_binary(&self, device: u32, image: &DeviceImage) -> BackendResult<TargetTable> {
        let device = abi_device(device)?;
        with_raw_image(image, |raw| {
            // SAFETY: See impl comment; the image view outlives the call.
            let table = unsafe { (self.api.load_binary)(device, raw) };
            if table.is_null() {
                return Err(BackendError::FAIL);
            }
            // SAFETY: A non-null table is owned by the plugin and stays valid
            // while the image is loaded.
            Ok(unsafe { target_table_from_raw(&*table) })
        })
    }

    fn launch_kernel(&self, device: u32, entry: &OffloadEntry) -> BackendResult {
        let device = abi_device(device)?;
        let name = CString::new(entry.name.as_str()).map_err(|_| BackendError::FAIL)?;
        // SAFETY: See impl comment; `name` outlives the call.
        let rc = unsafe {
            (self.api.launch_kernel)(device, entry.addr as *mut c_void, name.as_ptr())
        };
        BackendError::check(rc)
    }

    fn synchronize(&self, device: u32) -> BackendResult {
        let device = abi_device(device)?;
        // SAFETY: See impl comment.
        BackendError::check(unsafe { (self.api.synchronize)(device) })
    }

    fn init_plugin(&self) -> BackendResult {
        match self.api.init_plugin {
            // SAFETY: See impl comment.
            Some(init) => BackendError::check(unsafe { init() }),
            None => Ok(()),
        }
    }

    fn deinit_plugin(&self) -> BackendResult {
        match self.api.deinit_plugin {
            // SAFETY: See impl comment.
            Some(deinit) => BackendError::check(unsafe { deinit() }),
            None => Ok(()),
        }
    }

    fn set_device_offset(&self, offset: usize) {
        let Some(set) = self.api.set_device_offset else {
            return;
        };
        let Ok(abi_offset) = i32::try_from(offset) else {
            tracing::warn!(path = %self.path.display(), offset, "device offset exceeds plugin ABI range");
            return;
        };
        // SAFETY: See impl comment.
        let rc = unsafe { set(abi_offset) };
        if rc != 0 {
            tracing::debug!(path = %self.path.display(), offset, rc, "plugin rejected device offset");
        }
    }

    fn use_auto_zero_copy(&self, device: u32) -> bool {
        let (Some(query), Ok(device)) = (self.api.use_auto_zero_copy, abi_device(device)) else {
            return false;
        };
        // SAFETY: See impl comment.
        unsafe { query(device) != 0 }
    }

    fn device_numa_node(&self, device: u32) -> Option<usize> {
        let query = self.api.device_numa_node?;
        let device = abi_device(device).ok()?;
        // SAFETY: See impl comment.
        usize::try_from(unsafe { query(device) }).ok()
    }
}

/// Plugin loader for opening backend libraries.
#[derive(Debug, Clone)]
pub struct PluginLoader {
    /// Search paths for plugins.
    search_paths: Vec<PathBuf>,
}

impl PluginLoader {
    /// Create a new plugin loader with default search paths.
    pub fn new() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("."),
                PathBuf::from("/usr/lib/offload"),
                PathBuf::from("/usr/local/lib/offload"),
            ],
        }
    }

    /// Create a loader that only searches `paths`.
    pub fn with_search_paths(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            search_paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a search path for plugins.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    /// Configured search paths.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// File name of the library implementing plugin `name`.
    pub fn library_name(name: &str) -> String {
        format!("lib{name}.so")
    }

    /// Load a plugin library from a specific path.
    ///
    /// # Safety
    ///
    /// Loading plugins executes arbitrary code from shared libraries. The
    /// library must export the `__tgt_rtl_*` entry points with the signatures
    /// declared in [`PluginApi`].
    pub unsafe fn load_from_path(&self, name: &str, path: &Path) -> Result<DylibBackend> {
        // SAFETY: Caller ensures the library is trusted.
        let library = unsafe { Library::new(path) }.map_err(|e| Error::Load {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!(plugin = name, path = %path.display(), "loaded library");

        // SAFETY: Caller guarantees the exported signatures.
        let api = unsafe { PluginApi::bind(&library) }.map_err(|missing| Error::Initialization {
            name: name.to_string(),
            reason: format!("necessary interface function ({missing}) was not found"),
        })?;

        Ok(DylibBackend {
            _library: Arc::new(library),
            api,
            path: path.to_path_buf(),
        })
    }

    /// Load a plugin by name.
    ///
    /// `name` is expanded to `lib<name>.so` and looked up in every search
    /// path first, then through the system library search.
    ///
    /// # Safety
    ///
    /// See [`PluginLoader::load_from_path`].
    pub unsafe fn load_by_name(&self, name: &str) -> Result<DylibBackend> {
        let lib_name = Self::library_name(name);

        for search_path in &self.search_paths {
            let path = search_path.join(&lib_name);
            if path.exists() {
                // SAFETY: Caller guarantees plugin is trusted.
                return unsafe { self.load_from_path(name, &path) };
            }
        }

        // SAFETY: Caller guarantees plugin is trusted.
        unsafe { self.load_from_path(name, Path::new(&lib_name)) }
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}
