//! Backend plugins.
//!
//! A backend is anything implementing [`Backend`]. Backends linked into the
//! process are handed to the manager directly; backends living in shared
//! libraries are opened by [`PluginLoader`] and exposed as [`DylibBackend`].
//!
//! # Plugin Structure
//!
//! A plugin library (`lib<name>.so`) exports one C function per capability:
//!
//! ```c
//! int32_t __tgt_rtl_number_of_devices(void);
//! int32_t __tgt_rtl_is_valid_binary(__tgt_device_image *image);
//! int32_t __tgt_rtl_init_device(int32_t device);
//! /* ... see PLUGIN_API for the full list */
//! ```
//!
//! Missing mandatory entries reject the plugin; missing optional entries
//! fall back to the neutral defaults of [`Backend`].

mod adaptor;
mod backend;
mod descriptor;
mod loader;

pub use adaptor::{AdaptorId, PluginAdaptor};
pub use backend::{Backend, BackendRegistration, BackendResult};
pub use descriptor::{
    ApiEntry, PLUGIN_API, PluginApi, RawDeviceImage, RawOffloadEntry, RawTargetTable,
    SYMBOL_PREFIX,
};
pub use loader::{DylibBackend, PluginLoader};

#[cfg(test)]
pub(crate) use backend::test_support;
