//! # Offload
//!
//! Plugin and device registry for accelerator offloading.
//!
//! Backends (one per accelerator family) are discovered at startup, either
//! from shared libraries implementing the plugin ABI or from a static list of
//! backends linked into the process. A host program registers its embedded
//! device images; each image binds to the first backend that understands it,
//! and that backend's devices join a single global device numbering.
//!
//! ## Features
//!
//! - **Lazy activation**: a plugin creates its devices only when an image
//!   first binds to it
//! - **Stable numbering**: global device numbers are contiguous and never
//!   reassigned
//! - **Translation tables**: per-program device to image bindings, with
//!   device entry tables resolved on first use
//! - **Global constructors/destructors**: queued per device and program,
//!   unregistration discards both on devices whose constructors never ran
//! - **NUMA ordering**: devices sorted by distance from a node
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use offload::prelude::*;
//!
//! let manager = PluginManager::new(ManagerConfig::from_env());
//! unsafe { manager.load_plugins() };
//!
//! let bindings = manager.register_lib(&descriptor)?;
//! let device = manager.check_device_and_ctors(0)?;
//! let entry = manager.resolve_entry(0, kernel_addr)?;
//!
//! manager.unregister_lib(&descriptor);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod affinity;
pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod manager;
pub mod observability;
pub mod plugin;
pub mod requirements;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::ManagerConfig;
    pub use crate::device::{Device, ProgramId};
    pub use crate::error::{Error, Result};
    pub use crate::image::{
        BinaryDescriptor, HostEntryRange, ImageDescriptor, OffloadEntry, TargetEntry,
    };
    pub use crate::manager::{ImageBinding, PluginManager, UnregisterReport};
    pub use crate::plugin::{Backend, BackendRegistration, BackendResult};
    pub use crate::requirements::RequirementFlags;
}

pub use error::{Error, Result};
pub use manager::PluginManager;
