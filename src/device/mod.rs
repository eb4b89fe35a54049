//! Device objects and the global device registry.
//!
//! Every device of every activated plugin gets one global device number.
//! Numbers are 0-based, contiguous and never reassigned: a plugin's devices
//! occupy `[offset, offset + n)` where `offset` is the registry size at the
//! moment the plugin was activated.

mod object;
mod registry;

pub use object::{DestructorOutcome, Device, DeviceOffloadEntry, PendingCtorsDtors, ProgramId};
pub use registry::DeviceRegistry;
