//! Error types for the offload registry.

use crate::image::{HostAddr, HostEntryRange, ImageId};
use thiserror::Error;

/// Result type alias using the registry's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Nonzero return code reported by a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("backend returned error code {0}")]
pub struct BackendError(pub i32);

impl BackendError {
    /// Generic failure code used when a backend has nothing more specific.
    pub const FAIL: Self = Self(-1);

    /// Convert a C-style return code into a `Result`.
    pub fn check(rc: i32) -> std::result::Result<(), Self> {
        if rc == 0 { Ok(()) } else { Err(Self(rc)) }
    }
}

/// Main error type for registry operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The plugin library is absent or could not be opened.
    #[error("unable to load library '{name}': {reason}")]
    Load {
        /// Plugin name as configured.
        name: String,
        /// Loader diagnostic.
        reason: String,
    },

    /// The plugin was opened but is unusable.
    #[error("invalid plugin '{name}': {reason}")]
    Initialization {
        /// Plugin name.
        name: String,
        /// Why the plugin was rejected.
        reason: String,
    },

    /// A single device failed to initialize and was skipped.
    #[error("device {local_id} of plugin '{plugin}' failed to initialize: {source}")]
    DeviceInit {
        /// Plugin owning the device.
        plugin: String,
        /// Plugin-local device index.
        local_id: u32,
        /// Backend failure.
        #[source]
        source: BackendError,
    },

    /// Global device number not (yet) allocated.
    #[error("device number '{requested}' out of range, only {available} devices available")]
    OutOfRange {
        /// Requested global device number.
        requested: usize,
        /// Current registry size.
        available: usize,
    },

    /// No loaded plugin recognizes the image.
    #[error("no plugin found for image {0}")]
    UnboundImage(ImageId),

    /// Unregistration found nothing to undo.
    #[error("nothing registered for {0}, probably already removed")]
    StaleUnregister(String),

    /// Host address is not an entry of any registered program.
    #[error("host address {0:#x} is not a registered offload entry")]
    UnknownHostEntry(HostAddr),

    /// The device has no image bound for the program.
    #[error("no image bound on device {device} for program {range}")]
    NoImageForDevice {
        /// Global device number.
        device: usize,
        /// Program identity.
        range: HostEntryRange,
    },

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `StaleUnregister` error for a program identity.
    pub(crate) fn stale(what: impl std::fmt::Display) -> Self {
        Self::StaleUnregister(what.to_string())
    }
}
