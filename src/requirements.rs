//! Process-wide offload requirement flags.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// Requirements a program or plugin places on the whole process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequirementFlags: u32 {
        /// Devices may call back into the host.
        const REVERSE_OFFLOAD = 0x002;
        /// Host and devices share one address space.
        const UNIFIED_ADDRESS = 0x004;
        /// Host and devices share memory.
        const UNIFIED_SHARED_MEMORY = 0x008;
        /// Dynamic allocators are used inside target regions.
        const DYNAMIC_ALLOCATORS = 0x010;
        /// Map memory zero-copy because every device asked for it.
        const AUTO_ZERO_COPY = 0x100;
    }
}

/// Sticky set of requirement flags.
///
/// Flags are only ever added; nothing lowers a flag once raised.
#[derive(Debug, Default)]
pub struct Requirements {
    flags: AtomicU32,
}

impl Requirements {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `flags`.
    pub fn add(&self, flags: RequirementFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Current flags.
    pub fn get(&self) -> RequirementFlags {
        RequirementFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Whether all of `flags` are raised.
    pub fn contains(&self, flags: RequirementFlags) -> bool {
        self.get().contains(flags)
    }
}
