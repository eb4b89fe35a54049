//! Program descriptors, device images and offload entries.
//!
//! A host program hands the registry a [`BinaryDescriptor`] when it is
//! loaded. The descriptor names the program's host entry table (whose address
//! range is the program's identity) and carries one [`ImageDescriptor`] per
//! embedded device binary. Registration extracts every image into an owned,
//! immutable [`DeviceImage`].

mod translation;

pub use translation::{TranslationTable, TranslationTables};

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Raw host address of an offload entry.
pub type HostAddr = usize;

bitflags! {
    /// Flags attached to an offload entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u32 {
        /// Entry is a global constructor to run before first use.
        const CTOR = 0x02;
        /// Entry is a global destructor to run at unregistration.
        const DTOR = 0x04;
        /// Entry refers to a variable that is linked, not copied.
        const LINK = 0x01;
    }
}

/// One (symbol, address) pair of an offload entry table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffloadEntry {
    /// Host address of the entry.
    pub addr: HostAddr,
    /// Symbol name shared by host and device.
    pub name: String,
    /// Size in bytes for variables, zero for functions.
    pub size: usize,
    /// Entry flags.
    pub flags: EntryFlags,
}

impl OffloadEntry {
    /// Create a function entry.
    pub fn function(name: impl Into<String>, addr: HostAddr) -> Self {
        Self {
            addr,
            name: name.into(),
            size: 0,
            flags: EntryFlags::empty(),
        }
    }

    /// Create a global constructor entry.
    pub fn ctor(name: impl Into<String>, addr: HostAddr) -> Self {
        Self {
            flags: EntryFlags::CTOR,
            ..Self::function(name, addr)
        }
    }

    /// Create a global destructor entry.
    pub fn dtor(name: impl Into<String>, addr: HostAddr) -> Self {
        Self {
            flags: EntryFlags::DTOR,
            ..Self::function(name, addr)
        }
    }

    /// Whether this entry is a global constructor.
    pub fn is_ctor(&self) -> bool {
        self.flags.contains(EntryFlags::CTOR)
    }

    /// Whether this entry is a global destructor.
    pub fn is_dtor(&self) -> bool {
        self.flags.contains(EntryFlags::DTOR)
    }
}

/// Address range of a program's host entry table.
///
/// The pair of raw addresses is the program's identity key for the whole
/// lifetime of the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostEntryRange {
    /// First entry address.
    pub begin: HostAddr,
    /// One past the last entry address.
    pub end: HostAddr,
}

impl HostEntryRange {
    /// Create a range.
    pub fn new(begin: HostAddr, end: HostAddr) -> Self {
        Self { begin, end }
    }
}

impl fmt::Display for HostEntryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.begin, self.end)
    }
}

/// Host side entry table of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntryTable {
    /// Identity of the table.
    pub range: HostEntryRange,
    /// Entries in table order.
    pub entries: Vec<OffloadEntry>,
}

/// One device binary embedded in a host program, as presented by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Binary blob in a backend-specific format.
    pub binary: Arc<[u8]>,
    /// Entry points offloaded by this image.
    pub entries: Vec<OffloadEntry>,
}

impl ImageDescriptor {
    /// Create an image descriptor.
    pub fn new(binary: impl Into<Arc<[u8]>>, entries: Vec<OffloadEntry>) -> Self {
        Self {
            binary: binary.into(),
            entries,
        }
    }
}

/// Descriptor of a loaded host program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryDescriptor {
    /// Host entry table of the program.
    pub host_entries: HostEntryTable,
    /// Device images embedded in the program.
    pub device_images: Vec<ImageDescriptor>,
}

impl BinaryDescriptor {
    /// Create a descriptor.
    pub fn new(
        range: HostEntryRange,
        entries: Vec<OffloadEntry>,
        device_images: Vec<ImageDescriptor>,
    ) -> Self {
        Self {
            host_entries: HostEntryTable { range, entries },
            device_images,
        }
    }

    /// Program identity.
    pub fn range(&self) -> HostEntryRange {
        self.host_entries.range
    }
}

static NEXT_IMAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of an extracted device image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u64);

impl ImageId {
    fn next() -> Self {
        Self(NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({})", self.0)
    }
}

/// A device image owned by the registry. Immutable once extracted.
#[derive(Debug)]
pub struct DeviceImage {
    id: ImageId,
    binary: Arc<[u8]>,
    entries: Vec<OffloadEntry>,
}

impl DeviceImage {
    /// Extract an owned image from a caller descriptor.
    pub fn extract(desc: &ImageDescriptor) -> Self {
        Self {
            id: ImageId::next(),
            binary: Arc::clone(&desc.binary),
            entries: desc.entries.clone(),
        }
    }

    /// Image identifier.
    pub fn id(&self) -> ImageId {
        self.id
    }

    /// Binary blob.
    pub fn binary(&self) -> &[u8] {
        &self.binary
    }

    /// Offload entries.
    pub fn entries(&self) -> &[OffloadEntry] {
        &self.entries
    }
}

/// Device side view of an entry after the image was loaded on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    /// Symbol name.
    pub name: String,
    /// Device address of the entry.
    pub device_addr: u64,
    /// Size in bytes for variables.
    pub size: usize,
}

/// Opaque table a backend returns after loading an image on a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetTable {
    /// Entries in image order.
    pub entries: Vec<TargetEntry>,
}

impl TargetTable {
    /// Find an entry by symbol name.
    pub fn entry(&self, name: &str) -> Option<&TargetEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}
