//! C ABI of dynamically loaded backend plugins.
//!
//! A plugin library exports one function per capability, named
//! `__tgt_rtl_<entry>`. [`PLUGIN_API`] lists every entry point with its
//! mandatory flag; [`PluginApi::bind`] resolves them into a typed table.

use crate::image::{DeviceImage, TargetEntry, TargetTable};
use libloading::Library;
use std::ffi::{CStr, CString, c_char, c_void};

/// Prefix of every exported plugin symbol.
pub const SYMBOL_PREFIX: &str = "__tgt_rtl_";

/// Offload entry as laid out across the plugin ABI.
#[repr(C)]
#[derive(Debug)]
pub struct RawOffloadEntry {
    /// Host address of the entry.
    pub addr: *mut c_void,
    /// Null-terminated symbol name.
    pub name: *const c_char,
    /// Size of a variable entry, zero for functions.
    pub size: usize,
    /// Entry flags.
    pub flags: i32,
    /// Reserved, must be zero.
    pub reserved: i32,
}

/// Device image as laid out across the plugin ABI.
#[repr(C)]
#[derive(Debug)]
pub struct RawDeviceImage {
    /// First byte of the binary.
    pub image_start: *const c_void,
    /// One past the last byte of the binary.
    pub image_end: *const c_void,
    /// First offload entry.
    pub entries_begin: *const RawOffloadEntry,
    /// One past the last offload entry.
    pub entries_end: *const RawOffloadEntry,
}

/// Target table returned by `load_binary`.
#[repr(C)]
#[derive(Debug)]
pub struct RawTargetTable {
    /// First device entry.
    pub entries_begin: *const RawOffloadEntry,
    /// One past the last device entry.
    pub entries_end: *const RawOffloadEntry,
}

/// One entry point of the plugin ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiEntry {
    /// Entry name without [`SYMBOL_PREFIX`].
    pub name: &'static str,
    /// Whether a plugin lacking this entry is rejected.
    pub mandatory: bool,
}

impl ApiEntry {
    /// Full exported symbol name.
    pub fn symbol(&self) -> String {
        format!("{SYMBOL_PREFIX}{}", self.name)
    }
}

/// Resolve one symbol from a library.
///
/// # Safety
///
/// `T` must match the signature of the exported symbol.
unsafe fn lookup<T: Copy>(library: &Library, name: &str) -> Option<T> {
    let symbol = format!("{SYMBOL_PREFIX}{name}\0");
    // SAFETY: Caller guarantees `T` matches the symbol's type.
    unsafe { library.get::<T>(symbol.as_bytes()).ok().map(|s| *s) }
}

macro_rules! plugin_api {
    (
        mandatory { $( $(#[$mmeta:meta])* $mname:ident: fn($($marg:ty),*) -> $mret:ty; )* }
        optional { $( $(#[$ometa:meta])* $oname:ident: fn($($oarg:ty),*) -> $oret:ty; )* }
    ) => {
        /// Typed table of a plugin's entry points.
        ///
        /// Function pointers are only valid while the library they were bound
        /// from stays loaded.
        #[derive(Debug, Clone, Copy)]
        pub struct PluginApi {
            $( $(#[$mmeta])* pub $mname: unsafe extern "C" fn($($marg),*) -> $mret, )*
            $( $(#[$ometa])* pub $oname: Option<unsafe extern "C" fn($($oarg),*) -> $oret>, )*
        }

        /// Every entry point of the plugin ABI, in binding order.
        pub const PLUGIN_API: &[ApiEntry] = &[
            $( ApiEntry { name: stringify!($mname), mandatory: true }, )*
            $( ApiEntry { name: stringify!($oname), mandatory: false }, )*
        ];

        impl PluginApi {
            /// Bind every entry point from `library`.
            ///
            /// Returns the name of the first missing mandatory entry on failure.
            ///
            /// # Safety
            ///
            /// Every exported `__tgt_rtl_*` symbol must have the signature
            /// declared for it in this table.
            pub unsafe fn bind(library: &Library) -> Result<Self, &'static str> {
                $(
                    // SAFETY: Caller guarantees the exported signature.
                    let $mname = unsafe {
                        lookup::<unsafe extern "C" fn($($marg),*) -> $mret>(library, stringify!($mname))
                    }
                    .ok_or(stringify!($mname))?;
                )*
                $(
                    // SAFETY: Caller guarantees the exported signature.
                    let $oname = unsafe {
                        lookup::<unsafe extern "C" fn($($oarg),*) -> $oret>(library, stringify!($oname))
                    };
                )*
                Ok(Self { $($mname,)* $($oname,)* })
            }
        }
    };
}

plugin_api! {
    mandatory {
        /// Number of devices the plugin controls.
        number_of_devices: fn() -> i32;
        /// Nonzero if the plugin understands the image.
        is_valid_binary: fn(*mut RawDeviceImage) -> i32;
        /// Initialize one device.
        init_device: fn(i32) -> i32;
        /// Finalize one device.
        deinit_device: fn(i32) -> i32;
        /// Load an image on a device; null on failure.
        load_binary: fn(i32, *mut RawDeviceImage) -> *mut RawTargetTable;
        /// Launch the kernel registered for a host entry.
        launch_kernel: fn(i32, *mut c_void, *const c_char) -> i32;
        /// Wait for all operations issued on a device.
        synchronize: fn(i32) -> i32;
    }
    optional {
        /// Plugin-level initialization.
        init_plugin: fn() -> i32;
        /// Plugin-level teardown.
        deinit_plugin: fn() -> i32;
        /// Global number of the plugin's first device.
        set_device_offset: fn(i32) -> i32;
        /// Nonzero if the device suggests automatic zero-copy.
        use_auto_zero_copy: fn(i32) -> i32;
        /// NUMA node of a device, negative if unknown.
        device_numa_node: fn(i32) -> i32;
    }
}

/// Call `f` with a C view of `image`.
///
/// The view and every string it points to live until `f` returns.
pub(crate) fn with_raw_image<R>(image: &DeviceImage, f: impl FnOnce(*mut RawDeviceImage) -> R) -> R {
    // Interior NULs cannot cross the ABI; such names are truncated at the NUL.
    let names: Vec<CString> = image
        .entries()
        .iter()
        .map(|e| {
            let bytes = e.name.as_bytes();
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            CString::new(&bytes[..end]).unwrap_or_default()
        })
        .collect();
    let entries: Vec<RawOffloadEntry> = image
        .entries()
        .iter()
        .zip(&names)
        .map(|(e, name)| RawOffloadEntry {
            addr: e.addr as *mut c_void,
            name: name.as_ptr(),
            size: e.size,
            flags: e.flags.bits() as i32,
            reserved: 0,
        })
        .collect();

    let binary = image.binary().as_ptr_range();
    let table = entries.as_ptr_range();
    let mut raw = RawDeviceImage {
        image_start: binary.start.cast(),
        image_end: binary.end.cast(),
        entries_begin: table.start,
        entries_end: table.end,
    };
    f(&mut raw)
}

/// Copy a plugin-owned target table into an owned [`TargetTable`].
///
/// # Safety
///
/// `raw` must describe a valid entry range whose names are null-terminated.
pub(crate) unsafe fn target_table_from_raw(raw: &RawTargetTable) -> TargetTable {
    if raw.entries_begin.is_null() || raw.entries_end < raw.entries_begin {
        return TargetTable::default();
    }
    // SAFETY: Caller guarantees the range is valid.
    let len = unsafe { raw.entries_end.offset_from(raw.entries_begin) } as usize;
    // SAFETY: Caller guarantees `len` initialized entries start at `entries_begin`.
    let entries = unsafe { std::slice::from_raw_parts(raw.entries_begin, len) };

    TargetTable {
        entries: entries
            .iter()
            .map(|e| TargetEntry {
                name: if e.name.is_null() {
                    String::new()
                } else {
                    // SAFETY: Caller guarantees names are null-terminated.
                    unsafe { CStr::from_ptr(e.name) }
                        .to_string_lossy()
                        .into_owned()
                },
                device_addr: e.addr as u64,
                size: e.size,
            })
            .collect(),
    }
}
