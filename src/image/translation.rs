//! Per-program translation tables.

use super::{DeviceImage, HostEntryRange, HostEntryTable, TargetTable};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps one program's global device numbers to bound images and loaded tables.
///
/// `targets_images` and `targets_table` always have the same length.
#[derive(Debug)]
pub struct TranslationTable {
    host_table: Arc<HostEntryTable>,
    targets_images: Vec<Option<Arc<DeviceImage>>>,
    targets_table: Vec<Option<Arc<TargetTable>>>,
}

impl TranslationTable {
    /// Create an empty table for a program.
    pub fn new(host_table: Arc<HostEntryTable>) -> Self {
        Self {
            host_table,
            targets_images: Vec::new(),
            targets_table: Vec::new(),
        }
    }

    /// Host entry table of the program.
    pub fn host_table(&self) -> &Arc<HostEntryTable> {
        &self.host_table
    }

    /// Number of device slots.
    pub fn len(&self) -> usize {
        self.targets_images.len()
    }

    /// Whether no device slot exists yet.
    pub fn is_empty(&self) -> bool {
        self.targets_images.is_empty()
    }

    /// Bind `image` to the device slots `[offset, offset + count)`.
    ///
    /// Slots that change image lose their loaded table.
    pub fn register_image(&mut self, offset: usize, count: usize, image: &Arc<DeviceImage>) {
        debug_assert_eq!(self.targets_images.len(), self.targets_table.len());

        let min_len = offset + count;
        if self.targets_images.len() < min_len {
            self.targets_images.resize(min_len, None);
            self.targets_table.resize(min_len, None);
        }

        for slot in offset..min_len {
            let same = self.targets_images[slot]
                .as_ref()
                .is_some_and(|bound| bound.id() == image.id());
            if !same {
                self.targets_images[slot] = Some(Arc::clone(image));
                self.targets_table[slot] = None;
            }
        }
    }

    /// Image bound to a device slot.
    pub fn image(&self, device: usize) -> Option<&Arc<DeviceImage>> {
        self.targets_images.get(device).and_then(Option::as_ref)
    }

    /// Loaded table of a device slot, if already resolved.
    pub fn target_table(&self, device: usize) -> Option<&Arc<TargetTable>> {
        self.targets_table.get(device).and_then(Option::as_ref)
    }

    /// Store the loaded table for a device slot.
    ///
    /// Ignored for slots that were never reserved.
    pub fn set_target_table(&mut self, device: usize, table: Arc<TargetTable>) {
        if let Some(slot) = self.targets_table.get_mut(device) {
            *slot = Some(table);
        }
    }
}

/// All translation tables keyed by program identity, in registration order.
#[derive(Debug, Default)]
pub struct TranslationTables {
    tables: HashMap<HostEntryRange, TranslationTable>,
    order: Vec<HostEntryRange>,
}

impl TranslationTables {
    /// Create an empty set of tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the table of a program, creating it on first registration.
    ///
    /// The host table of an existing entry is never replaced.
    pub fn get_or_create(&mut self, host_table: &Arc<HostEntryTable>) -> &mut TranslationTable {
        let range = host_table.range;
        if !self.tables.contains_key(&range) {
            self.order.push(range);
        }
        self.tables
            .entry(range)
            .or_insert_with(|| TranslationTable::new(Arc::clone(host_table)))
    }

    /// Table of a program.
    pub fn get(&self, range: &HostEntryRange) -> Option<&TranslationTable> {
        self.tables.get(range)
    }

    /// Mutable table of a program.
    pub fn get_mut(&mut self, range: &HostEntryRange) -> Option<&mut TranslationTable> {
        self.tables.get_mut(range)
    }

    /// Remove the table of a program.
    pub fn remove(&mut self, range: &HostEntryRange) -> Option<TranslationTable> {
        let table = self.tables.remove(range)?;
        self.order.retain(|r| r != range);
        Some(table)
    }

    /// Program identities in registration order.
    pub fn ranges(&self) -> &[HostEntryRange] {
        &self.order
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether there are no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
