//! Arena of registered programs.

use crate::device::ProgramId;
use crate::image::{BinaryDescriptor, DeviceImage, HostEntryRange, HostEntryTable};
use std::collections::HashMap;
use std::sync::Arc;

/// What the registry remembers about one loaded host program.
#[derive(Debug)]
pub(crate) struct ProgramRecord {
    /// Host entry table fixed by the first registration.
    pub host_table: Arc<HostEntryTable>,
    /// Every image extracted for the program.
    pub images: Vec<Arc<DeviceImage>>,
}

/// Program records with stable indices.
///
/// Devices refer to programs by [`ProgramId`]; slots of removed programs are
/// never reused.
#[derive(Debug, Default)]
pub(crate) struct ProgramArena {
    records: Vec<Option<ProgramRecord>>,
    by_range: HashMap<HostEntryRange, ProgramId>,
}

impl ProgramArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the program described by `desc`, creating its record on first
    /// registration.
    pub fn get_or_insert(&mut self, desc: &BinaryDescriptor) -> ProgramId {
        let range = desc.range();
        if let Some(id) = self.by_range.get(&range) {
            return *id;
        }
        let id = ProgramId(self.records.len());
        self.records.push(Some(ProgramRecord {
            host_table: Arc::new(desc.host_entries.clone()),
            images: Vec::new(),
        }));
        self.by_range.insert(range, id);
        id
    }

    pub fn get(&self, id: ProgramId) -> Option<&ProgramRecord> {
        self.records.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ProgramId) -> Option<&mut ProgramRecord> {
        self.records.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn lookup(&self, range: &HostEntryRange) -> Option<ProgramId> {
        self.by_range.get(range).copied()
    }

    /// Remove a program, returning its id and record.
    pub fn remove(&mut self, range: &HostEntryRange) -> Option<(ProgramId, ProgramRecord)> {
        let id = self.by_range.remove(range)?;
        let record = self.records.get_mut(id.0)?.take()?;
        Some((id, record))
    }

    /// Number of live programs.
    pub fn len(&self) -> usize {
        self.by_range.len()
    }
}
