use std::collections::HashMap;

use parking_lot::Mutex;

use crate::address::{AddressId, AddressRecord, AddressStatus};
use crate::errors::{AppError, AppResult, PersistenceConflict};

/// Persistence collaborator. `save` is optimistic: the stored revision must
/// match the record's, otherwise the write is rejected.
pub trait AddressStore: Send + Sync {
    fn load(&self, id: AddressId) -> AppResult<AddressRecord>;

    /// Returns the stored record with its bumped revision.
    fn save(&self, record: &AddressRecord) -> AppResult<AddressRecord>;

    fn insert(&self, record: &AddressRecord) -> AppResult<()>;

    fn find_by_original(&self, original_text: &str) -> AppResult<Option<AddressRecord>>;

    /// Records in insertion order, optionally filtered by status.
    fn list(&self, status: Option<AddressStatus>) -> AppResult<Vec<AddressRecord>>;
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<AddressId, AddressRecord>,
    order: Vec<AddressId>,
}

#[derive(Default)]
pub struct MemoryAddressStore {
    state: Mutex<MemoryState>,
}

impl MemoryAddressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressStore for MemoryAddressStore {
    fn load(&self, id: AddressId) -> AppResult<AddressRecord> {
        self.state
            .lock()
            .records
            .get(&id)
            .cloned()
            .ok_or(AppError::NotFound(id))
    }

    fn save(&self, record: &AddressRecord) -> AppResult<AddressRecord> {
        let mut state = self.state.lock();
        let stored = state
            .records
            .get_mut(&record.id)
            .ok_or(AppError::NotFound(record.id))?;
        if stored.revision != record.revision {
            return Err(PersistenceConflict {
                id: record.id,
                expected: record.revision,
                found: stored.revision,
            }
            .into());
        }
        let mut saved = record.clone();
        saved.revision += 1;
        *stored = saved.clone();
        Ok(saved)
    }

    fn insert(&self, record: &AddressRecord) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.records.contains_key(&record.id) {
            return Err(AppError::Config(format!("address {} already exists", record.id)));
        }
        state.order.push(record.id);
        state.records.insert(record.id, record.clone());
        Ok(())
    }

    fn find_by_original(&self, original_text: &str) -> AppResult<Option<AddressRecord>> {
        let state = self.state.lock();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .find(|record| record.original_text == original_text)
            .cloned())
    }

    fn list(&self, status: Option<AddressStatus>) -> AppResult<Vec<AddressRecord>> {
        let state = self.state.lock();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|record| status.map_or(true, |wanted| record.status == wanted))
            .cloned()
            .collect())
    }
}
