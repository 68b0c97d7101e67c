use crate::error::StoreError;
use crate::model::{RecordKey, StudentRecord};
use std::cell::RefCell;
use std::collections::HashMap;

/// Where student records live between merges.
///
/// `fetch` answers [`StoreError::NotFound`] when the student has no record
/// for that period yet; any other error means the lookup itself failed.
/// `persist` must write the single record all-or-nothing.
pub trait RecordStore {
    /// Called once before a batch starts.
    fn check_available(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn fetch(&self, key: &RecordKey) -> Result<StudentRecord, StoreError>;

    fn persist(&self, record: &StudentRecord) -> Result<(), StoreError>;
}

impl<S: RecordStore + ?Sized> RecordStore for &S {
    fn check_available(&self) -> Result<(), StoreError> {
        (**self).check_available()
    }

    fn fetch(&self, key: &RecordKey) -> Result<StudentRecord, StoreError> {
        (**self).fetch(key)
    }

    fn persist(&self, record: &StudentRecord) -> Result<(), StoreError> {
        (**self).persist(record)
    }
}

/// Reads through to a backing store but keeps every write in memory, so a
/// batch can be previewed without touching stored records.
pub struct DryRunStore<'a, S: RecordStore + ?Sized> {
    inner: &'a S,
    staged: RefCell<HashMap<RecordKey, StudentRecord>>,
}

impl<'a, S: RecordStore + ?Sized> DryRunStore<'a, S> {
    pub fn new(inner: &'a S) -> Self {
        Self {
            inner,
            staged: RefCell::new(HashMap::new()),
        }
    }

    /// Records that would have been written, ordered by document id.
    pub fn into_staged(self) -> Vec<StudentRecord> {
        let mut out: Vec<StudentRecord> = self.staged.into_inner().into_values().collect();
        out.sort_by_key(|r| r.key().doc_id());
        out
    }
}

impl<S: RecordStore + ?Sized> RecordStore for DryRunStore<'_, S> {
    fn check_available(&self) -> Result<(), StoreError> {
        self.inner.check_available()
    }

    fn fetch(&self, key: &RecordKey) -> Result<StudentRecord, StoreError> {
        if let Some(r) = self.staged.borrow().get(key) {
            return Ok(r.clone());
        }
        self.inner.fetch(key)
    }

    fn persist(&self, record: &StudentRecord) -> Result<(), StoreError> {
        self.staged
            .borrow_mut()
            .insert(record.key(), record.clone());
        Ok(())
    }
}
