use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::scrapable::Record;

/// Dynamic field keys seen so far, shared by concurrent extractions.
#[derive(Debug, Clone, Default)]
pub struct KnownKeys(Arc<Mutex<BTreeSet<String>>>);

impl KnownKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend<I>(&self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut set = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        set.extend(keys);
    }

    /// Sorted copy of the keys.
    pub fn snapshot(&self) -> Vec<String> {
        let set = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        set.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records gathered during one run and how many of them are on disk.
#[derive(Debug, Default)]
pub struct ScrapeSession {
    records: Vec<Record>,
    persisted: usize,
    interrupted: bool,
}

impl ScrapeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&mut self, records: Vec<Record>) {
        self.records.extend(records);
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Records not yet handed successfully to a checkpoint.
    pub fn pending(&self) -> &[Record] {
        &self.records[self.persisted..]
    }

    pub fn persisted(&self) -> usize {
        self.persisted
    }

    /// Moves the cursor forward, never past the in-memory records.
    pub fn mark_persisted(&mut self, count: usize) {
        self.persisted = (self.persisted + count).min(self.records.len());
    }

    pub fn mark_all_persisted(&mut self) {
        self.persisted = self.records.len();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn degraded(&self) -> usize {
        self.records.iter().filter(|r| r.degraded).count()
    }

    pub fn set_interrupted(&mut self) {
        self.interrupted = true;
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}
