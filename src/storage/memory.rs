use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Error, Persistence, Record};

/// In-memory [`Persistence`].
///
/// Clones share one record table, so a clone handed to a fresh client
/// behaves like the same disk seen after a process restart. Each handle
/// tracks its own open/closed state.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    records: Arc<Mutex<HashMap<String, Record>>>,
    open: bool,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, regardless of open state.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the raw record under `key` without going through `open`.
    ///
    /// Meant for tests that need to plant damaged or hand-built records.
    pub fn insert_raw(&self, key: &str, record: Record) {
        self.table().insert(key.to_string(), record);
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.open { Ok(()) } else { Err(Error::NotOpen) }
    }
}

impl Persistence for MemoryPersistence {
    fn open(&mut self, _client_id: &str, _server_uri: &str) -> Result<(), Error> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.open = false;
        Ok(())
    }

    fn put(&mut self, key: &str, record: &Record) -> Result<(), Error> {
        self.check_open()?;
        self.table().insert(key.to_string(), record.clone());
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Option<Record>, Error> {
        self.check_open()?;
        Ok(self.table().get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> Result<(), Error> {
        self.check_open()?;
        self.table().remove(key);
        Ok(())
    }

    fn contains_key(&mut self, key: &str) -> Result<bool, Error> {
        self.check_open()?;
        Ok(self.table().contains_key(key))
    }

    fn keys(&mut self) -> Result<Vec<String>, Error> {
        self.check_open()?;
        Ok(self.table().keys().cloned().collect())
    }

    fn clear(&mut self) -> Result<(), Error> {
        self.check_open()?;
        self.table().clear();
        Ok(())
    }
}
