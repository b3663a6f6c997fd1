use std::collections::HashMap;

use parking_lot::RwLock;

use super::MemoryError;

/// In-memory key/value store with a per-value size cap.
pub struct KvStore {
    max_value_bytes: usize,
    items: RwLock<HashMap<String, String>>,
}

impl KvStore {
    pub fn new(max_value_bytes: usize) -> Self {
        Self {
            max_value_bytes,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, key: &str, value: String) -> Result<(), MemoryError> {
        if key.is_empty() {
            return Err(MemoryError::EmptyKey);
        }
        if value.len() > self.max_value_bytes {
            return Err(MemoryError::ValueTooLarge {
                size: value.len(),
                limit: self.max_value_bytes,
            });
        }
        self.items.write().insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }
}
