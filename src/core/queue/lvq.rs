use std::collections::HashMap;

use crate::core::message::Message;

/// Last-value index: for each key, the position of the one available (not held)
/// record carrying it.
#[derive(Debug, Clone)]
pub(crate) struct LvqIndex {
    key_property: String,
    available: HashMap<String, u64>,
}

impl LvqIndex {
    pub(crate) fn new(key_property: impl Into<String>) -> Self {
        Self {
            key_property: key_property.into(),
            available: HashMap::new(),
        }
    }

    pub(crate) fn key_of<'m>(&self, message: &'m Message) -> Option<&'m str> {
        message.property(&self.key_property)
    }

    pub(crate) fn candidate(&self, key: &str) -> Option<u64> {
        self.available.get(key).copied()
    }

    pub(crate) fn insert(&mut self, key: &str, position: u64) {
        self.available.insert(key.to_string(), position);
    }

    /// Forget `key` if it still points at `position`.
    pub(crate) fn remove(&mut self, key: &str, position: u64) {
        if self.available.get(key) == Some(&position) {
            self.available.remove(key);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.available.clear();
    }
}
