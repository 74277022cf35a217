use parking_lot::Mutex;

use super::{MetadataStore, StoreError, TableMetadata, Version};

/// Metadata store held entirely in memory.
#[derive(Debug)]
pub struct InMemoryStore {
    current: Mutex<TableMetadata>,
}

impl InMemoryStore {
    pub fn new(initial: TableMetadata) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }
}

impl MetadataStore for InMemoryStore {
    fn load(&self) -> Result<TableMetadata, StoreError> {
        Ok(self.current.lock().clone())
    }

    fn swap(&self, base: Version, next: &TableMetadata) -> Result<(), StoreError> {
        let mut current = self.current.lock();
        if current.version != base {
            return Err(StoreError::Conflict {
                expected: base,
                actual: current.version,
            });
        }

        let mut next = next.clone();
        next.version = base + 1;
        *current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableMetadata {
        TableMetadata::new("memory://t", serde_json::json!({}))
    }

    #[test]
    fn swap_bumps_version() {
        let store = InMemoryStore::new(table());
        let base = store.load().unwrap();

        store.swap(base.version, &base).unwrap();
        assert_eq!(store.load().unwrap().version, base.version + 1);
    }

    #[test]
    fn stale_base_is_rejected() {
        let store = InMemoryStore::new(table());
        let base = store.load().unwrap();
        store.swap(base.version, &base).unwrap();

        let err = store.swap(base.version, &base).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                actual: 1
            }
        ));
    }
}
