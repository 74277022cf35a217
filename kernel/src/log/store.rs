// Metadata Storage Abstraction
//
// Defines the durability contract for the authoritative table metadata.
// Implementations may persist to disk, object storage, databases, etc.

use std::sync::Arc;

use super::{StoreError, TableMetadata, Version};

/// Storage backend for table metadata.
///
/// Properties required from implementations:
/// - Exactly one live metadata document per table
/// - Atomic replacement
/// - CAS semantics on version
///
/// Implementations MUST NOT:
/// - Accept a commit whose base version is stale
/// - Merge concurrent commits
/// - Expose a partially written document
pub trait MetadataStore: Send + Sync {
    /// Load the current metadata document.
    fn load(&self) -> Result<TableMetadata, StoreError>;

    /// Replace the current document with `next`.
    ///
    /// Implementations must enforce:
    /// - `base` == current version, else `StoreError::Conflict`
    /// - the stored document carries version `base + 1`
    fn swap(&self, base: Version, next: &TableMetadata) -> Result<(), StoreError>;
}

impl<S: MetadataStore + ?Sized> MetadataStore for Arc<S> {
    fn load(&self) -> Result<TableMetadata, StoreError> {
        (**self).load()
    }

    fn swap(&self, base: Version, next: &TableMetadata) -> Result<(), StoreError> {
        (**self).swap(base, next)
    }
}
