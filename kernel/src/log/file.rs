// Filesystem metadata store.
//
// Layout under the table location:
//
//   metadata/v<N>.metadata.json
//   metadata/version-hint.text
//
// A commit writes the next document to a temporary file and links it into
// place without clobbering. If `v<base+1>` already exists another writer
// committed first and the swap fails with a conflict.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{MetadataStore, StoreError, TableMetadata, Version};

const METADATA_DIR: &str = "metadata";
const VERSION_HINT: &str = "version-hint.text";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open an existing table at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        if store.latest_version()?.is_none() {
            return Err(StoreError::TableNotFound(store.root.display().to_string()));
        }
        Ok(store)
    }

    /// Create a new table at `root` with `initial` as version 1.
    pub fn create(root: impl Into<PathBuf>, initial: &TableMetadata) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        fs::create_dir_all(store.metadata_dir())?;

        let mut first = initial.clone();
        first.version = 1;
        match store.write_version(&first) {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                return Err(StoreError::TableAlreadyExists(
                    store.root.display().to_string(),
                ))
            }
            Err(other) => return Err(other),
        }

        tracing::info!(location = %store.root.display(), "created table");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    fn version_path(&self, version: Version) -> PathBuf {
        self.metadata_dir()
            .join(format!("v{version}.metadata.json"))
    }

    fn read_hint(&self) -> Option<Version> {
        fs::read_to_string(self.metadata_dir().join(VERSION_HINT))
            .ok()
            .and_then(|hint| hint.trim().parse().ok())
    }

    fn scan_versions(&self) -> Result<Option<Version>, StoreError> {
        let entries = match fs::read_dir(self.metadata_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest = None;
        for entry in entries {
            let name = entry?.file_name();
            let version = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.strip_suffix(".metadata.json"))
                .and_then(|n| n.parse::<Version>().ok());
            latest = latest.max(version);
        }
        Ok(latest)
    }

    /// Highest committed version. The hint may lag behind a commit whose
    /// hint write was interrupted, so probe forward from it.
    fn latest_version(&self) -> Result<Option<Version>, StoreError> {
        let mut version = match self.read_hint() {
            Some(hint) if self.version_path(hint).exists() => hint,
            _ => match self.scan_versions()? {
                Some(version) => version,
                None => return Ok(None),
            },
        };

        while self.version_path(version + 1).exists() {
            version += 1;
        }
        Ok(Some(version))
    }

    fn write_version(&self, metadata: &TableMetadata) -> Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(self.metadata_dir())?;
        serde_json::to_writer_pretty(&mut tmp, metadata)?;
        tmp.as_file_mut().sync_all()?;

        tmp.persist_noclobber(self.version_path(metadata.version))
            .map_err(|err| {
                if err.error.kind() == ErrorKind::AlreadyExists {
                    StoreError::Conflict {
                        expected: metadata.version.saturating_sub(1),
                        actual: self
                            .latest_version()
                            .ok()
                            .flatten()
                            .unwrap_or(metadata.version),
                    }
                } else {
                    StoreError::Io(err.error)
                }
            })?;

        self.write_hint(metadata.version);
        Ok(())
    }

    fn write_hint(&self, version: Version) {
        let result = NamedTempFile::new_in(self.metadata_dir()).and_then(|mut tmp| {
            write!(tmp, "{version}")?;
            tmp.persist(self.metadata_dir().join(VERSION_HINT))
                .map(|_| ())
                .map_err(|e| e.error)
        });

        if let Err(err) = result {
            tracing::warn!(version, error = %err, "failed to update version hint");
        }
    }
}

impl MetadataStore for FileStore {
    fn load(&self) -> Result<TableMetadata, StoreError> {
        let version = self
            .latest_version()?
            .ok_or_else(|| StoreError::TableNotFound(self.root.display().to_string()))?;

        let bytes = fs::read(self.version_path(version))?;
        let mut metadata: TableMetadata = serde_json::from_slice(&bytes)?;
        metadata.version = version;
        Ok(metadata)
    }

    fn swap(&self, base: Version, next: &TableMetadata) -> Result<(), StoreError> {
        if !self.version_path(base).exists() {
            let actual = self
                .latest_version()?
                .ok_or_else(|| StoreError::TableNotFound(self.root.display().to_string()))?;
            return Err(StoreError::Conflict {
                expected: base,
                actual,
            });
        }

        let mut next = next.clone();
        next.version = base + 1;
        self.write_version(&next)?;

        tracing::debug!(version = next.version, location = %self.root.display(), "committed metadata");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(dir: &Path) -> TableMetadata {
        TableMetadata::new(dir.display().to_string(), serde_json::json!({}))
    }

    #[test]
    fn create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path(), &metadata(dir.path())).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.version, 1);
        assert!(dir.path().join("metadata/v1.metadata.json").exists());
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::create(dir.path(), &metadata(dir.path())).unwrap();

        let err = FileStore::create(dir.path(), &metadata(dir.path())).unwrap_err();
        assert!(matches!(err, StoreError::TableAlreadyExists(_)));
    }

    #[test]
    fn open_missing_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileStore::open(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(_)));
    }

    #[test]
    fn concurrent_swap_from_same_base_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path(), &metadata(dir.path())).unwrap();
        let other = FileStore::open(dir.path()).unwrap();

        let base = store.load().unwrap();
        store.swap(base.version, &base).unwrap();

        let err = other.swap(base.version, &base).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                actual: 2
            }
        ));
        assert_eq!(other.load().unwrap().version, 2);
    }

    #[test]
    fn stale_hint_is_probed_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path(), &metadata(dir.path())).unwrap();
        let base = store.load().unwrap();
        store.swap(base.version, &base).unwrap();

        fs::write(dir.path().join("metadata").join(VERSION_HINT), "1").unwrap();
        assert_eq!(store.load().unwrap().version, 2);
    }
}
