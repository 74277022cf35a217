// File Metadata Adapter
//
// Turns caller-supplied file hints into fully populated data and
// delete file descriptors. Missing fields are inferred through a
// `FileInspector`: a filesystem stat for sizes and, as a last resort,
// a footer read for record counts and equality field ids.

mod local;

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use self::local::LocalFileInspector;

/// On-disk format of a data or delete file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Parquet,
    Avro,
    Orc,
}

impl FileFormat {
    /// Parse a user-supplied format name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "parquet" => Some(Self::Parquet),
            "avro" => Some(Self::Avro),
            "orc" => Some(Self::Orc),
            _ => None,
        }
    }

    /// Infer the format from a path's extension.
    pub fn from_path(path: &str) -> Option<Self> {
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
    }
}

/// Column statistics supplied by the writer of a file.
///
/// Bounds are kept in their encoded form; they are carried through to
/// metadata untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetrics {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub null_value_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// A fully resolved data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    pub file_path: String,
    pub file_format: FileFormat,
    pub file_size_in_bytes: u64,
    pub record_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_metrics: Option<Vec<ColumnMetrics>>,
}

/// A fully resolved equality delete file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFile {
    pub file_path: String,
    pub file_format: FileFormat,
    pub file_size_in_bytes: u64,
    pub record_count: u64,
    pub equality_field_ids: Vec<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_metrics: Option<Vec<ColumnMetrics>>,
}

/// Caller-supplied description of a file, as found in request JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileRef {
    pub file_path: String,

    #[serde(default)]
    pub file_format: Option<String>,

    #[serde(default)]
    pub file_size_in_bytes: Option<u64>,

    #[serde(default)]
    pub record_count: Option<u64>,

    #[serde(default)]
    pub col_metrics: Option<Vec<ColumnMetrics>>,

    #[serde(default)]
    pub delete_type: Option<String>,

    /// Comma separated field ids, e.g. `"1, 2"`.
    #[serde(default)]
    pub delete_field_ids: Option<String>,
}

/// Metadata read from a file footer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FooterInfo {
    pub record_count: u64,
    pub delete_field_ids: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FileInferenceError {
    #[error("unable to infer the file format of {path}")]
    UnknownFormat { path: String },

    #[error("unable to infer the file size of {path}: {source}")]
    Size {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to read the footer of {path}: {reason}")]
    Footer { path: String, reason: String },

    #[error("cannot read a {format:?} footer for {path}; supply record_count or col_metrics")]
    UnsupportedFooter { path: String, format: FileFormat },

    #[error("unsupported delete type `{delete_type}` for {path}; only equality deletes are supported")]
    UnsupportedDeleteType { path: String, delete_type: String },

    #[error("no equality delete field ids for {path}")]
    MissingDeleteFieldIds { path: String },

    #[error("invalid delete field ids `{ids}` for {path}")]
    InvalidDeleteFieldIds { path: String, ids: String },
}

/// Source of facts about files that were not supplied by the caller.
pub trait FileInspector: Send + Sync {
    /// Size of the file in bytes.
    fn file_size(&self, path: &str) -> std::io::Result<u64>;

    /// Read the file footer. This opens the file and is the most
    /// expensive step of the write path.
    fn footer(&self, path: &str, format: FileFormat) -> Result<FooterInfo, FileInferenceError>;
}

fn resolve_format(hint: &DataFileRef) -> Result<FileFormat, FileInferenceError> {
    hint.file_format
        .as_deref()
        .and_then(FileFormat::parse)
        .or_else(|| FileFormat::from_path(&hint.file_path))
        .ok_or_else(|| FileInferenceError::UnknownFormat {
            path: hint.file_path.clone(),
        })
}

fn resolve_size(
    inspector: &dyn FileInspector,
    hint: &DataFileRef,
) -> Result<u64, FileInferenceError> {
    match hint.file_size_in_bytes {
        Some(size) => Ok(size),
        None => inspector
            .file_size(&hint.file_path)
            .map_err(|source| FileInferenceError::Size {
                path: hint.file_path.clone(),
                source,
            }),
    }
}

fn metrics_record_count(metrics: &[ColumnMetrics]) -> Option<u64> {
    metrics.iter().filter_map(|m| m.value_count).max()
}

fn parse_field_ids(path: &str, ids: &str) -> Result<Vec<i32>, FileInferenceError> {
    let parsed: Result<Vec<i32>, _> = ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::parse)
        .collect();

    match parsed {
        Ok(ids) if !ids.is_empty() => Ok(ids),
        Ok(_) => Err(FileInferenceError::MissingDeleteFieldIds { path: path.into() }),
        Err(_) => Err(FileInferenceError::InvalidDeleteFieldIds {
            path: path.into(),
            ids: ids.into(),
        }),
    }
}

/// Resolve a data file, inferring whatever the hints leave out.
pub fn resolve_data_file(
    inspector: &dyn FileInspector,
    hint: &DataFileRef,
) -> Result<DataFile, FileInferenceError> {
    let file_format = resolve_format(hint)?;
    let file_size_in_bytes = resolve_size(inspector, hint)?;

    let record_count = match hint
        .record_count
        .or_else(|| hint.col_metrics.as_deref().and_then(metrics_record_count))
    {
        Some(count) => count,
        None => {
            tracing::debug!(path = %hint.file_path, "reading footer for record count");
            inspector.footer(&hint.file_path, file_format)?.record_count
        }
    };

    Ok(DataFile {
        file_path: hint.file_path.clone(),
        file_format,
        file_size_in_bytes,
        record_count,
        column_metrics: hint.col_metrics.clone(),
    })
}

/// Resolve an equality delete file.
pub fn resolve_delete_file(
    inspector: &dyn FileInspector,
    hint: &DataFileRef,
) -> Result<DeleteFile, FileInferenceError> {
    if let Some(delete_type) = hint.delete_type.as_deref() {
        if !delete_type.is_empty() && !delete_type.eq_ignore_ascii_case("equality") {
            return Err(FileInferenceError::UnsupportedDeleteType {
                path: hint.file_path.clone(),
                delete_type: delete_type.into(),
            });
        }
    }

    let file_format = resolve_format(hint)?;
    let file_size_in_bytes = resolve_size(inspector, hint)?;

    let known_count = hint
        .record_count
        .or_else(|| hint.col_metrics.as_deref().and_then(metrics_record_count));
    let known_ids = hint
        .delete_field_ids
        .as_deref()
        .filter(|ids| !ids.trim().is_empty());

    let (record_count, field_ids) = match (known_count, known_ids) {
        (Some(count), Some(ids)) => (count, ids.to_string()),
        _ => {
            tracing::debug!(path = %hint.file_path, "reading footer for delete file");
            let footer = inspector.footer(&hint.file_path, file_format)?;
            let ids = known_ids
                .map(str::to_string)
                .or(footer.delete_field_ids)
                .ok_or_else(|| FileInferenceError::MissingDeleteFieldIds {
                    path: hint.file_path.clone(),
                })?;
            (known_count.unwrap_or(footer.record_count), ids)
        }
    };

    Ok(DeleteFile {
        file_path: hint.file_path.clone(),
        file_format,
        file_size_in_bytes,
        record_count,
        equality_field_ids: parse_field_ids(&hint.file_path, &field_ids)?,
        column_metrics: hint.col_metrics.clone(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Inspector that answers from fixed values and counts footer reads.
    #[derive(Default)]
    pub(crate) struct FakeInspector {
        pub size: Option<u64>,
        pub footer: Option<FooterInfo>,
        pub footer_reads: AtomicUsize,
    }

    impl FileInspector for FakeInspector {
        fn file_size(&self, path: &str) -> std::io::Result<u64> {
            self.size.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string())
            })
        }

        fn footer(&self, path: &str, _format: FileFormat) -> Result<FooterInfo, FileInferenceError> {
            self.footer_reads.fetch_add(1, Ordering::SeqCst);
            self.footer.clone().ok_or_else(|| FileInferenceError::Footer {
                path: path.into(),
                reason: "no footer".into(),
            })
        }
    }

    fn hint(path: &str) -> DataFileRef {
        DataFileRef {
            file_path: path.into(),
            ..Default::default()
        }
    }

    #[test]
    fn full_hints_skip_inspection() {
        let inspector = FakeInspector::default();
        let mut h = hint("s3://bucket/a.parquet");
        h.file_size_in_bytes = Some(10);
        h.record_count = Some(3);

        let file = resolve_data_file(&inspector, &h).unwrap();
        assert_eq!(file.file_format, FileFormat::Parquet);
        assert_eq!(file.record_count, 3);
        assert_eq!(inspector.footer_reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn column_metrics_avoid_footer_read() {
        let inspector = FakeInspector {
            size: Some(42),
            ..Default::default()
        };
        let mut h = hint("data/b.parquet");
        h.col_metrics = Some(vec![
            ColumnMetrics {
                name: "id".into(),
                column_size: Some(8),
                value_count: Some(7),
                null_value_count: Some(0),
                lower_bound: None,
                upper_bound: None,
                encoding: None,
            },
            ColumnMetrics {
                name: "name".into(),
                column_size: None,
                value_count: Some(5),
                null_value_count: None,
                lower_bound: None,
                upper_bound: None,
                encoding: None,
            },
        ]);

        let file = resolve_data_file(&inspector, &h).unwrap();
        assert_eq!(file.file_size_in_bytes, 42);
        assert_eq!(file.record_count, 7);
        assert_eq!(inspector.footer_reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn footer_is_last_resort() {
        let inspector = FakeInspector {
            size: Some(1),
            footer: Some(FooterInfo {
                record_count: 99,
                delete_field_ids: None,
            }),
            ..Default::default()
        };

        let file = resolve_data_file(&inspector, &hint("c.parquet")).unwrap();
        assert_eq!(file.record_count, 99);
        assert_eq!(inspector.footer_reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_extension_without_format_fails() {
        let inspector = FakeInspector::default();
        let err = resolve_data_file(&inspector, &hint("c.csv")).unwrap_err();
        assert!(matches!(err, FileInferenceError::UnknownFormat { .. }));
    }

    #[test]
    fn missing_size_is_reported() {
        let inspector = FakeInspector::default();
        let err = resolve_data_file(&inspector, &hint("gone.parquet")).unwrap_err();
        assert!(err.to_string().contains("file size"));
    }

    #[test]
    fn delete_file_field_ids_from_hint() {
        let inspector = FakeInspector::default();
        let mut h = hint("del.parquet");
        h.file_size_in_bytes = Some(5);
        h.record_count = Some(2);
        h.delete_type = Some("EQUALITY".into());
        h.delete_field_ids = Some("1, 3".into());

        let file = resolve_delete_file(&inspector, &h).unwrap();
        assert_eq!(file.equality_field_ids, vec![1, 3]);
    }

    #[test]
    fn delete_file_field_ids_from_footer() {
        let inspector = FakeInspector {
            size: Some(5),
            footer: Some(FooterInfo {
                record_count: 4,
                delete_field_ids: Some("2".into()),
            }),
            ..Default::default()
        };

        let file = resolve_delete_file(&inspector, &hint("del.parquet")).unwrap();
        assert_eq!(file.record_count, 4);
        assert_eq!(file.equality_field_ids, vec![2]);
    }

    #[test]
    fn position_deletes_are_rejected() {
        let inspector = FakeInspector::default();
        let mut h = hint("del.parquet");
        h.delete_type = Some("position".into());

        let err = resolve_delete_file(&inspector, &h).unwrap_err();
        assert!(matches!(err, FileInferenceError::UnsupportedDeleteType { .. }));
    }
}
