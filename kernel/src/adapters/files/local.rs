// Local filesystem inspector.
//
// Paths are plain filesystem paths; a `file://` prefix is tolerated.

use std::fs::File;

use parquet::file::reader::{FileReader, SerializedFileReader};

use super::{FileFormat, FileInferenceError, FileInspector, FooterInfo};

const DELETE_FIELD_IDS_KEY: &str = "delete-field-ids";

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileInspector;

fn local_path(path: &str) -> &str {
    path.strip_prefix("file://").unwrap_or(path)
}

impl FileInspector for LocalFileInspector {
    fn file_size(&self, path: &str) -> std::io::Result<u64> {
        std::fs::metadata(local_path(path)).map(|meta| meta.len())
    }

    fn footer(&self, path: &str, format: FileFormat) -> Result<FooterInfo, FileInferenceError> {
        if format != FileFormat::Parquet {
            return Err(FileInferenceError::UnsupportedFooter {
                path: path.into(),
                format,
            });
        }

        let footer_error = |reason: String| FileInferenceError::Footer {
            path: path.into(),
            reason,
        };

        let file = File::open(local_path(path)).map_err(|e| footer_error(e.to_string()))?;
        let reader = SerializedFileReader::new(file).map_err(|e| footer_error(e.to_string()))?;
        let meta = reader.metadata().file_metadata();

        let delete_field_ids = meta.key_value_metadata().and_then(|kvs| {
            kvs.iter()
                .find(|kv| kv.key == DELETE_FIELD_IDS_KEY)
                .and_then(|kv| kv.value.clone())
        });

        Ok(FooterInfo {
            record_count: u64::try_from(meta.num_rows()).unwrap_or_default(),
            delete_field_ids,
        })
    }
}
