//! File-format seam.
//!
//! Columnar codecs live outside this crate; the engine only needs a way to
//! open a data file as decoded records with best-effort predicate pushdown.
//! [`JsonLinesFormat`] is the built-in line-delimited implementation used by
//! tests and scratch tables.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    fs::{FileIO, Path},
    ondisk::{
        meta::{DataFileMeta, FieldStats},
        ReadError,
    },
    predicate::Predicate,
    record::{GenericRow, KeyValue, RowKind, RowType},
};

/// One decoded record together with its position in the file. Positions feed
/// deletion-vector suppression, which happens above the format layer.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Zero-based row position within the file.
    pub position: u64,
    /// Decoded record.
    pub kv: KeyValue,
}

/// A stream of positioned records.
pub type FileRecordStream =
    futures_util::stream::BoxStream<'static, Result<FileRecord, ReadError>>;

/// Result of opening a file through a format.
pub struct FormatReader {
    /// Decoded records in file order, with accepted predicates already
    /// applied.
    pub records: FileRecordStream,
    /// Sub-predicates the format refused; the caller applies them post-decode.
    pub unpushed: Vec<Predicate>,
}

/// Object-safe format seam. `predicates` is a conjunction: the format may
/// evaluate any subset and must report the rest as unpushed.
#[async_trait]
pub trait FileFormat: Send + Sync {
    /// Open `path` for reading. `row_type` describes the stored value row so
    /// pushed predicates can be resolved by field name.
    async fn open(
        &self,
        file_io: &Arc<dyn FileIO>,
        path: &Path,
        row_type: &RowType,
        predicates: &[Predicate],
    ) -> Result<FormatReader, ReadError>;
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    #[serde(rename = "k")]
    key: GenericRow,
    #[serde(rename = "s")]
    seq: u64,
    #[serde(rename = "r")]
    kind: RowKind,
    #[serde(rename = "v")]
    value: GenericRow,
}

/// Line-delimited JSON format. Pushes leaf comparisons down to decode time
/// and refuses compound predicates, exercising the unpushed path.
#[derive(Default)]
pub struct JsonLinesFormat;

impl JsonLinesFormat {
    /// Shared instance.
    pub fn shared() -> Arc<dyn FileFormat> {
        Arc::new(JsonLinesFormat)
    }
}

#[async_trait]
impl FileFormat for JsonLinesFormat {
    async fn open(
        &self,
        file_io: &Arc<dyn FileIO>,
        path: &Path,
        row_type: &RowType,
        predicates: &[Predicate],
    ) -> Result<FormatReader, ReadError> {
        let (pushed, unpushed): (Vec<Predicate>, Vec<Predicate>) = predicates
            .iter()
            .cloned()
            .partition(|p| matches!(p, Predicate::Leaf(_)));

        let bytes = file_io.open_input(path).await?;
        let path_str = path.as_str().to_string();
        let row_type = row_type.clone();

        let mut records = Vec::new();
        for (position, line) in String::from_utf8_lossy(&bytes).lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let stored: StoredRecord =
                serde_json::from_str(line).map_err(|source| ReadError::Decode {
                    path: path_str.clone(),
                    source,
                })?;
            let kv = KeyValue::new(stored.key, stored.seq, stored.kind, stored.value);
            if pushed.iter().all(|p| p.test(&kv.value, &row_type)) {
                records.push(FileRecord {
                    position: position as u64,
                    kv,
                });
            }
        }

        Ok(FormatReader {
            records: stream::iter(records.into_iter().map(Ok)).boxed(),
            unpushed,
        })
    }
}

/// Serialize `records` (already key-sorted) into a data file and return its
/// metadata. The caller owns file naming and level assignment.
pub async fn write_data_file(
    file_io: &Arc<dyn FileIO>,
    path: &Path,
    file_name: &str,
    records: &[KeyValue],
    value_type: &RowType,
    level: u32,
    creation_time_millis: u64,
) -> Result<DataFileMeta, ReadError> {
    let mut payload = Vec::new();
    for kv in records {
        let stored = StoredRecord {
            key: kv.key.clone(),
            seq: kv.sequence,
            kind: kv.kind,
            value: kv.value.clone(),
        };
        let line = serde_json::to_string(&stored).map_err(|source| ReadError::Decode {
            path: path.as_str().to_string(),
            source,
        })?;
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
    }
    file_io.open_output(path, &payload, true).await?;

    let min_key = records.first().map(|kv| kv.key.clone()).unwrap_or_default();
    let max_key = records.last().map(|kv| kv.key.clone()).unwrap_or_default();
    let min_sequence = records.iter().map(|kv| kv.sequence).min().unwrap_or(0);
    let max_sequence = records.iter().map(|kv| kv.sequence).max().unwrap_or(0);

    let value_stats = value_type
        .fields()
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let mut min = None;
            let mut max = None;
            let mut null_count = 0;
            for kv in records {
                let cell = kv.value.get(i);
                if cell.is_null() {
                    null_count += 1;
                    continue;
                }
                if min.as_ref().map(|m| cell < m).unwrap_or(true) {
                    min = Some(cell.clone());
                }
                if max.as_ref().map(|m| cell > m).unwrap_or(true) {
                    max = Some(cell.clone());
                }
            }
            FieldStats {
                field: field.name.clone(),
                min,
                max,
                null_count,
            }
        })
        .collect();

    Ok(DataFileMeta {
        file_name: file_name.to_string(),
        file_size: payload.len() as u64,
        row_count: records.len() as u64,
        min_key,
        max_key,
        min_sequence,
        max_sequence,
        level,
        value_stats,
        creation_time_millis,
    })
}
