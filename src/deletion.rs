//! Deletion vectors: per-file bitmaps of tombstoned row positions.
//!
//! A vector is immutable once published. Positions outside `[0, row_count)`
//! are ignored at application time. Vectors are applied after format-level
//! decoding and before any predicate evaluation.

use std::{collections::HashMap, sync::Arc};

use async_lock::Mutex;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::{
    fs::{FileIO, Path},
    ondisk::{meta::DataFileMeta, ReadError},
};

/// Bitmap of row positions to suppress within one data file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionVector {
    bitmap: RoaringBitmap,
}

impl DeletionVector {
    /// Empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Vector from explicit positions.
    pub fn from_positions(positions: impl IntoIterator<Item = u64>) -> Self {
        let mut bitmap = RoaringBitmap::new();
        for position in positions {
            if let Ok(position) = u32::try_from(position) {
                bitmap.insert(position);
            }
        }
        DeletionVector { bitmap }
    }

    /// Mark a row position deleted.
    pub fn delete(&mut self, position: u64) {
        if let Ok(position) = u32::try_from(position) {
            self.bitmap.insert(position);
        }
    }

    /// True when `position` is suppressed.
    pub fn is_deleted(&self, position: u64) -> bool {
        u32::try_from(position)
            .map(|p| self.bitmap.contains(p))
            .unwrap_or(false)
    }

    /// Number of suppressed positions.
    pub fn cardinality(&self) -> u64 {
        self.bitmap.len()
    }

    /// True when no position is suppressed.
    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// Serialize into the standard roaring byte layout.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bitmap.serialized_size());
        self.bitmap
            .serialize_into(&mut out)
            .expect("vec write is infallible");
        out
    }

    /// Deserialize from the standard roaring byte layout.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, String> {
        RoaringBitmap::deserialize_from(bytes)
            .map(|bitmap| DeletionVector { bitmap })
            .map_err(|e| e.to_string())
    }
}

/// Pointer from a data file to its serialized deletion vector: a byte range
/// within a shared deletion file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionFile {
    /// Path of the file holding the serialized bitmap.
    pub path: String,
    /// Byte offset of the bitmap.
    pub offset: u64,
    /// Byte length of the bitmap.
    pub length: u64,
}

/// Per-split factory resolving data files to their deletion vectors, with a
/// cache scoped to the lifetime of one read.
pub struct DeletionVectorFactory {
    file_io: Arc<dyn FileIO>,
    by_file: HashMap<String, DeletionFile>,
    cache: Mutex<HashMap<String, Arc<DeletionVector>>>,
}

impl DeletionVectorFactory {
    /// Build from a split's data files and the parallel deletion file list
    /// (`None` entries mean the file has no tombstones).
    pub fn new(
        file_io: Arc<dyn FileIO>,
        data_files: &[DataFileMeta],
        deletion_files: Option<&[Option<DeletionFile>]>,
    ) -> Arc<Self> {
        let mut by_file = HashMap::new();
        if let Some(deletion_files) = deletion_files {
            for (meta, deletion) in data_files.iter().zip(deletion_files.iter()) {
                if let Some(deletion) = deletion {
                    by_file.insert(meta.file_name.clone(), deletion.clone());
                }
            }
        }
        Arc::new(DeletionVectorFactory {
            file_io,
            by_file,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Factory with no tombstones at all.
    pub fn empty(file_io: Arc<dyn FileIO>) -> Arc<Self> {
        Arc::new(DeletionVectorFactory {
            file_io,
            by_file: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Vector for `file_name`, or `None` when the file has no tombstones.
    pub async fn create(
        &self,
        file_name: &str,
    ) -> Result<Option<Arc<DeletionVector>>, ReadError> {
        let Some(deletion_file) = self.by_file.get(file_name) else {
            return Ok(None);
        };

        let mut cache = self.cache.lock().await;
        if let Some(vector) = cache.get(file_name) {
            return Ok(Some(vector.clone()));
        }

        let bytes = self
            .file_io
            .open_input(&Path::new(deletion_file.path.clone()))
            .await?;
        let start = deletion_file.offset as usize;
        let end = start + deletion_file.length as usize;
        let slice = bytes
            .get(start..end)
            .ok_or_else(|| ReadError::DeletionVector {
                path: file_name.to_string(),
                message: format!(
                    "range {start}..{end} out of bounds for {} bytes",
                    bytes.len()
                ),
            })?;
        let vector = Arc::new(DeletionVector::deserialize(slice).map_err(|message| {
            ReadError::DeletionVector {
                path: file_name.to_string(),
                message,
            }
        })?);
        cache.insert(file_name.to_string(), vector.clone());
        Ok(Some(vector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::memory::InMemoryFileIO,
        record::GenericRow,
    };

    fn meta(name: &str) -> DataFileMeta {
        DataFileMeta {
            file_name: name.to_string(),
            file_size: 0,
            row_count: 10,
            min_key: GenericRow::of(["a"]),
            max_key: GenericRow::of(["z"]),
            min_sequence: 0,
            max_sequence: 9,
            level: 0,
            value_stats: vec![],
            creation_time_millis: 0,
        }
    }

    #[test]
    fn serialize_round_trip() {
        let vector = DeletionVector::from_positions([1, 3, 7]);
        let restored = DeletionVector::deserialize(&vector.serialize()).unwrap();
        assert_eq!(vector, restored);
        assert!(restored.is_deleted(3));
        assert!(!restored.is_deleted(2));
        assert_eq!(restored.cardinality(), 3);
    }

    #[test]
    fn out_of_u32_positions_are_ignored() {
        let vector = DeletionVector::from_positions([u64::MAX]);
        assert!(vector.is_empty());
        assert!(!vector.is_deleted(u64::MAX));
    }

    #[tokio::test]
    async fn factory_resolves_ranges_and_caches() {
        let io = Arc::new(InMemoryFileIO::new());
        let v1 = DeletionVector::from_positions([0]);
        let v2 = DeletionVector::from_positions([5, 6]);
        let (b1, b2) = (v1.serialize(), v2.serialize());
        let mut combined = b1.clone();
        combined.extend_from_slice(&b2);
        io.open_output(&Path::new("t/index/dv-1"), &combined, true)
            .await
            .unwrap();

        let files = vec![meta("data-a"), meta("data-b"), meta("data-c")];
        let deletions = vec![
            Some(DeletionFile {
                path: "t/index/dv-1".to_string(),
                offset: 0,
                length: b1.len() as u64,
            }),
            Some(DeletionFile {
                path: "t/index/dv-1".to_string(),
                offset: b1.len() as u64,
                length: b2.len() as u64,
            }),
            None,
        ];
        let factory = DeletionVectorFactory::new(io, &files, Some(&deletions));

        let loaded = factory.create("data-a").await.unwrap().unwrap();
        assert!(loaded.is_deleted(0));
        let loaded = factory.create("data-b").await.unwrap().unwrap();
        assert!(loaded.is_deleted(6));
        assert!(factory.create("data-c").await.unwrap().is_none());

        // Second lookup is served from cache (same Arc).
        let again = factory.create("data-a").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(
            &again,
            &factory.create("data-a").await.unwrap().unwrap()
        ));
    }
}
