//! External merge sorting with bounded fan-in.
//!
//! [`MergeSorter`] builds the sort-merge reader for a section. When the run
//! count exceeds the spill threshold and an [`IOManager`] is present, excess
//! runs are pre-merged into spill files; the pre-merge preserves every record
//! (folding only happens once, at the final merge), so the merge function
//! still sees complete key groups.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use futures_util::{stream, StreamExt};
use tracing::debug;

use crate::{
    fs::{generate_file_id, FileIO, Path},
    mergetree::mergefn::ReducerMergeFunctionWrapper,
    ondisk::ReadError,
    record::{FieldsComparator, KeyValue, RowComparator},
    stream::{
        merge::{KeyValueHeapMerger, MergeContext, SortMergeReader},
        KeyValueStream, ReaderSupplier,
    },
};

/// Owns spill files for the readers of one table read. Spill paths are
/// tracked from creation; [`IOManager::close`] sweeps whatever a cancelled
/// read left behind, so no orphan spill files survive the reader.
pub struct IOManager {
    file_io: Arc<dyn FileIO>,
    spill_dir: Path,
    counter: AtomicU64,
    live: Mutex<HashSet<String>>,
}

impl IOManager {
    /// Bind to a spill directory.
    pub fn new(file_io: Arc<dyn FileIO>, spill_dir: Path) -> Arc<Self> {
        Arc::new(IOManager {
            file_io,
            spill_dir,
            counter: AtomicU64::new(0),
            live: Mutex::new(HashSet::new()),
        })
    }

    fn next_spill_path(&self) -> Path {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self
            .spill_dir
            .child(format!("spill-{n}-{}", generate_file_id()));
        self.live
            .lock()
            .expect("spill registry poisoned")
            .insert(path.as_str().to_string());
        path
    }

    async fn release(&self, path: &Path) -> Result<(), ReadError> {
        self.file_io.delete(path).await?;
        self.live
            .lock()
            .expect("spill registry poisoned")
            .remove(path.as_str());
        Ok(())
    }

    /// Number of spill files not yet released.
    pub fn live_spill_count(&self) -> usize {
        self.live.lock().expect("spill registry poisoned").len()
    }

    /// Delete every live spill file. Call when the read ends, completed or
    /// cancelled.
    pub async fn close(&self) -> Result<(), ReadError> {
        let paths: Vec<String> = self
            .live
            .lock()
            .expect("spill registry poisoned")
            .iter()
            .cloned()
            .collect();
        for path in paths {
            self.release(&Path::new(path)).await?;
        }
        Ok(())
    }
}

/// Builds section readers, spilling through the io manager when the fan-in
/// exceeds `spill_threshold`.
#[derive(Clone)]
pub struct MergeSorter {
    spill_threshold: usize,
    io_manager: Option<Arc<IOManager>>,
}

impl MergeSorter {
    /// Sorter with the given fan-in bound and no spill capability.
    pub fn new(spill_threshold: usize) -> Self {
        MergeSorter {
            spill_threshold: spill_threshold.max(2),
            io_manager: None,
        }
    }

    /// Inject the caller's io manager, enabling spill.
    pub fn set_io_manager(&mut self, io_manager: Arc<IOManager>) {
        self.io_manager = Some(io_manager);
    }

    /// The injected io manager, if any.
    pub fn io_manager(&self) -> Option<Arc<IOManager>> {
        self.io_manager.clone()
    }

    /// Open every run reader and build the merged, folded stream for one
    /// section.
    pub async fn merge_sort(
        &self,
        suppliers: Vec<ReaderSupplier>,
        key_comparator: RowComparator,
        uds: Option<FieldsComparator>,
        sequence_ascending: bool,
        wrapper: ReducerMergeFunctionWrapper,
    ) -> Result<KeyValueStream, ReadError> {
        let mut streams = Vec::with_capacity(suppliers.len());
        for supplier in suppliers {
            streams.push(supplier().await?);
        }

        if let Some(io_manager) = &self.io_manager {
            while streams.len() > self.spill_threshold {
                let batch: Vec<KeyValueStream> =
                    streams.drain(..self.spill_threshold).collect();
                let ctx = MergeContext::new(
                    key_comparator.clone(),
                    uds.clone(),
                    sequence_ascending,
                );
                let spilled = self
                    .spill_merge(io_manager, batch, ctx)
                    .await?;
                streams.push(spilled);
            }
        }

        let ctx = MergeContext::new(key_comparator, uds, sequence_ascending);
        Ok(SortMergeReader::new(streams, ctx, wrapper).into_stream())
    }

    /// Raw-merge `batch` into one spill file and return a reader over it.
    async fn spill_merge(
        &self,
        io_manager: &Arc<IOManager>,
        batch: Vec<KeyValueStream>,
        ctx: Arc<MergeContext>,
    ) -> Result<KeyValueStream, ReadError> {
        let mut merger = KeyValueHeapMerger::new(batch, ctx);
        let mut payload = Vec::new();
        let mut count = 0u64;
        while let Some(kv) = merger.next().await.transpose()? {
            let line = serde_json::to_string(&kv).map_err(|source| ReadError::Decode {
                path: "<spill>".to_string(),
                source,
            })?;
            payload.extend_from_slice(line.as_bytes());
            payload.push(b'\n');
            count += 1;
        }

        let path = io_manager.next_spill_path();
        io_manager
            .file_io
            .open_output(&path, &payload, true)
            .await?;
        debug!(spill = %path, records = count, "spilled merge pass");

        let bytes = io_manager.file_io.open_input(&path).await?;
        let path_str = path.as_str().to_string();
        let mut records = Vec::with_capacity(count as usize);
        for line in String::from_utf8_lossy(&bytes).lines() {
            if line.trim().is_empty() {
                continue;
            }
            let kv: KeyValue =
                serde_json::from_str(line).map_err(|source| ReadError::Decode {
                    path: path_str.clone(),
                    source,
                })?;
            records.push(kv);
        }

        // Release the spill as soon as its reader drains.
        let io_manager = io_manager.clone();
        let reader = stream::unfold(
            (records.into_iter(), Some((io_manager, path))),
            |(mut records, mut cleanup)| async move {
                match records.next() {
                    Some(kv) => Some((Ok(kv), (records, cleanup))),
                    None => {
                        if let Some((io_manager, path)) = cleanup.take() {
                            if let Err(e) = io_manager.release(&path).await {
                                return Some((Err(e), (records, cleanup)));
                            }
                        }
                        None
                    }
                }
            },
        )
        .boxed();
        Ok(reader)
    }
}
