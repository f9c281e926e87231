//! Split read façade.
//!
//! Dispatches a [`DataSplit`] to the merge or no-merge path and keeps the
//! projection arithmetic honest: merging needs whole keys and whatever value
//! fields the merge function and sequence ordering require, so the caller's
//! projection is split into a pushdown part (applied in file readers) and an
//! outer part (applied after merging).

pub mod split;

use std::{collections::HashSet, sync::Arc};

use crate::{
    deletion::{DeletionFile, DeletionVectorFactory},
    mergetree::{
        interval::IntervalPartition,
        mergefn::{MergeFunctionFactory, ReducerMergeFunctionWrapper},
        SortedRun,
    },
    ondisk::{
        meta::DataFileMeta,
        reader::{KeyValueFileReaderFactory, KeyValueFileReaderFactoryBuilder},
        ReadError,
    },
    partition::Partition,
    predicate::{contains_fields, split_and, Predicate},
    record::{FieldsComparator, RowComparator, RowType},
    schema::TableSchema,
    sort::{IOManager, MergeSorter},
    stream::{self, KeyValueStream, ReaderSupplier},
};

pub use split::{DataSplit, POSTPONE_BUCKET};

/// Point-in-time reader over LSM splits with merge semantics.
pub struct MergeFileSplitRead {
    schema: TableSchema,
    factory_builder: KeyValueFileReaderFactoryBuilder,
    key_comparator: RowComparator,
    mf_factory: Arc<dyn MergeFunctionFactory>,
    merge_sorter: MergeSorter,
    sequence_fields: Vec<String>,
    sequence_ascending: bool,
    read_key_type: Option<RowType>,
    filters_for_keys: Option<Vec<Predicate>>,
    filters_for_all: Option<Vec<Predicate>>,
    pushdown_projection: Option<Vec<usize>>,
    outer_projection: Option<Vec<usize>>,
    force_keep_delete: bool,
}

impl MergeFileSplitRead {
    /// Build a read over `schema`.
    pub fn new(
        schema: TableSchema,
        factory_builder: KeyValueFileReaderFactoryBuilder,
        key_comparator: RowComparator,
        mf_factory: Arc<dyn MergeFunctionFactory>,
        merge_sorter: MergeSorter,
        sequence_fields: Vec<String>,
        sequence_ascending: bool,
    ) -> Self {
        MergeFileSplitRead {
            schema,
            factory_builder,
            key_comparator,
            mf_factory,
            merge_sorter,
            sequence_fields,
            sequence_ascending,
            read_key_type: None,
            filters_for_keys: None,
            filters_for_all: None,
            pushdown_projection: None,
            outer_projection: None,
            force_keep_delete: false,
        }
    }

    /// The key comparator in use.
    pub fn key_comparator(&self) -> RowComparator {
        self.key_comparator.clone()
    }

    /// Project emitted keys to `read_key_type`. Applied after merging.
    pub fn with_read_key_type(mut self, read_key_type: RowType) -> Self {
        self.factory_builder.with_read_key_type(&read_key_type);
        self.read_key_type = Some(read_key_type);
        self
    }

    /// Restrict emitted value fields to `read_type`. Any configured sequence
    /// field missing from the projection is read anyway (the merge order
    /// depends on it) and trimmed back out of the final rows.
    pub fn with_read_type(mut self, read_type: &RowType) -> Self {
        let table_row_type = self.schema.logical_row_type();
        let requested: Vec<usize> = table_row_type.field_indices(&read_type.field_names());
        let base_len = requested.len();

        let mut projected = requested;
        if !self.sequence_fields.is_empty() {
            let projected_names: HashSet<&str> = projected
                .iter()
                .map(|&i| table_row_type.fields()[i].name.as_str())
                .collect();
            let lacking: Vec<usize> = self
                .sequence_fields
                .iter()
                .filter(|f| !projected_names.contains(f.as_str()))
                .filter_map(|f| table_row_type.field_index(f))
                .collect();
            projected.extend(lacking);
        }
        let completed = projected.len() > base_len;

        let adjusted = self.mf_factory.adjust_projection(Some(&projected));
        self.pushdown_projection = adjusted.pushdown;
        self.outer_projection = adjusted.outer;
        if let Some(pushdown) = &self.pushdown_projection {
            self.factory_builder
                .with_read_value_projection(Some(pushdown.clone()));
        }

        if completed {
            // Trim the completed sequence fields back out.
            match &mut self.outer_projection {
                None => self.outer_projection = Some((0..base_len).collect()),
                Some(outer) => outer.truncate(base_len),
            }
        }
        self
    }

    /// Install a filter. The conjunction is split: conjuncts touching only
    /// primary-key columns may be pushed into any section, the rest only into
    /// non-overlapping sections. In an overlapping section a value predicate
    /// could drop a row that a newer record would have superseded, so those
    /// stay key-only.
    pub fn with_filter(mut self, predicate: &Predicate) -> Self {
        let primary_keys = self.schema.trimmed_primary_keys();
        let non_primary: HashSet<String> = self
            .schema
            .field_names()
            .into_iter()
            .filter(|name| !primary_keys.contains(name))
            .collect();

        let mut all = Vec::new();
        let mut key_only: Option<Vec<Predicate>> = None;
        for sub in split_and(predicate) {
            if !contains_fields(&sub, &non_primary) {
                key_only.get_or_insert_with(Vec::new).push(sub.clone());
            }
            all.push(sub);
        }
        self.filters_for_all = Some(all);
        self.filters_for_keys = key_only;
        self
    }

    /// Keep DELETE records in the output (changelog consumers).
    pub fn force_keep_delete(mut self) -> Self {
        self.force_keep_delete = true;
        self
    }

    /// Inject the spill io manager.
    pub fn with_io_manager(mut self, io_manager: Arc<IOManager>) -> Self {
        self.merge_sorter.set_io_manager(io_manager);
        self
    }

    /// Open a reader for `split`.
    pub async fn create_reader(&self, split: &DataSplit) -> Result<KeyValueStream, ReadError> {
        if !split.before_files.is_empty() {
            return Err(ReadError::InvalidSplit(
                "this read cannot accept a split with before files".to_string(),
            ));
        }
        if split.is_streaming || split.bucket == POSTPONE_BUCKET {
            self.create_no_merge_reader(
                &split.partition,
                split.bucket,
                &split.data_files,
                split.deletion_files.as_deref(),
                split.is_streaming,
            )
            .await
        } else {
            self.create_merge_reader(
                &split.partition,
                split.bucket,
                &split.data_files,
                split.deletion_files.as_deref(),
                self.force_keep_delete,
            )
            .await
        }
    }

    /// Merge path: sections are sort-merged with complete keys; key and outer
    /// projections apply after merging.
    pub async fn create_merge_reader(
        &self,
        partition: &Partition,
        bucket: i32,
        files: &[DataFileMeta],
        deletion_files: Option<&[Option<DeletionFile>]>,
        keep_delete: bool,
    ) -> Result<KeyValueStream, ReadError> {
        let dv_factory =
            DeletionVectorFactory::new(self.factory_builder.file_io(), files, deletion_files);
        // Keys are never projected before merging or the sort order breaks.
        let overlapped: Arc<KeyValueFileReaderFactory> = Arc::new(self.factory_builder.build(
            partition,
            bucket,
            dv_factory.clone(),
            false,
            self.filters_for_keys.clone(),
        ));
        let non_overlapped: Arc<KeyValueFileReaderFactory> = Arc::new(self.factory_builder.build(
            partition,
            bucket,
            dv_factory,
            false,
            self.filters_for_all.clone(),
        ));

        let uds = self.create_uds_comparator();
        let sections =
            IntervalPartition::new(files.to_vec(), self.key_comparator.clone()).partition();
        let mut section_suppliers: Vec<ReaderSupplier> = Vec::with_capacity(sections.len());
        for section in sections {
            let factory = if section.len() > 1 {
                overlapped.clone()
            } else {
                non_overlapped.clone()
            };
            let sorter = self.merge_sorter.clone();
            let key_comparator = self.key_comparator.clone();
            let uds = uds.clone();
            let sequence_ascending = self.sequence_ascending;
            let wrapper = ReducerMergeFunctionWrapper::new(
                self.mf_factory.create(self.pushdown_projection.as_deref()),
            );
            section_suppliers.push(Box::new(move || {
                Box::pin(async move {
                    let run_suppliers = section
                        .into_iter()
                        .map(|run| run_supplier(run, factory.clone()))
                        .collect();
                    sorter
                        .merge_sort(run_suppliers, key_comparator, uds, sequence_ascending, wrapper)
                        .await
                })
            }));
        }

        let mut reader = stream::concat(section_suppliers);
        if !keep_delete {
            reader = stream::drop_delete(reader);
        }
        reader = self.project_key(reader);
        Ok(self.project_outer(reader))
    }

    /// No-merge path: plain concatenation in file order, used by streaming
    /// consumers and postponed buckets.
    pub async fn create_no_merge_reader(
        &self,
        partition: &Partition,
        bucket: i32,
        files: &[DataFileMeta],
        deletion_files: Option<&[Option<DeletionFile>]>,
        only_filter_key: bool,
    ) -> Result<KeyValueStream, ReadError> {
        let dv_factory =
            DeletionVectorFactory::new(self.factory_builder.file_io(), files, deletion_files);
        let filters = if only_filter_key {
            self.filters_for_keys.clone()
        } else {
            self.filters_for_all.clone()
        };
        let factory: Arc<KeyValueFileReaderFactory> =
            Arc::new(
                self.factory_builder
                    .build(partition, bucket, dv_factory, true, filters),
            );

        let suppliers: Vec<ReaderSupplier> = files
            .iter()
            .cloned()
            .map(|file| {
                let factory = factory.clone();
                let supplier: ReaderSupplier =
                    Box::new(move || Box::pin(async move { factory.open(&file).await }));
                supplier
            })
            .collect();
        Ok(self.project_outer(stream::concat(suppliers)))
    }

    /// The user-defined sequence comparator, resolved against the value row
    /// type file readers actually materialize.
    pub fn create_uds_comparator(&self) -> Option<FieldsComparator> {
        FieldsComparator::create(
            &self.factory_builder.read_value_type(),
            &self.sequence_fields,
            self.sequence_ascending,
        )
    }

    fn project_key(&self, reader: KeyValueStream) -> KeyValueStream {
        match &self.read_key_type {
            None => reader,
            Some(read_key_type) => {
                let indices = self
                    .schema
                    .key_type()
                    .field_indices(&read_key_type.field_names());
                stream::project_key(reader, indices)
            }
        }
    }

    fn project_outer(&self, reader: KeyValueStream) -> KeyValueStream {
        match &self.outer_projection {
            None => reader,
            Some(outer) => stream::project_value(reader, outer.clone()),
        }
    }
}

fn run_supplier(run: SortedRun, factory: Arc<KeyValueFileReaderFactory>) -> ReaderSupplier {
    Box::new(move || {
        Box::pin(async move {
            let file_suppliers: Vec<ReaderSupplier> = run
                .into_files()
                .into_iter()
                .map(|file| {
                    let factory = factory.clone();
                    let supplier: ReaderSupplier =
                        Box::new(move || Box::pin(async move { factory.open(&file).await }));
                    supplier
                })
                .collect();
            Ok(stream::concat(file_suppliers))
        })
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        fs::{memory::InMemoryFileIO, FileIO, Path},
        mergetree::mergefn::DeduplicateMergeFunctionFactory,
        ondisk::{
            format::{write_data_file, JsonLinesFormat},
            DataFilePathFactory,
        },
        predicate::PredicateBuilder,
        record::{
            default_key_comparator, DataField, DataType, GenericRow, KeyValue, RowKind, Value,
        },
        stream::collect,
    };

    fn schema() -> TableSchema {
        TableSchema {
            id: 0,
            fields: vec![
                DataField::new(0, "k", DataType::String),
                DataField::new(1, "v", DataType::Int),
                DataField::new(2, "ts", DataType::Int),
            ],
            partition_keys: vec![],
            primary_keys: vec!["k".to_string()],
            options: HashMap::new(),
        }
    }

    fn kv(key: &str, seq: u64, v: i64, ts: i64) -> KeyValue {
        KeyValue::new(
            GenericRow::of([key]),
            seq,
            RowKind::Insert,
            GenericRow::new(vec![
                Value::String(key.into()),
                Value::Int(v),
                Value::Int(ts),
            ]),
        )
    }

    fn delete(key: &str, seq: u64) -> KeyValue {
        KeyValue::new(
            GenericRow::of([key]),
            seq,
            RowKind::Delete,
            GenericRow::new(vec![Value::String(key.into()), Value::Null, Value::Null]),
        )
    }

    async fn seal(
        io: &Arc<dyn FileIO>,
        name: &str,
        records: Vec<KeyValue>,
    ) -> DataFileMeta {
        seal_in_bucket(io, name, records, 0).await
    }

    async fn seal_in_bucket(
        io: &Arc<dyn FileIO>,
        name: &str,
        records: Vec<KeyValue>,
        bucket: i32,
    ) -> DataFileMeta {
        let path_factory = DataFilePathFactory::new(&Path::new("t"), &Partition::default(), bucket);
        write_data_file(
            io,
            &path_factory.to_path(name),
            name,
            &records,
            &schema().logical_row_type(),
            0,
            0,
        )
        .await
        .unwrap()
    }

    fn read(io: Arc<dyn FileIO>, sequence_fields: Vec<String>) -> MergeFileSplitRead {
        let builder = KeyValueFileReaderFactoryBuilder::new(
            io,
            JsonLinesFormat::shared(),
            Path::new("t"),
            &schema(),
        );
        MergeFileSplitRead::new(
            schema(),
            builder,
            default_key_comparator(),
            Arc::new(DeduplicateMergeFunctionFactory),
            MergeSorter::new(64),
            sequence_fields,
            true,
        )
    }

    #[tokio::test]
    async fn empty_split_yields_empty_reader() {
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        let read = read(io, vec![]);
        let split = DataSplit::new(Partition::default(), 0, vec![]);
        let out = collect(read.create_reader(&split).await.unwrap())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn before_files_are_rejected() {
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        let file = seal(&io, "b.jsonl", vec![kv("a", 1, 1, 1)]).await;
        let read = read(io, vec![]);
        let mut split = DataSplit::new(Partition::default(), 0, vec![]);
        split.before_files = vec![file];
        let err = match read.create_reader(&split).await {
            Err(e) => e,
            Ok(_) => panic!("expected create_reader to fail"),
        };
        assert!(matches!(err, ReadError::InvalidSplit(_)));
    }

    #[tokio::test]
    async fn merge_reader_dedups_and_drops_deletes() {
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        let f1 = seal(
            &io,
            "f1.jsonl",
            vec![kv("a", 1, 10, 0), kv("b", 2, 20, 0), kv("c", 3, 30, 0)],
        )
        .await;
        let f2 = seal(&io, "f2.jsonl", vec![kv("a", 4, 11, 0), delete("b", 5)]).await;

        let read = read(io, vec![]);
        let split = DataSplit::new(Partition::default(), 0, vec![f1, f2]);
        let out = collect(read.create_reader(&split).await.unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, GenericRow::of(["a"]));
        assert_eq!(out[0].value.get(1), &Value::Int(11));
        assert_eq!(out[1].key, GenericRow::of(["c"]));
    }

    #[tokio::test]
    async fn force_keep_delete_retains_tombstones() {
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        let f1 = seal(&io, "f1.jsonl", vec![kv("b", 2, 20, 0)]).await;
        let f2 = seal(&io, "f2.jsonl", vec![delete("b", 5)]).await;

        let read = read(io, vec![]).force_keep_delete();
        let split = DataSplit::new(Partition::default(), 0, vec![f1, f2]);
        let out = collect(read.create_reader(&split).await.unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, RowKind::Delete);
    }

    #[tokio::test]
    async fn overlap_aware_pushdown_keeps_superseded_rows() {
        // Two runs cover the same key range; run A holds (1, k1, 100) and
        // run B holds (3, k1, 10). With filter v >= 100 the merge must still
        // emit (k1, 10): B supersedes A, so the value filter must not reach
        // the file readers of this overlapping section.
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        let run_a = seal(
            &io,
            "a.jsonl",
            vec![kv("k1", 1, 100, 0), kv("k2", 2, 200, 0)],
        )
        .await;
        let run_b = seal(&io, "b.jsonl", vec![kv("k1", 3, 10, 0), kv("k2", 4, 20, 0)]).await;

        let rt = schema().logical_row_type();
        let filter = PredicateBuilder::new(&rt).greater_or_equal("v", 100_i64);
        let read = read(io, vec![]).with_filter(&filter);
        let split = DataSplit::new(Partition::default(), 0, vec![run_a, run_b]);
        let out = collect(read.create_reader(&split).await.unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value.get(1), &Value::Int(10));
        assert_eq!(out[1].value.get(1), &Value::Int(20));
    }

    #[tokio::test]
    async fn value_filter_pushes_into_single_run_sections() {
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        // Disjoint ranges: two singleton sections.
        let f1 = seal(&io, "f1.jsonl", vec![kv("a", 1, 10, 0)]).await;
        let f2 = seal(&io, "f2.jsonl", vec![kv("z", 2, 100, 0)]).await;

        let rt = schema().logical_row_type();
        let filter = PredicateBuilder::new(&rt).greater_or_equal("v", 100_i64);
        let read = read(io, vec![]).with_filter(&filter);
        let split = DataSplit::new(Partition::default(), 0, vec![f1, f2]);
        let out = collect(read.create_reader(&split).await.unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, GenericRow::of(["z"]));
    }

    #[tokio::test]
    async fn sequence_field_completion_trims_back_out() {
        // Projection asks for {v} only while ts is the sequence field: ts is
        // read for ordering, the output rows still have exactly one column,
        // and the later ts wins regardless of sequence numbers.
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        let f1 = seal(&io, "f1.jsonl", vec![kv("k", 9, 1, 1)]).await;
        let f2 = seal(&io, "f2.jsonl", vec![kv("k", 1, 2, 5)]).await;

        let read_type = schema().logical_row_type().project_by_names(&["v"]);
        let read = read(io, vec!["ts".to_string()]).with_read_type(&read_type);
        let split = DataSplit::new(Partition::default(), 0, vec![f1, f2]);
        let out = collect(read.create_reader(&split).await.unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value.arity(), 1);
        assert_eq!(out[0].value.get(0), &Value::Int(2));
    }

    #[tokio::test]
    async fn streaming_split_bypasses_merge() {
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        let f1 = seal(&io, "f1.jsonl", vec![kv("a", 1, 10, 0)]).await;
        let f2 = seal(&io, "f2.jsonl", vec![kv("a", 2, 11, 0)]).await;

        let read = read(io, vec![]);
        let split = DataSplit::new(Partition::default(), 0, vec![f1, f2]).streaming();
        let out = collect(read.create_reader(&split).await.unwrap())
            .await
            .unwrap();
        // Both versions of "a" flow through unmerged, in file order.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sequence, 1);
        assert_eq!(out[1].sequence, 2);
    }

    #[tokio::test]
    async fn postpone_bucket_bypasses_merge() {
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        let f1 = seal_in_bucket(&io, "f1.jsonl", vec![kv("a", 1, 10, 0)], POSTPONE_BUCKET).await;
        let f2 = seal_in_bucket(&io, "f2.jsonl", vec![kv("a", 2, 11, 0)], POSTPONE_BUCKET).await;

        let read = read(io, vec![]);
        let split = DataSplit::new(Partition::default(), POSTPONE_BUCKET, vec![f1, f2]);
        let out = collect(read.create_reader(&split).await.unwrap())
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn read_key_type_projects_after_merge() {
        let io: Arc<dyn FileIO> = Arc::new(InMemoryFileIO::new());
        let f1 = seal(&io, "f1.jsonl", vec![kv("a", 1, 10, 0)]).await;

        let key_type = schema().key_type();
        let read = read(io, vec![]).with_read_key_type(key_type);
        let split = DataSplit::new(Partition::default(), 0, vec![f1]);
        let out = collect(read.create_reader(&split).await.unwrap())
            .await
            .unwrap();
        assert_eq!(out[0].key, GenericRow::of(["a"]));
    }
}
