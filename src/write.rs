//! Minimal buffering writer: rows in, sealed level-0 data files and commit
//! messages out.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{
    commit::CommitMessage,
    fs::{generate_file_id, FileIO, Path},
    ondisk::{format::write_data_file, DataFilePathFactory, ReadError},
    partition::{expire::Clock, Partition, PartitionCodec},
    record::{GenericRow, KeyValue, RowComparator, RowKind, RowType},
    schema::TableSchema,
};

/// Buffers rows per (partition, bucket) and seals them into data files at
/// prepare time. Sequence numbers are writer-scoped and monotonic.
pub struct TableWrite {
    file_io: Arc<dyn FileIO>,
    table_path: Path,
    value_type: RowType,
    partition_codec: PartitionCodec,
    partition_indices: Vec<usize>,
    key_indices: Vec<usize>,
    key_comparator: RowComparator,
    num_buckets: usize,
    clock: Clock,
    sequence: u64,
    buffers: HashMap<(Partition, i32), Vec<KeyValue>>,
}

impl TableWrite {
    /// Build a writer over `schema`.
    pub fn new(
        file_io: Arc<dyn FileIO>,
        table_path: Path,
        schema: &TableSchema,
        key_comparator: RowComparator,
        num_buckets: usize,
        clock: Clock,
    ) -> Self {
        let row_type = schema.logical_row_type();
        let partition_indices = row_type.field_indices(&schema.partition_keys);
        let key_indices = row_type.field_indices(&schema.trimmed_primary_keys());
        TableWrite {
            file_io,
            table_path,
            value_type: row_type,
            partition_codec: PartitionCodec::new(schema.partition_type()),
            partition_indices,
            key_indices,
            key_comparator,
            num_buckets: num_buckets.max(1),
            clock,
            sequence: 0,
            buffers: HashMap::new(),
        }
    }

    /// Buffer an insert.
    pub fn write(&mut self, row: GenericRow) {
        self.write_kind(RowKind::Insert, row);
    }

    /// Buffer a row with an explicit kind.
    pub fn write_kind(&mut self, kind: RowKind, row: GenericRow) {
        let partition_row = row.project(&self.partition_indices);
        let partition = self.partition_codec.to_partition(&partition_row);
        let key = if self.key_indices.is_empty() {
            // Tables without primary keys fall back to whole-row keys.
            row.clone()
        } else {
            row.project(&self.key_indices)
        };
        let bucket = self.bucket_of(&key);
        self.sequence += 1;
        let kv = KeyValue::new(key, self.sequence, kind, row);
        self.buffers.entry((partition, bucket)).or_default().push(kv);
    }

    fn bucket_of(&self, key: &GenericRow) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.num_buckets as u64) as i32
    }

    /// Seal every buffer into a data file and return the commit messages.
    /// The writer can keep writing afterwards; sequence numbers continue.
    pub async fn prepare_commit(&mut self) -> Result<Vec<CommitMessage>, ReadError> {
        let mut messages = Vec::new();
        let buffers = std::mem::take(&mut self.buffers);
        let now_millis = {
            let now = (self.clock)();
            now.and_utc().timestamp_millis().max(0) as u64
        };
        for ((partition, bucket), mut records) in buffers {
            let comparator = self.key_comparator.clone();
            records.sort_by(|a, b| {
                comparator(&a.key, &b.key).then_with(|| a.sequence.cmp(&b.sequence))
            });

            let path_factory = DataFilePathFactory::new(&self.table_path, &partition, bucket);
            let file_name = format!("data-{}.jsonl", generate_file_id());
            let meta = write_data_file(
                &self.file_io,
                &path_factory.to_path(&file_name),
                &file_name,
                &records,
                &self.value_type,
                0,
                now_millis,
            )
            .await?;
            messages.push(CommitMessage::for_new_files(
                partition,
                bucket,
                self.num_buckets as i32,
                vec![meta],
            ));
        }
        messages.sort_by(|a, b| a.partition.cmp(&b.partition).then(a.bucket.cmp(&b.bucket)));
        Ok(messages)
    }
}
