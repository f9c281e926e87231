//! K-way sort-merge over sorted-run readers.
//!
//! [`KeyValueHeapMerger`] interleaves any number of key-ordered streams into
//! one globally ordered stream; [`SortMergeReader`] folds each same-key group
//! through a merge-function wrapper. Within a key, records are ordered by the
//! user-defined sequence comparator when configured, else by sequence number
//! in the configured direction; ties resolve by physical order so the
//! later-appended record wins.

use std::{cmp::Ordering, collections::BinaryHeap, sync::Arc};

use futures_util::{stream, StreamExt};

use crate::{
    mergetree::mergefn::ReducerMergeFunctionWrapper,
    ondisk::ReadError,
    record::{FieldsComparator, KeyValue, RowComparator},
    stream::KeyValueStream,
};

/// Ordering context shared by every heap entry.
pub struct MergeContext {
    key_comparator: RowComparator,
    uds: Option<FieldsComparator>,
    sequence_ascending: bool,
}

impl MergeContext {
    /// Build a context. `uds` replaces the sequence number for within-key
    /// ordering when present; `sequence_ascending` is the configured
    /// direction for the sequence-number fallback.
    pub fn new(
        key_comparator: RowComparator,
        uds: Option<FieldsComparator>,
        sequence_ascending: bool,
    ) -> Arc<Self> {
        Arc::new(MergeContext {
            key_comparator,
            uds,
            sequence_ascending,
        })
    }

    /// Compare two record keys.
    pub fn compare_keys(&self, a: &KeyValue, b: &KeyValue) -> Ordering {
        (self.key_comparator)(&a.key, &b.key)
    }

    fn within_key(&self, a: &KeyValue, b: &KeyValue) -> Ordering {
        let primary = match &self.uds {
            Some(uds) => uds.compare(&a.value, &b.value),
            None => {
                let ord = a.sequence.cmp(&b.sequence);
                if self.sequence_ascending {
                    ord
                } else {
                    ord.reverse()
                }
            }
        };
        // Physical tie-break: larger sequence appended later, and later
        // records must reach the reducer last.
        primary.then_with(|| a.sequence.cmp(&b.sequence))
    }
}

struct HeapEntry {
    kv: KeyValue,
    source: usize,
    ctx: Arc<MergeContext>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ctx
            .compare_keys(&self.kv, &other.kv)
            .then_with(|| self.ctx.within_key(&self.kv, &other.kv))
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

/// Raw k-way merge: emits every input record in global (key, within-key)
/// order without folding. Spill passes use this directly.
pub struct KeyValueHeapMerger {
    streams: Vec<KeyValueStream>,
    heap: BinaryHeap<HeapEntry>,
    ctx: Arc<MergeContext>,
    initialized: bool,
}

impl KeyValueHeapMerger {
    /// Merge `streams`, each already ordered by the context's key comparator.
    pub fn new(streams: Vec<KeyValueStream>, ctx: Arc<MergeContext>) -> Self {
        let heap = BinaryHeap::with_capacity(streams.len());
        KeyValueHeapMerger {
            streams,
            heap,
            ctx,
            initialized: false,
        }
    }

    /// Pull the next record in global order.
    pub async fn next(&mut self) -> Option<Result<KeyValue, ReadError>> {
        if !self.initialized {
            self.initialized = true;
            for source in 0..self.streams.len() {
                if let Err(e) = self.refill(source).await {
                    return Some(Err(e));
                }
            }
        }
        let entry = self.heap.pop()?;
        if let Err(e) = self.refill(entry.source).await {
            return Some(Err(e));
        }
        Some(Ok(entry.kv))
    }

    async fn refill(&mut self, source: usize) -> Result<(), ReadError> {
        match self.streams[source].next().await {
            Some(Ok(kv)) => {
                self.heap.push(HeapEntry {
                    kv,
                    source,
                    ctx: self.ctx.clone(),
                });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    /// Adapt into a [`KeyValueStream`].
    pub fn into_stream(self) -> KeyValueStream {
        stream::unfold(self, |mut merger| async move {
            merger.next().await.map(|item| (item, merger))
        })
        .boxed()
    }
}

/// Sort-merge reader: groups same-key records and folds each group through
/// the merge-function wrapper.
pub struct SortMergeReader {
    merger: KeyValueHeapMerger,
    wrapper: ReducerMergeFunctionWrapper,
    ctx: Arc<MergeContext>,
    pending: Option<KeyValue>,
}

impl SortMergeReader {
    /// Merge `streams` and fold groups with `wrapper`.
    pub fn new(
        streams: Vec<KeyValueStream>,
        ctx: Arc<MergeContext>,
        wrapper: ReducerMergeFunctionWrapper,
    ) -> Self {
        SortMergeReader {
            merger: KeyValueHeapMerger::new(streams, ctx.clone()),
            wrapper,
            ctx,
            pending: None,
        }
    }

    /// Pull the next folded record.
    pub async fn next(&mut self) -> Option<Result<KeyValue, ReadError>> {
        loop {
            let first = match self.pending.take() {
                Some(kv) => kv,
                None => match self.merger.next().await? {
                    Ok(kv) => kv,
                    Err(e) => return Some(Err(e)),
                },
            };

            self.wrapper.reset();
            let group_key = first.clone();
            self.wrapper.add(first);

            loop {
                match self.merger.next().await {
                    None => break,
                    Some(Err(e)) => return Some(Err(e)),
                    Some(Ok(kv)) => {
                        if self.ctx.compare_keys(&kv, &group_key) == Ordering::Equal {
                            self.wrapper.add(kv);
                        } else {
                            self.pending = Some(kv);
                            break;
                        }
                    }
                }
            }

            if let Some(out) = self.wrapper.result() {
                return Some(Ok(out));
            }
            // Group folded to nothing; move on to the next key.
        }
    }

    /// Adapt into a [`KeyValueStream`].
    pub fn into_stream(self) -> KeyValueStream {
        stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|item| (item, reader))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mergetree::mergefn::DeduplicateMergeFunction,
        record::{default_key_comparator, DataField, DataType, GenericRow, RowKind, RowType, Value},
        stream::{collect, from_vec},
    };

    fn kv(key: &str, seq: u64, v: i64) -> KeyValue {
        KeyValue::new(
            GenericRow::of([key]),
            seq,
            RowKind::Insert,
            GenericRow::new(vec![Value::String(key.into()), Value::Int(v)]),
        )
    }

    fn dedup_reader(streams: Vec<KeyValueStream>, ctx: Arc<MergeContext>) -> SortMergeReader {
        SortMergeReader::new(
            streams,
            ctx,
            ReducerMergeFunctionWrapper::new(Box::new(DeduplicateMergeFunction::default())),
        )
    }

    #[tokio::test]
    async fn merges_runs_in_key_order() {
        let ctx = MergeContext::new(default_key_comparator(), None, true);
        let reader = dedup_reader(
            vec![
                from_vec(vec![kv("b", 1, 1), kv("d", 2, 2)]),
                from_vec(vec![kv("a", 3, 3), kv("c", 4, 4)]),
            ],
            ctx,
        );
        let out = collect(reader.into_stream()).await.unwrap();
        let keys: Vec<String> = out.iter().map(|kv| kv.key.get(0).to_string()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn each_key_appears_once_and_larger_seq_wins() {
        let ctx = MergeContext::new(default_key_comparator(), None, true);
        let reader = dedup_reader(
            vec![
                from_vec(vec![kv("k1", 1, 100), kv("k2", 2, 200)]),
                from_vec(vec![kv("k1", 3, 10), kv("k2", 4, 20)]),
            ],
            ctx,
        );
        let out = collect(reader.into_stream()).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value.get(1), &Value::Int(10));
        assert_eq!(out[1].value.get(1), &Value::Int(20));
    }

    #[tokio::test]
    async fn storage_order_does_not_change_result() {
        let ctx = MergeContext::new(default_key_comparator(), None, true);
        let forward = dedup_reader(
            vec![
                from_vec(vec![kv("k", 1, 100)]),
                from_vec(vec![kv("k", 3, 10)]),
            ],
            ctx.clone(),
        );
        let ctx2 = MergeContext::new(default_key_comparator(), None, true);
        let swapped = dedup_reader(
            vec![
                from_vec(vec![kv("k", 3, 10)]),
                from_vec(vec![kv("k", 1, 100)]),
            ],
            ctx2,
        );
        let a = collect(forward.into_stream()).await.unwrap();
        let b = collect(swapped.into_stream()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].value.get(1), &Value::Int(10));
    }

    #[tokio::test]
    async fn descending_sequence_order_prefers_smaller_seq() {
        let ctx = MergeContext::new(default_key_comparator(), None, false);
        let reader = dedup_reader(
            vec![
                from_vec(vec![kv("k", 1, 100)]),
                from_vec(vec![kv("k", 3, 10)]),
            ],
            ctx,
        );
        let out = collect(reader.into_stream()).await.unwrap();
        // Descending order feeds seq 3 first, so seq 1 reaches the reducer
        // last and wins.
        assert_eq!(out[0].value.get(1), &Value::Int(100));
    }

    #[tokio::test]
    async fn uds_overrides_sequence_number() {
        let value_type = RowType::new(vec![
            DataField::new(0, "k", DataType::String),
            DataField::new(1, "ts", DataType::Int),
        ]);
        let uds = FieldsComparator::create(&value_type, &["ts".to_string()], true);
        let ctx = MergeContext::new(default_key_comparator(), uds, true);
        // Sequence numbers disagree with the ts field.
        let reader = dedup_reader(
            vec![
                from_vec(vec![kv("k", 9, 1)]),
                from_vec(vec![kv("k", 1, 5)]),
            ],
            ctx,
        );
        let out = collect(reader.into_stream()).await.unwrap();
        // ts = 5 is the highest user-defined sequence: it wins despite seq 1.
        assert_eq!(out[0].value.get(1), &Value::Int(5));
    }

    #[tokio::test]
    async fn delete_groups_can_fold_to_nothing() {
        struct DropAll;
        impl crate::mergetree::mergefn::MergeFunction for DropAll {
            fn reset(&mut self) {}
            fn add(&mut self, _: KeyValue) {}
            fn result(&mut self) -> Option<KeyValue> {
                None
            }
        }
        let ctx = MergeContext::new(default_key_comparator(), None, true);
        let reader = SortMergeReader::new(
            vec![
                from_vec(vec![kv("a", 1, 1), kv("b", 2, 2)]),
                from_vec(vec![kv("a", 3, 3)]),
            ],
            ctx,
            ReducerMergeFunctionWrapper::new(Box::new(DropAll)),
        );
        // Group "a" hits the reducer (two records) and folds to nothing;
        // group "b" short-circuits past it.
        let out = collect(reader.into_stream()).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, GenericRow::of(["b"]));
    }

    #[tokio::test]
    async fn raw_merger_preserves_every_record() {
        let ctx = MergeContext::new(default_key_comparator(), None, true);
        let merger = KeyValueHeapMerger::new(
            vec![
                from_vec(vec![kv("a", 1, 1), kv("b", 4, 4)]),
                from_vec(vec![kv("a", 2, 2), kv("b", 3, 3)]),
            ],
            ctx,
        );
        let out = collect(merger.into_stream()).await.unwrap();
        assert_eq!(out.len(), 4);
        let seqs: Vec<u64> = out.iter().map(|kv| kv.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }
}
