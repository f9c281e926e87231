//! Record stream plumbing shared by the read paths.
//!
//! Every reader in the crate is a boxed [`Stream`] of [`KeyValue`] results.
//! Suppliers are lazy: a file is opened only when the concatenation reaches
//! it, mirroring how sections and runs are stitched together.

pub mod merge;

use futures_util::{
    future::BoxFuture,
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};

use crate::{
    ondisk::ReadError,
    record::{KeyValue, RowKind},
};

/// A pinned, boxed stream of key-value records.
pub type KeyValueStream = BoxStream<'static, Result<KeyValue, ReadError>>;

/// Lazily opens one reader.
pub type ReaderSupplier =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<KeyValueStream, ReadError>> + Send>;

/// An always-empty reader.
pub fn empty() -> KeyValueStream {
    stream::empty().boxed()
}

/// A reader over already materialized records.
pub fn from_vec(records: Vec<KeyValue>) -> KeyValueStream {
    stream::iter(records.into_iter().map(Ok)).boxed()
}

/// Concatenate readers, opening each supplier only when the previous reader
/// is exhausted. An error from any reader ends the concatenation.
pub fn concat(suppliers: Vec<ReaderSupplier>) -> KeyValueStream {
    stream::iter(suppliers)
        .then(|supplier| supplier())
        .try_flatten()
        .boxed()
}

/// Drop records whose kind is DELETE. Applied on the merge path unless the
/// caller forces deletes to be kept.
pub fn drop_delete(reader: KeyValueStream) -> KeyValueStream {
    reader
        .try_filter(|kv| futures_util::future::ready(kv.kind != RowKind::Delete))
        .boxed()
}

/// Replace each record's key with its projection.
pub fn project_key(reader: KeyValueStream, indices: Vec<usize>) -> KeyValueStream {
    reader
        .map_ok(move |kv| {
            let key = kv.key.project(&indices);
            kv.replace_key(key)
        })
        .boxed()
}

/// Replace each record's value with its projection.
pub fn project_value(reader: KeyValueStream, indices: Vec<usize>) -> KeyValueStream {
    reader
        .map_ok(move |kv| {
            let value = kv.value.project(&indices);
            kv.replace_value(value)
        })
        .boxed()
}

/// Collect a reader to completion. Test and tooling helper.
pub async fn collect(mut reader: KeyValueStream) -> Result<Vec<KeyValue>, ReadError> {
    let mut out = Vec::new();
    while let Some(kv) = reader.try_next().await? {
        out.push(kv);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GenericRow;

    fn kv(key: &str, seq: u64, kind: RowKind) -> KeyValue {
        KeyValue::new(GenericRow::of([key]), seq, kind, GenericRow::of([key, "v"]))
    }

    #[tokio::test]
    async fn concat_is_lazy_and_ordered() {
        let opened = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut suppliers: Vec<ReaderSupplier> = Vec::new();
        for batch in [vec![kv("a", 1, RowKind::Insert)], vec![kv("b", 2, RowKind::Insert)]] {
            let opened = opened.clone();
            suppliers.push(Box::new(move || {
                Box::pin(async move {
                    opened.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(from_vec(batch))
                })
            }));
        }

        let mut reader = concat(suppliers);
        let first = reader.try_next().await.unwrap().unwrap();
        assert_eq!(first.key, GenericRow::of(["a"]));
        // Second supplier not opened until the first reader drains.
        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 1);

        let rest = collect(reader).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_delete_suppresses_tombstones() {
        let reader = from_vec(vec![
            kv("a", 1, RowKind::Insert),
            kv("b", 2, RowKind::Delete),
            kv("c", 3, RowKind::Insert),
        ]);
        let records = collect(drop_delete(reader)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|kv| kv.kind != RowKind::Delete));
    }

    #[tokio::test]
    async fn empty_reader_yields_nothing() {
        assert!(collect(empty()).await.unwrap().is_empty());
    }
}
