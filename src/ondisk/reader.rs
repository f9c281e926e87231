//! Key-value file reader factory.
//!
//! Opens one data file as a [`KeyValueStream`]: format decode, then
//! deletion-vector suppression, then any predicates the format refused, then
//! projection. Built per (partition, bucket) by the split read façade.

use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt};

use crate::{
    deletion::DeletionVectorFactory,
    fs::{FileIO, Path},
    ondisk::{
        format::FileFormat,
        meta::DataFileMeta,
        DataFilePathFactory, ReadError,
    },
    partition::Partition,
    predicate::Predicate,
    record::RowType,
    schema::TableSchema,
    stream::KeyValueStream,
};

/// Opens data files of one (partition, bucket) with a fixed projection and
/// filter set.
pub struct KeyValueFileReaderFactory {
    file_io: Arc<dyn FileIO>,
    format: Arc<dyn FileFormat>,
    path_factory: DataFilePathFactory,
    value_type: RowType,
    read_value_projection: Option<Vec<usize>>,
    read_key_projection: Option<Vec<usize>>,
    project_keys: bool,
    dv_factory: Arc<DeletionVectorFactory>,
    filters: Option<Vec<Predicate>>,
}

impl KeyValueFileReaderFactory {
    /// Open `file` as a record stream.
    pub async fn open(&self, file: &DataFileMeta) -> Result<KeyValueStream, ReadError> {
        let path = self.path_factory.to_path(&file.file_name);
        let filters = self.filters.clone().unwrap_or_default();
        let opened = self
            .format
            .open(&self.file_io, &path, &self.value_type, &filters)
            .await?;

        let deletion_vector = self.dv_factory.create(&file.file_name).await?;
        let unpushed = opened.unpushed;
        let value_type = self.value_type.clone();
        let value_projection = self.read_value_projection.clone();
        let key_projection = if self.project_keys {
            self.read_key_projection.clone()
        } else {
            None
        };

        let reader = opened
            .records
            .try_filter(move |record| {
                // Deletion vectors run before any residual predicate.
                let deleted = deletion_vector
                    .as_ref()
                    .map(|dv| dv.is_deleted(record.position))
                    .unwrap_or(false);
                futures_util::future::ready(!deleted)
            })
            .try_filter(move |record| {
                let keep = unpushed.iter().all(|p| p.test(&record.kv.value, &value_type));
                futures_util::future::ready(keep)
            })
            .map_ok(move |record| {
                let mut kv = record.kv;
                if let Some(projection) = &value_projection {
                    let value = kv.value.project(projection);
                    kv = kv.replace_value(value);
                }
                if let Some(projection) = &key_projection {
                    let key = kv.key.project(projection);
                    kv = kv.replace_key(key);
                }
                kv
            })
            .boxed();
        Ok(reader)
    }
}

/// Configures and builds [`KeyValueFileReaderFactory`] instances. One builder
/// serves a whole table read; `build` binds it to a (partition, bucket).
#[derive(Clone)]
pub struct KeyValueFileReaderFactoryBuilder {
    file_io: Arc<dyn FileIO>,
    format: Arc<dyn FileFormat>,
    table_path: Path,
    key_type: RowType,
    value_type: RowType,
    read_value_projection: Option<Vec<usize>>,
    read_key_projection: Option<Vec<usize>>,
}

impl KeyValueFileReaderFactoryBuilder {
    /// Bind to a table's schema and storage.
    pub fn new(
        file_io: Arc<dyn FileIO>,
        format: Arc<dyn FileFormat>,
        table_path: Path,
        schema: &TableSchema,
    ) -> Self {
        KeyValueFileReaderFactoryBuilder {
            file_io,
            format,
            table_path,
            key_type: schema.key_type(),
            value_type: schema.logical_row_type(),
            read_value_projection: None,
            read_key_projection: None,
        }
    }

    /// The table's file I/O.
    pub fn file_io(&self) -> Arc<dyn FileIO> {
        self.file_io.clone()
    }

    /// Restrict materialized value fields to `projection` (indices into the
    /// stored value row).
    pub fn with_read_value_projection(&mut self, projection: Option<Vec<usize>>) -> &mut Self {
        self.read_value_projection = projection;
        self
    }

    /// Project emitted keys to `read_key_type`, resolved against the key
    /// schema by name.
    pub fn with_read_key_type(&mut self, read_key_type: &RowType) -> &mut Self {
        let names = read_key_type.field_names();
        self.read_key_projection = Some(self.key_type.field_indices(&names));
        self
    }

    /// Value row type after the configured projection.
    pub fn read_value_type(&self) -> RowType {
        match &self.read_value_projection {
            Some(projection) => self.value_type.project(projection),
            None => self.value_type.clone(),
        }
    }

    /// Build a factory for one (partition, bucket). `project_keys` applies
    /// the key projection at the file reader; merge readers must pass `false`
    /// and project after merging, or key order would break.
    pub fn build(
        &self,
        partition: &Partition,
        bucket: i32,
        dv_factory: Arc<DeletionVectorFactory>,
        project_keys: bool,
        filters: Option<Vec<Predicate>>,
    ) -> KeyValueFileReaderFactory {
        KeyValueFileReaderFactory {
            file_io: self.file_io.clone(),
            format: self.format.clone(),
            path_factory: DataFilePathFactory::new(&self.table_path, partition, bucket),
            value_type: self.value_type.clone(),
            read_value_projection: self.read_value_projection.clone(),
            read_key_projection: self.read_key_projection.clone(),
            project_keys,
            dv_factory,
            filters,
        }
    }
}
