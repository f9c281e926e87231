//! Table schema and its versioned store.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    fs::{FileIO, IoError, Path},
    option::{ConfigError, CoreOptions, PARTITION_EXPIRATION_TIME},
    record::{DataField, RowType},
};

/// Schema definition handed to [`SchemaManager::create_table`].
#[derive(Debug, Clone)]
pub struct Schema {
    /// All row fields.
    pub fields: Vec<DataField>,
    /// Partition key column names, in partition order.
    pub partition_keys: Vec<String>,
    /// Primary key column names.
    pub primary_keys: Vec<String>,
    /// Raw table options.
    pub options: HashMap<String, String>,
}

/// A sealed, numbered table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    /// Schema id, increasing across evolutions.
    pub id: u64,
    /// All row fields.
    pub fields: Vec<DataField>,
    /// Partition key column names.
    pub partition_keys: Vec<String>,
    /// Primary key column names.
    pub primary_keys: Vec<String>,
    /// Raw table options.
    pub options: HashMap<String, String>,
}

impl TableSchema {
    /// Full value row type.
    pub fn logical_row_type(&self) -> RowType {
        RowType::new(self.fields.clone())
    }

    /// Row type of the partition key columns.
    pub fn partition_type(&self) -> RowType {
        self.logical_row_type().project_by_names(&self.partition_keys)
    }

    /// Primary keys minus partition keys. This is the physical key stored in
    /// data files: partition values are constant within a file.
    pub fn trimmed_primary_keys(&self) -> Vec<String> {
        let trimmed: Vec<String> = self
            .primary_keys
            .iter()
            .filter(|pk| !self.partition_keys.contains(pk))
            .cloned()
            .collect();
        if trimmed.is_empty() {
            // Fully partition-covered primary keys fall back to the whole key.
            self.primary_keys.clone()
        } else {
            trimmed
        }
    }

    /// Row type of the trimmed primary key.
    pub fn key_type(&self) -> RowType {
        self.logical_row_type()
            .project_by_names(&self.trimmed_primary_keys())
    }

    /// All field names.
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Parse the schema's raw options.
    pub fn core_options(&self) -> Result<CoreOptions, ConfigError> {
        CoreOptions::from_map(&self.options)
    }
}

/// Schema store failures.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// No schema has been created yet.
    #[error("no schema found under {path}")]
    NoSchema {
        /// Table path.
        path: String,
    },
    /// Requested schema id does not exist.
    #[error("schema {id} not found")]
    NotFound {
        /// Missing id.
        id: u64,
    },
    /// Invalid table definition.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Store failure.
    #[error(transparent)]
    Io(#[from] IoError),
    /// Corrupt schema file.
    #[error("schema decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Versioned schema store under `<table>/schema/schema-<id>`.
pub struct SchemaManager {
    file_io: Arc<dyn FileIO>,
    table_path: Path,
}

impl SchemaManager {
    /// Bind to a table path.
    pub fn new(file_io: Arc<dyn FileIO>, table_path: Path) -> Self {
        SchemaManager {
            file_io,
            table_path,
        }
    }

    fn schema_dir(&self) -> Path {
        self.table_path.child("schema")
    }

    fn schema_path(&self, id: u64) -> Path {
        self.schema_dir().child(format!("schema-{id}"))
    }

    /// Create the initial table schema. Validates option/shape compatibility
    /// before anything is persisted.
    pub async fn create_table(&self, schema: Schema) -> Result<TableSchema, SchemaError> {
        if schema.options.contains_key(PARTITION_EXPIRATION_TIME)
            && schema.partition_keys.is_empty()
        {
            return Err(ConfigError::ExpirationOnNonPartitionedTable.into());
        }
        // Surface bad option values at creation, not first use.
        CoreOptions::from_map(&schema.options)?;

        let id = match self.latest_id().await? {
            Some(latest) => latest + 1,
            None => 0,
        };
        let table_schema = TableSchema {
            id,
            fields: schema.fields,
            partition_keys: schema.partition_keys,
            primary_keys: schema.primary_keys,
            options: schema.options,
        };
        let payload = serde_json::to_vec_pretty(&table_schema)?;
        self.file_io
            .open_output(&self.schema_path(id), &payload, false)
            .await?;
        debug!(schema_id = id, "created table schema");
        Ok(table_schema)
    }

    /// Latest schema, if any table has been created.
    pub async fn latest(&self) -> Result<Option<TableSchema>, SchemaError> {
        match self.latest_id().await? {
            Some(id) => Ok(Some(self.get(id).await?)),
            None => Ok(None),
        }
    }

    /// Schema by id.
    pub async fn get(&self, id: u64) -> Result<TableSchema, SchemaError> {
        let bytes = self
            .file_io
            .open_input(&self.schema_path(id))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    SchemaError::NotFound { id }
                } else {
                    SchemaError::Io(e)
                }
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn latest_id(&self) -> Result<Option<u64>, SchemaError> {
        let listed = self.file_io.list(&self.schema_dir()).await?;
        Ok(listed
            .iter()
            .filter_map(|p| p.file_name().strip_prefix("schema-")?.parse::<u64>().ok())
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::memory::InMemoryFileIO,
        record::DataType,
    };

    fn string_schema(partition_keys: Vec<&str>, options: Vec<(&str, &str)>) -> Schema {
        Schema {
            fields: vec![
                DataField::new(0, "f0", DataType::String),
                DataField::new(1, "f1", DataType::String),
            ],
            partition_keys: partition_keys.into_iter().map(String::from).collect(),
            primary_keys: vec![],
            options: options
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn expiration_on_non_partitioned_table_fails() {
        let manager = SchemaManager::new(Arc::new(InMemoryFileIO::new()), Path::new("t"));
        let err = manager
            .create_table(string_schema(vec![], vec![(PARTITION_EXPIRATION_TIME, "1 d")]))
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Can not set 'partition.expiration-time' for non-partitioned table"));
    }

    #[tokio::test]
    async fn create_and_reload() {
        let manager = SchemaManager::new(Arc::new(InMemoryFileIO::new()), Path::new("t"));
        let created = manager
            .create_table(string_schema(vec!["f0"], vec![]))
            .await
            .unwrap();
        assert_eq!(created.id, 0);

        let latest = manager.latest().await.unwrap().unwrap();
        assert_eq!(latest.partition_keys, vec!["f0".to_string()]);
        assert_eq!(latest.id, 0);
    }

    #[tokio::test]
    async fn trimmed_primary_keys_drop_partition_columns() {
        let schema = TableSchema {
            id: 0,
            fields: vec![
                DataField::new(0, "dt", DataType::String),
                DataField::new(1, "k", DataType::String),
                DataField::new(2, "v", DataType::Int),
            ],
            partition_keys: vec!["dt".to_string()],
            primary_keys: vec!["dt".to_string(), "k".to_string()],
            options: HashMap::new(),
        };
        assert_eq!(schema.trimmed_primary_keys(), vec!["k".to_string()]);
        assert_eq!(schema.key_type().field_names(), vec!["k"]);
    }
}
