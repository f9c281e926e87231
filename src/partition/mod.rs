//! Partition values, their codec, and the external catalog seam.

pub mod expire;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{DataType, GenericRow, RowType, Value};

/// Placeholder for null partition values.
pub const DEFAULT_PARTITION_NAME: &str = "__DEFAULT_PARTITION__";

/// A partition key tuple: an ordered map from column name to formatted value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Partition {
    fields: Vec<(String, String)>,
}

impl Partition {
    /// Build from (name, value) pairs in partition-key order.
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Partition { fields }
    }

    /// Single-column shorthand.
    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        Partition {
            fields: vec![(name.into(), value.into())],
        }
    }

    /// The ordered (name, value) pairs.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Value for `name`, if the column is part of the partition.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// True for the empty (unpartitioned) tuple.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Directory-style rendering, `k1=v1/k2=v2`.
    pub fn to_path(&self) -> String {
        self.fields
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = self
            .fields
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join("-");
        write!(f, "{rendered}")
    }
}

/// Codec failures when mapping partitions back to rows.
#[derive(Debug, Error)]
pub enum PartitionCodecError {
    /// Partition is missing a schema column.
    #[error("partition has no value for column '{name}'")]
    MissingColumn {
        /// Missing column name.
        name: String,
    },
    /// Value does not parse as the column type.
    #[error("cannot parse '{value}' as {data_type:?} for column '{name}'")]
    BadValue {
        /// Column name.
        name: String,
        /// Raw value.
        value: String,
        /// Expected type.
        data_type: DataType,
    },
}

/// Encodes partition-key rows to [`Partition`] tuples and back, against a
/// fixed partition schema.
#[derive(Clone)]
pub struct PartitionCodec {
    partition_type: RowType,
}

impl PartitionCodec {
    /// Bind to the partition-key row type.
    pub fn new(partition_type: RowType) -> Self {
        PartitionCodec { partition_type }
    }

    /// The bound partition row type.
    pub fn partition_type(&self) -> &RowType {
        &self.partition_type
    }

    /// Format a partition-key row into an ordered string map.
    pub fn to_partition(&self, row: &GenericRow) -> Partition {
        Partition {
            fields: self
                .partition_type
                .fields()
                .iter()
                .enumerate()
                .map(|(i, field)| {
                    let value = row.get(i);
                    let formatted = if value.is_null() {
                        DEFAULT_PARTITION_NAME.to_string()
                    } else {
                        value.to_string()
                    };
                    (field.name.clone(), formatted)
                })
                .collect(),
        }
    }

    /// Parse a partition tuple back into a row, column by column.
    pub fn to_row(&self, partition: &Partition) -> Result<GenericRow, PartitionCodecError> {
        let mut values = Vec::with_capacity(self.partition_type.len());
        for field in self.partition_type.fields() {
            let raw = partition
                .get(&field.name)
                .ok_or_else(|| PartitionCodecError::MissingColumn {
                    name: field.name.clone(),
                })?;
            if raw == DEFAULT_PARTITION_NAME {
                values.push(Value::Null);
                continue;
            }
            let bad = || PartitionCodecError::BadValue {
                name: field.name.clone(),
                value: raw.to_string(),
                data_type: field.data_type,
            };
            let value = match field.data_type {
                DataType::String => Value::String(raw.to_string()),
                DataType::Int => Value::Int(raw.parse().map_err(|_| bad())?),
                DataType::Float => Value::Float(raw.parse().map_err(|_| bad())?),
                DataType::Boolean => Value::Boolean(raw.parse().map_err(|_| bad())?),
            };
            values.push(value);
        }
        Ok(GenericRow::new(values))
    }
}

/// Partition timestamp parse failure. Handled internally by the expire
/// controller: unparseable partitions are preserved.
#[derive(Debug, Error)]
#[error("cannot derive timestamp from partition '{partition}': {reason}")]
pub struct Unparseable {
    /// Offending partition, rendered.
    pub partition: String,
    /// What went wrong.
    pub reason: String,
}

/// Derives a [`NaiveDateTime`] from a partition tuple using a composition
/// template and a `yyyyMMdd`-style formatter pattern.
#[derive(Clone)]
pub struct PartitionTimeExtractor {
    template: Option<String>,
    chrono_format: String,
    has_time: bool,
}

impl PartitionTimeExtractor {
    /// Build an extractor. `template` composes partition fields into the
    /// formatter input (`$name` references); `None` uses the first partition
    /// column as-is. `formatter` uses `yyyy MM dd HH mm ss` tokens.
    pub fn new(template: Option<String>, formatter: &str) -> Self {
        let chrono_format = convert_formatter(formatter);
        let has_time = chrono_format.contains("%H")
            || chrono_format.contains("%M")
            || chrono_format.contains("%S");
        PartitionTimeExtractor {
            template,
            chrono_format,
            has_time,
        }
    }

    /// Derive the partition timestamp, or signal [`Unparseable`].
    pub fn extract(&self, partition: &Partition) -> Result<NaiveDateTime, Unparseable> {
        let input = match &self.template {
            None => partition
                .fields()
                .first()
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Unparseable {
                    partition: partition.to_string(),
                    reason: "empty partition".to_string(),
                })?,
            Some(template) => self.render_template(template, partition)?,
        };

        if self.has_time {
            NaiveDateTime::parse_from_str(&input, &self.chrono_format).map_err(|e| Unparseable {
                partition: partition.to_string(),
                reason: e.to_string(),
            })
        } else {
            NaiveDate::parse_from_str(&input, &self.chrono_format)
                .map(|date| date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
                .map_err(|e| Unparseable {
                    partition: partition.to_string(),
                    reason: e.to_string(),
                })
        }
    }

    fn render_template(
        &self,
        template: &str,
        partition: &Partition,
    ) -> Result<String, Unparseable> {
        // Longest name first so `$date2` never matches a `$date` reference.
        let mut names: Vec<&str> = partition.fields().iter().map(|(n, _)| n.as_str()).collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));

        let mut rendered = String::new();
        let mut rest = template;
        'outer: while let Some(dollar) = rest.find('$') {
            rendered.push_str(&rest[..dollar]);
            let after = &rest[dollar + 1..];
            for name in &names {
                if after.starts_with(name) {
                    // unwrap is safe: name came from this partition
                    rendered.push_str(partition.get(name).unwrap_or_default());
                    rest = &after[name.len()..];
                    continue 'outer;
                }
            }
            return Err(Unparseable {
                partition: partition.to_string(),
                reason: format!("template references unknown field near '${after}'"),
            });
        }
        rendered.push_str(rest);
        Ok(rendered)
    }
}

/// Translate a `yyyyMMdd HH:mm:ss`-style pattern into a chrono format string.
fn convert_formatter(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let run = |c: u8| {
            let mut n = 0;
            while i + n < bytes.len() && bytes[i + n] == c {
                n += 1;
            }
            n
        };
        match bytes[i] {
            b'y' => {
                let n = run(b'y');
                out.push_str(if n >= 4 { "%Y" } else { "%y" });
                i += n;
            }
            b'M' => {
                out.push_str("%m");
                i += run(b'M');
            }
            b'd' => {
                out.push_str("%d");
                i += run(b'd');
            }
            b'H' => {
                out.push_str("%H");
                i += run(b'H');
            }
            b'm' => {
                out.push_str("%M");
                i += run(b'm');
            }
            b's' => {
                out.push_str("%S");
                i += run(b's');
            }
            other => {
                out.push(other as char);
                i += 1;
            }
        }
    }
    out
}

/// Ascending order on derived timestamps, used to expire oldest first.
pub fn by_derived_timestamp(
    a: &(Partition, NaiveDateTime),
    b: &(Partition, NaiveDateTime),
) -> Ordering {
    a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))
}

/// Per-partition statistics reported to the external catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatistics {
    /// Partition tuple.
    pub partition: Partition,
    /// Live record count.
    pub record_count: u64,
    /// Total live file size in bytes.
    pub file_size_in_bytes: u64,
    /// Live file count.
    pub file_count: u64,
    /// Epoch millis of the newest file.
    pub last_file_creation_time: u64,
}

/// External catalog notification seam, provided by the embedding catalog.
#[async_trait]
pub trait PartitionHandler: Send + Sync {
    /// Partitions materialized by a commit.
    async fn create_partitions(&self, partitions: &[Partition]) -> Result<(), PartitionHandlerError>;

    /// Partitions dropped by the expire controller, after the OVERWRITE
    /// commit.
    async fn drop_partitions(&self, partitions: &[Partition]) -> Result<(), PartitionHandlerError>;

    /// Statistics refresh.
    async fn alter_partitions(
        &self,
        partitions: &[PartitionStatistics],
    ) -> Result<(), PartitionHandlerError>;

    /// Partitions marked complete by the writer.
    async fn mark_done_partitions(
        &self,
        partitions: &[Partition],
    ) -> Result<(), PartitionHandlerError>;

    /// Release catalog resources.
    async fn close(&self) -> Result<(), PartitionHandlerError>;
}

/// Failure reported by a [`PartitionHandler`].
#[derive(Debug, Error)]
#[error("partition handler error: {message}")]
pub struct PartitionHandlerError {
    /// Human-readable cause.
    pub message: String,
}
