//! Row and key-value record model.
//!
//! Data files store [`KeyValue`] records: a key row, a value row, a writer
//! sequence number and a [`RowKind`]. Rows are dynamically typed against a
//! [`RowType`] schema so the same engine serves any partitioned table layout.

use std::{
    cmp::Ordering,
    hash::{Hash, Hasher},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A single dynamically typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Boolean(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
}

impl Value {
    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Boolean(l), Value::Boolean(r)) => l.cmp(r),
            (Value::Int(l), Value::Int(r)) => l.cmp(r),
            (Value::Float(l), Value::Float(r)) => l.total_cmp(r),
            (Value::String(l), Value::String(r)) => l.cmp(r),
            // Nulls first, mixed types by rank so the order is total.
            (l, r) => l.type_rank().cmp(&r.type_rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::String(v) => v.hash(state),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
        }
    }
}

/// Logical type of a [`DataField`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean.
    Boolean,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    String,
}

/// A named, typed field of a [`RowType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataField {
    /// Stable field id.
    pub id: i32,
    /// Field name, unique within the row type.
    pub name: String,
    /// Logical type.
    pub data_type: DataType,
}

impl DataField {
    /// Shorthand constructor.
    pub fn new(id: i32, name: impl Into<String>, data_type: DataType) -> Self {
        DataField {
            id,
            name: name.into(),
            data_type,
        }
    }
}

/// An ordered list of fields describing the layout of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RowType {
    fields: Vec<DataField>,
}

impl RowType {
    /// Build a row type from fields.
    pub fn new(fields: Vec<DataField>) -> Self {
        RowType { fields }
    }

    /// Build a row type of string fields named `f0..fN`, a common test shape.
    pub fn of_strings(n: usize) -> Self {
        RowType {
            fields: (0..n)
                .map(|i| DataField::new(i as i32, format!("f{i}"), DataType::String))
                .collect(),
        }
    }

    /// All fields in order.
    pub fn fields(&self) -> &[DataField] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the row type has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Position of `name`, if present.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Positions of `names` in this row type. Unknown names are skipped.
    pub fn field_indices(&self, names: &[impl AsRef<str>]) -> Vec<usize> {
        names
            .iter()
            .filter_map(|n| self.field_index(n.as_ref()))
            .collect()
    }

    /// Row type containing only the fields at `indices`, in that order.
    pub fn project(&self, indices: &[usize]) -> RowType {
        RowType {
            fields: indices.iter().map(|&i| self.fields[i].clone()).collect(),
        }
    }

    /// Row type containing only the named fields, in the given order.
    pub fn project_by_names(&self, names: &[impl AsRef<str>]) -> RowType {
        RowType {
            fields: names
                .iter()
                .filter_map(|n| self.fields.iter().find(|f| f.name == n.as_ref()).cloned())
                .collect(),
        }
    }
}

/// A materialized row: one [`Value`] per field of its row type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct GenericRow {
    values: Vec<Value>,
}

impl GenericRow {
    /// Build a row from values.
    pub fn new(values: Vec<Value>) -> Self {
        GenericRow { values }
    }

    /// Convenience constructor from anything convertible to [`Value`].
    pub fn of<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        GenericRow {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of cells.
    pub fn arity(&self) -> usize {
        self.values.len()
    }

    /// Cell at `index`.
    pub fn get(&self, index: usize) -> &Value {
        &self.values[index]
    }

    /// All cells in order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Replace the cell at `index`.
    pub fn set(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    /// Row containing the cells at `indices`, in that order.
    pub fn project(&self, indices: &[usize]) -> GenericRow {
        GenericRow {
            values: indices.iter().map(|&i| self.values[i].clone()).collect(),
        }
    }
}

/// Change semantics of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowKind {
    /// Insertion of a new row.
    #[serde(rename = "+I")]
    Insert,
    /// Previous content of an updated row.
    #[serde(rename = "-U")]
    UpdateBefore,
    /// New content of an updated row.
    #[serde(rename = "+U")]
    UpdateAfter,
    /// Deletion of a row.
    #[serde(rename = "-D")]
    Delete,
}

impl RowKind {
    /// True for `UpdateBefore` and `Delete`.
    pub fn is_retract(&self) -> bool {
        matches!(self, RowKind::UpdateBefore | RowKind::Delete)
    }
}

impl std::fmt::Display for RowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = match self {
            RowKind::Insert => "+I",
            RowKind::UpdateBefore => "-U",
            RowKind::UpdateAfter => "+U",
            RowKind::Delete => "-D",
        };
        write!(f, "{short}")
    }
}

/// A key-value record flowing through writers, data files and merge readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Key row (trimmed primary key fields).
    pub key: GenericRow,
    /// Writer-scoped monotonically increasing sequence number.
    pub sequence: u64,
    /// Change kind.
    pub kind: RowKind,
    /// Value row.
    pub value: GenericRow,
}

impl KeyValue {
    /// Build a record.
    pub fn new(key: GenericRow, sequence: u64, kind: RowKind, value: GenericRow) -> Self {
        KeyValue {
            key,
            sequence,
            kind,
            value,
        }
    }

    /// Return a copy with `key` swapped out.
    pub fn replace_key(mut self, key: GenericRow) -> Self {
        self.key = key;
        self
    }

    /// Return a copy with `value` swapped out.
    pub fn replace_value(mut self, value: GenericRow) -> Self {
        self.value = value;
        self
    }
}

/// Shared comparator over rows.
pub type RowComparator = Arc<dyn Fn(&GenericRow, &GenericRow) -> Ordering + Send + Sync>;

/// Field-wise comparator over whole rows; the default key order.
pub fn default_key_comparator() -> RowComparator {
    Arc::new(|a: &GenericRow, b: &GenericRow| {
        for (l, r) in a.values().iter().zip(b.values().iter()) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        a.arity().cmp(&b.arity())
    })
}

/// Comparator over a fixed set of value fields, used for user-defined
/// sequence ordering within a key.
#[derive(Clone)]
pub struct FieldsComparator {
    indices: Vec<usize>,
    ascending: bool,
}

impl FieldsComparator {
    /// Resolve `field_names` against `row_type`; returns `None` when no named
    /// field exists in the row type, in which case callers fall back to the
    /// plain sequence number.
    pub fn create(row_type: &RowType, field_names: &[String], ascending: bool) -> Option<Self> {
        if field_names.is_empty() {
            return None;
        }
        let indices = row_type.field_indices(field_names);
        if indices.is_empty() {
            return None;
        }
        Some(FieldsComparator { indices, ascending })
    }

    /// Compare the configured fields of two value rows.
    pub fn compare(&self, a: &GenericRow, b: &GenericRow) -> Ordering {
        for &i in &self.indices {
            let ord = a.get(i).cmp(b.get(i));
            if ord != Ordering::Equal {
                return if self.ascending { ord } else { ord.reverse() };
            }
        }
        Ordering::Equal
    }

    /// True when comparisons run in ascending field order.
    pub fn is_ascending(&self) -> bool {
        self.ascending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_order_is_total() {
        assert!(Value::Int(1) < Value::Int(2));
        assert!(Value::Null < Value::Int(0));
        assert!(Value::Float(1.5) < Value::Float(2.0));
        assert_eq!(
            Value::String("a".into()).cmp(&Value::String("a".into())),
            Ordering::Equal
        );
    }

    #[test]
    fn row_projection_keeps_order() {
        let row = GenericRow::of(["a", "b", "c"]);
        let projected = row.project(&[2, 0]);
        assert_eq!(projected.get(0), &Value::String("c".into()));
        assert_eq!(projected.get(1), &Value::String("a".into()));
    }

    #[test]
    fn fields_comparator_direction() {
        let row_type = RowType::new(vec![
            DataField::new(0, "k", DataType::String),
            DataField::new(1, "ts", DataType::Int),
        ]);
        let cmp = FieldsComparator::create(&row_type, &["ts".to_string()], false).unwrap();
        let a = GenericRow::of([Value::String("x".into()), Value::Int(1)]);
        let b = GenericRow::of([Value::String("x".into()), Value::Int(2)]);
        assert_eq!(cmp.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn missing_sequence_fields_disable_comparator() {
        let row_type = RowType::of_strings(2);
        assert!(FieldsComparator::create(&row_type, &["nope".to_string()], true).is_none());
    }
}
