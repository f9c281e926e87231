//! Predicate tree pushed down to file readers.
//!
//! Filters are resolved by field *name* when they are evaluated, not by the
//! position they were built against, so the same predicate stays correct over
//! projected row layouts.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::record::{GenericRow, RowType, Value};

/// Comparison operator of a [`LeafPredicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// `field = literal`
    Eq,
    /// `field <> literal`
    NotEq,
    /// `field < literal`
    Lt,
    /// `field <= literal`
    LtEq,
    /// `field > literal`
    Gt,
    /// `field >= literal`
    GtEq,
    /// `field IS NULL`
    IsNull,
    /// `field IS NOT NULL`
    IsNotNull,
}

/// A single-field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafPredicate {
    /// Referenced field name.
    pub field: String,
    /// Operator.
    pub op: CompareOp,
    /// Literal operand; [`Value::Null`] for the null tests.
    pub literal: Value,
}

impl LeafPredicate {
    /// Evaluate against `row` laid out as `row_type`. Fields absent from the
    /// row type evaluate to `true` (the filter cannot reject what it cannot
    /// see; callers re-apply filters at a layer that can).
    pub fn test(&self, row: &GenericRow, row_type: &RowType) -> bool {
        let Some(index) = row_type.field_index(&self.field) else {
            return true;
        };
        let cell = row.get(index);
        match self.op {
            CompareOp::IsNull => cell.is_null(),
            CompareOp::IsNotNull => !cell.is_null(),
            _ if cell.is_null() => false,
            CompareOp::Eq => cell == &self.literal,
            CompareOp::NotEq => cell != &self.literal,
            CompareOp::Lt => cell < &self.literal,
            CompareOp::LtEq => cell <= &self.literal,
            CompareOp::Gt => cell > &self.literal,
            CompareOp::GtEq => cell >= &self.literal,
        }
    }
}

/// A filter expression: leaf comparisons combined with AND/OR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Single comparison.
    Leaf(LeafPredicate),
    /// Conjunction.
    And(Vec<Predicate>),
    /// Disjunction.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Evaluate against `row` laid out as `row_type`.
    pub fn test(&self, row: &GenericRow, row_type: &RowType) -> bool {
        match self {
            Predicate::Leaf(leaf) => leaf.test(row, row_type),
            Predicate::And(children) => children.iter().all(|p| p.test(row, row_type)),
            Predicate::Or(children) => children.iter().any(|p| p.test(row, row_type)),
        }
    }

    /// Collect every field name referenced by the expression.
    pub fn fields<'a>(&'a self, out: &mut HashSet<&'a str>) {
        match self {
            Predicate::Leaf(leaf) => {
                out.insert(leaf.field.as_str());
            }
            Predicate::And(children) | Predicate::Or(children) => {
                for child in children {
                    child.fields(out);
                }
            }
        }
    }
}

/// Decompose a predicate on its top-level AND into conjuncts.
pub fn split_and(predicate: &Predicate) -> Vec<Predicate> {
    match predicate {
        Predicate::And(children) => children.iter().flat_map(split_and).collect(),
        other => vec![other.clone()],
    }
}

/// True when `predicate` mentions any field in `names`.
pub fn contains_fields(predicate: &Predicate, names: &HashSet<String>) -> bool {
    let mut referenced = HashSet::new();
    predicate.fields(&mut referenced);
    referenced.iter().any(|f| names.contains(*f))
}

/// Builds [`Predicate`]s validated against a row type.
pub struct PredicateBuilder<'a> {
    row_type: &'a RowType,
}

impl<'a> PredicateBuilder<'a> {
    /// Bind a builder to `row_type`.
    pub fn new(row_type: &'a RowType) -> Self {
        PredicateBuilder { row_type }
    }

    fn leaf(&self, field: &str, op: CompareOp, literal: Value) -> Predicate {
        debug_assert!(
            self.row_type.field_index(field).is_some(),
            "unknown filter field {field}"
        );
        Predicate::Leaf(LeafPredicate {
            field: field.to_string(),
            op,
            literal,
        })
    }

    /// `field = literal`
    pub fn equal(&self, field: &str, literal: impl Into<Value>) -> Predicate {
        self.leaf(field, CompareOp::Eq, literal.into())
    }

    /// `field <> literal`
    pub fn not_equal(&self, field: &str, literal: impl Into<Value>) -> Predicate {
        self.leaf(field, CompareOp::NotEq, literal.into())
    }

    /// `field < literal`
    pub fn less_than(&self, field: &str, literal: impl Into<Value>) -> Predicate {
        self.leaf(field, CompareOp::Lt, literal.into())
    }

    /// `field <= literal`
    pub fn less_or_equal(&self, field: &str, literal: impl Into<Value>) -> Predicate {
        self.leaf(field, CompareOp::LtEq, literal.into())
    }

    /// `field > literal`
    pub fn greater_than(&self, field: &str, literal: impl Into<Value>) -> Predicate {
        self.leaf(field, CompareOp::Gt, literal.into())
    }

    /// `field >= literal`
    pub fn greater_or_equal(&self, field: &str, literal: impl Into<Value>) -> Predicate {
        self.leaf(field, CompareOp::GtEq, literal.into())
    }

    /// `field IS NULL`
    pub fn is_null(&self, field: &str) -> Predicate {
        self.leaf(field, CompareOp::IsNull, Value::Null)
    }

    /// Conjunction of `children`.
    pub fn and(&self, children: Vec<Predicate>) -> Predicate {
        Predicate::And(children)
    }

    /// Disjunction of `children`.
    pub fn or(&self, children: Vec<Predicate>) -> Predicate {
        Predicate::Or(children)
    }
}
