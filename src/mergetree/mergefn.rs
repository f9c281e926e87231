//! Merge functions: how records sharing a key fold into one output record.

use std::sync::Arc;

use crate::{option::MergeEngine, record::KeyValue};

/// Folds the records of one key, fed in sequence order.
pub trait MergeFunction: Send {
    /// Start a new key group.
    fn reset(&mut self);

    /// Feed the next record of the group.
    fn add(&mut self, kv: KeyValue);

    /// Finish the group. `None` skips the key entirely.
    fn result(&mut self) -> Option<KeyValue>;
}

/// Keep only the record with the highest sequence order.
#[derive(Default)]
pub struct DeduplicateMergeFunction {
    latest: Option<KeyValue>,
}

impl MergeFunction for DeduplicateMergeFunction {
    fn reset(&mut self) {
        self.latest = None;
    }

    fn add(&mut self, kv: KeyValue) {
        self.latest = Some(kv);
    }

    fn result(&mut self) -> Option<KeyValue> {
        self.latest.take()
    }
}

/// Later non-null fields overwrite earlier ones. A DELETE record clears the
/// accumulated row and is emitted as a delete.
#[derive(Default)]
pub struct PartialUpdateMergeFunction {
    current: Option<KeyValue>,
}

impl MergeFunction for PartialUpdateMergeFunction {
    fn reset(&mut self) {
        self.current = None;
    }

    fn add(&mut self, kv: KeyValue) {
        if kv.kind.is_retract() {
            self.current = Some(kv);
            return;
        }
        match &mut self.current {
            Some(current) if !current.kind.is_retract() => {
                for (i, cell) in kv.value.values().iter().enumerate() {
                    if !cell.is_null() {
                        current.value.set(i, cell.clone());
                    }
                }
                current.sequence = kv.sequence;
                current.kind = kv.kind;
            }
            _ => self.current = Some(kv),
        }
    }

    fn result(&mut self) -> Option<KeyValue> {
        self.current.take()
    }
}

/// Wraps a [`MergeFunction`], short-circuiting single-record groups: the
/// overwhelmingly common case after compaction never touches the reducer.
pub struct ReducerMergeFunctionWrapper {
    merge_function: Box<dyn MergeFunction>,
    initial: Option<KeyValue>,
    reduced: bool,
}

impl ReducerMergeFunctionWrapper {
    /// Wrap `merge_function`.
    pub fn new(merge_function: Box<dyn MergeFunction>) -> Self {
        ReducerMergeFunctionWrapper {
            merge_function,
            initial: None,
            reduced: false,
        }
    }

    /// Start a new key group.
    pub fn reset(&mut self) {
        self.initial = None;
        self.reduced = false;
        self.merge_function.reset();
    }

    /// Feed the next record in sequence order.
    pub fn add(&mut self, kv: KeyValue) {
        if self.reduced {
            self.merge_function.add(kv);
            return;
        }
        match self.initial.take() {
            None => self.initial = Some(kv),
            Some(first) => {
                self.reduced = true;
                self.merge_function.add(first);
                self.merge_function.add(kv);
            }
        }
    }

    /// Finish the group.
    pub fn result(&mut self) -> Option<KeyValue> {
        if self.reduced {
            self.merge_function.result()
        } else {
            self.initial.take()
        }
    }
}

/// Projection adjustment computed by a merge-function factory: the reducer
/// may need more fields than the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustedProjection {
    /// Fields materialized by file readers (indices into the full value
    /// row); `None` reads everything.
    pub pushdown: Option<Vec<usize>>,
    /// Projection re-applied after merging to give the caller exactly what
    /// was asked; `None` when the pushdown already matches.
    pub outer: Option<Vec<usize>>,
}

/// Creates merge functions and decides projection adjustment, chosen by table
/// configuration.
pub trait MergeFunctionFactory: Send + Sync {
    /// Build a merge function for the (possibly adjusted) projection.
    fn create(&self, projection: Option<&[usize]>) -> Box<dyn MergeFunction>;

    /// Split the caller's projection into pushdown and outer parts.
    fn adjust_projection(&self, projection: Option<&[usize]>) -> AdjustedProjection;
}

/// Deduplication works on any projection: push the caller's projection down
/// unchanged.
pub struct DeduplicateMergeFunctionFactory;

impl MergeFunctionFactory for DeduplicateMergeFunctionFactory {
    fn create(&self, _projection: Option<&[usize]>) -> Box<dyn MergeFunction> {
        Box::new(DeduplicateMergeFunction::default())
    }

    fn adjust_projection(&self, projection: Option<&[usize]>) -> AdjustedProjection {
        AdjustedProjection {
            pushdown: projection.map(|p| p.to_vec()),
            outer: None,
        }
    }
}

/// Partial update must see every field to fold them, so nothing is pushed
/// down and the caller's projection is re-applied outside.
pub struct PartialUpdateMergeFunctionFactory;

impl MergeFunctionFactory for PartialUpdateMergeFunctionFactory {
    fn create(&self, _projection: Option<&[usize]>) -> Box<dyn MergeFunction> {
        Box::new(PartialUpdateMergeFunction::default())
    }

    fn adjust_projection(&self, projection: Option<&[usize]>) -> AdjustedProjection {
        AdjustedProjection {
            pushdown: None,
            outer: projection.map(|p| p.to_vec()),
        }
    }
}

/// Factory for the configured merge engine.
pub fn merge_function_factory(engine: MergeEngine) -> Arc<dyn MergeFunctionFactory> {
    match engine {
        MergeEngine::Deduplicate => Arc::new(DeduplicateMergeFunctionFactory),
        MergeEngine::PartialUpdate => Arc::new(PartialUpdateMergeFunctionFactory),
    }
}
