//! Numeric accumulator for nested counter documents
//!
//! `NumericUpdate` folds arbitrarily nested maps of numbers into a single
//! delta. Non-numeric leaves of the input are ignored. When the input and
//! the accumulator disagree on the shape of a path (number vs map) the
//! input wins and overwrites the accumulated value; there is no schema.
//!
//! Integers stay integers as long as they fit in `i64`; anything else is
//! accumulated as `f64`.

use crate::partial::UpdateEntry;
use serde_json::{Map, Number, Value};

/// A document body: a map of field name to JSON value
pub type Document = Map<String, Value>;

/// Add two JSON numbers, negating `rhs` when `negate` is set.
pub fn add_numbers(lhs: &Number, rhs: &Number, negate: bool) -> Number {
    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let b = if negate { b.checked_neg() } else { Some(b) };
        if let Some(sum) = b.and_then(|b| a.checked_add(b)) {
            return Number::from(sum);
        }
    }
    let a = lhs.as_f64().unwrap_or(0.0);
    let b = rhs.as_f64().unwrap_or(0.0);
    float_number(if negate { a - b } else { a + b })
}

/// Negate a JSON number.
pub fn negate_number(n: &Number) -> Number {
    if let Some(v) = n.as_i64().and_then(i64::checked_neg) {
        return Number::from(v);
    }
    float_number(-n.as_f64().unwrap_or(0.0))
}

fn float_number(v: f64) -> Number {
    // NaN and infinities have no JSON representation.
    Number::from_f64(v).unwrap_or_else(|| Number::from(0))
}

fn is_zero(n: &Number) -> bool {
    match n.as_i64() {
        Some(v) => v == 0,
        None => n.as_f64() == Some(0.0),
    }
}

/// Accumulated numeric delta
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NumericUpdate {
    data: Document,
}

impl NumericUpdate {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every numeric leaf of `from` at the same path.
    pub fn merge_from(&mut self, from: &Document) {
        merge_recursive(from, &mut self.data, false);
    }

    /// Subtract every numeric leaf of `from` at the same path.
    pub fn subtract_from(&mut self, from: &Document) {
        merge_recursive(from, &mut self.data, true);
    }

    /// True iff every reachable leaf is a number equal to zero.
    ///
    /// Any non-numeric leaf makes the update non-noop.
    pub fn is_noop(&self) -> bool {
        is_noop(&self.data)
    }

    /// The accumulated delta
    pub fn data(&self) -> &Document {
        &self.data
    }

    /// Consume the accumulator and return the delta.
    pub fn into_data(self) -> Document {
        self.data
    }

    /// Build the merge payload for a counter document.
    ///
    /// Paths numeric in both the counter and the accumulator carry the sum.
    /// Paths missing from the counter carry the accumulated value as is, so
    /// a merge-write adds them as new fields.
    pub fn to_counter_update(&self, counter: &Document) -> Document {
        let mut update = self.data.clone();
        add_common_fields(counter, &mut update);
        update
    }

    /// Build one `_updates_` entry for a partial, or `None` for a noop.
    pub fn to_partial_update<F>(&self, next_id: F) -> Option<UpdateEntry>
    where
        F: FnOnce() -> String,
    {
        if self.is_noop() {
            return None;
        }
        Some(UpdateEntry::new(next_id(), self.data.clone()))
    }
}

fn merge_recursive(from: &Document, to: &mut Document, subtract: bool) {
    for (key, value) in from {
        match value {
            Value::Number(n) => {
                let merged = match to.get(key) {
                    Some(Value::Number(existing)) => add_numbers(existing, n, subtract),
                    _ if subtract => negate_number(n),
                    _ => n.clone(),
                };
                to.insert(key.clone(), Value::Number(merged));
            }
            Value::Object(child) => {
                let slot = to
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(target) = slot {
                    merge_recursive(child, target, subtract);
                }
            }
            _ => {}
        }
    }
}

fn add_common_fields(from: &Document, to: &mut Document) {
    for (key, value) in to.iter_mut() {
        match (value, from.get(key)) {
            (Value::Number(acc), Some(Value::Number(existing))) => {
                *acc = add_numbers(acc, existing, false);
            }
            (Value::Object(acc), Some(Value::Object(existing))) => {
                add_common_fields(existing, acc);
            }
            _ => {}
        }
    }
}

fn is_noop(doc: &Document) -> bool {
    doc.values().all(|value| match value {
        Value::Number(n) => is_zero(n),
        Value::Object(child) => is_noop(child),
        _ => false,
    })
}
