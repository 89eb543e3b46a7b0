//! Rows, nested relation payloads and query filters.
//!
//! A [`Row`] keeps its columns in read order. Related rows are carried next to
//! the plain columns under the relation's name, as a [`Value::Row`] when the
//! relation was followed towards its parent and as [`Value::Rows`] when it was
//! followed towards its children.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use tracing::warn;

use crate::error::{IngressError, Result};
use crate::models::{Direction, Relation, Table};

/// A column value or a nested relation payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Plain column value
    Scalar(serde_json::Value),
    /// Single parent row
    Row(Row),
    /// Child rows in fetch order
    Rows(Vec<Row>),
}

impl Value {
    /// Returns the scalar value, if this is a plain column.
    pub fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the nested parent row, if any.
    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Value::Row(row) => Some(row),
            _ => None,
        }
    }

    /// Returns the nested child rows, if any.
    pub fn as_rows(&self) -> Option<&[Row]> {
        match self {
            Value::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Scalar(value) => value.clone(),
            Value::Row(row) => row.to_json(),
            Value::Rows(rows) => serde_json::Value::Array(rows.iter().map(Row::to_json).collect()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Scalar(value) => value.serialize(serializer),
            Value::Row(row) => row.serialize(serializer),
            Value::Rows(rows) => {
                let mut seq = serializer.serialize_seq(Some(rows.len()))?;
                for row in rows {
                    seq.serialize_element(row)?;
                }
                seq.end()
            }
        }
    }
}

/// An ordered mapping from column name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    entries: Vec<(String, Value)>,
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to append a scalar column.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.insert(column, Value::Scalar(value.into()));
        self
    }

    /// Builds a flat row from a JSON object, keeping its key order.
    ///
    /// Nested objects and arrays are kept as scalar JSON values.
    pub fn from_json_object(object: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            entries: object
                .into_iter()
                .map(|(name, value)| (name, Value::Scalar(value)))
                .collect(),
        }
    }

    /// Sets `column`, replacing an existing entry in place.
    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        match self.entries.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((column, value)),
        }
    }

    /// Returns the entry stored under `column`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Returns the plain column value stored under `column`.
    pub fn scalar(&self, column: &str) -> Option<&serde_json::Value> {
        self.get(column).and_then(Value::as_scalar)
    }

    /// Iterates over the entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Column names in order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the row has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if any entry carries related rows.
    pub fn has_nested(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, value)| !matches!(value, Value::Scalar(_)))
    }

    /// Attaches `related`, fetched by following relation `name` in `direction`.
    ///
    /// Child-direction payloads accumulate in an array; a second parent row for
    /// the same relation is ignored with a warning.
    ///
    /// # Errors
    /// Returns [`IngressError::ColumnCollision`] if a plain column, or a payload
    /// of the other direction, already uses `name`.
    pub fn nest(&mut self, table: &str, name: &str, direction: Direction, related: Row) -> Result<()> {
        let collision = || IngressError::ColumnCollision {
            table: table.to_string(),
            name: name.to_string(),
        };

        match (self.entries.iter_mut().find(|(n, _)| n == name), direction) {
            (None, Direction::ToChild) => {
                self.entries.push((name.to_string(), Value::Rows(vec![related])));
            }
            (None, Direction::ToParent) => {
                self.entries.push((name.to_string(), Value::Row(related)));
            }
            (Some((_, Value::Rows(rows))), Direction::ToChild) => rows.push(related),
            (Some((_, Value::Row(_))), Direction::ToParent) => {
                warn!(
                    "Relation '{}' returned more than one parent row for table '{}', keeping the first",
                    name, table
                );
            }
            (Some(_), _) => return Err(collision()),
        }

        Ok(())
    }

    /// Drops plain columns the table metadata marks as not exported.
    pub fn retain_exported(&mut self, table: &Table) {
        if table.columns.is_empty() {
            return;
        }
        self.entries.retain(|(name, value)| {
            !matches!(value, Value::Scalar(_)) || table.exports(name)
        });
    }

    /// Canonical primary-key tuple of this row within `table`.
    ///
    /// Tables without key metadata deduplicate on every plain column.
    pub fn key_tuple(&self, table: &Table) -> String {
        let tuple: Vec<serde_json::Value> = if table.keys.is_empty() {
            self.entries
                .iter()
                .filter_map(|(name, value)| {
                    value.as_scalar().map(|v| {
                        serde_json::Value::Array(vec![
                            serde_json::Value::String(name.clone()),
                            v.clone(),
                        ])
                    })
                })
                .collect()
        } else {
            table
                .keys
                .iter()
                .map(|key| self.scalar(key).cloned().unwrap_or(serde_json::Value::Null))
                .collect()
        };
        serde_json::Value::Array(tuple).to_string()
    }

    /// Converts the row, nested payloads included, into a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}

/// Constraints applied to a single table read.
///
/// Equality values are paired positionally for composite keys. `limit` is only
/// honoured for the root read of a pull; follow filters never carry one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Column equality constraints
    #[serde(default)]
    pub values: Vec<(String, serde_json::Value)>,
    /// Maximum number of rows to read
    #[serde(default)]
    pub limit: Option<u64>,
    /// Free-form predicate, interpreted by the data source
    #[serde(default)]
    pub predicate: Option<String>,
    /// Read distinct rows only
    #[serde(default)]
    pub distinct: bool,
}

impl Filter {
    /// Creates an unconstrained filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to add an equality constraint.
    pub fn with_value(mut self, column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    /// Builder method to set the row limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Builder method to set the free-form predicate.
    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    /// Builder method to request distinct rows.
    pub fn with_distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Builds the filter reading the rows related to `row` through `relation`.
    ///
    /// Following towards the children constrains `child_keys` to the row's
    /// `parent_keys` values, and the reverse for the parent direction. Returns
    /// `None` when any key value is missing or null, since nothing can match.
    pub fn follow(relation: &Relation, direction: Direction, row: &Row) -> Option<Self> {
        let (from_keys, to_keys) = match direction {
            Direction::ToChild => (&relation.parent_keys, &relation.child_keys),
            Direction::ToParent => (&relation.child_keys, &relation.parent_keys),
        };

        let mut filter = Self::new();
        for (from, to) in from_keys.iter().zip(to_keys) {
            match row.scalar(from) {
                Some(value) if !value.is_null() => filter.values.push((to.clone(), value.clone())),
                _ => return None,
            }
        }
        Some(filter)
    }

    /// Returns true if every equality constraint holds for `row`.
    pub fn matches(&self, row: &Row) -> bool {
        self.values
            .iter()
            .all(|(column, expected)| row.scalar(column) == Some(expected))
    }
}
