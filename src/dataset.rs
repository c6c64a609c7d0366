use std::cmp::Ordering;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::HarnessError;
use crate::types::{CanonicalName, RowId};

/// One cell of the tabular dataset.
///
/// Equality works across the heterogeneous value types surfaced by the
/// categorical encoder's inverse mapping; `Int` and `Float` compare
/// numerically.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    /// Textual value.
    Str(String),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
    /// Missing value.
    Null,
}

impl CellValue {
    /// Returns `true` for values the categorical encoder accepts.
    pub fn is_categorical(&self) -> bool {
        matches!(self, CellValue::Str(_) | CellValue::Bool(_))
    }

    /// Ordered comparison, defined only between compatible types.
    pub fn partial_cmp_value(&self, other: &CellValue) -> Option<Ordering> {
        match (self, other) {
            (CellValue::Str(a), CellValue::Str(b)) => Some(a.cmp(b)),
            (CellValue::Int(a), CellValue::Int(b)) => Some(a.cmp(b)),
            (CellValue::Float(a), CellValue::Float(b)) => a.partial_cmp(b),
            (CellValue::Int(a), CellValue::Float(b)) => (*a as f64).partial_cmp(b),
            (CellValue::Float(a), CellValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (CellValue::Bool(a), CellValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Token used when slice names are synthesized from discovered values.
    pub fn token(&self) -> String {
        match self {
            CellValue::Str(v) => v.clone(),
            CellValue::Int(v) => v.to_string(),
            CellValue::Float(v) => v.to_string(),
            CellValue::Bool(v) => v.to_string(),
            CellValue::Null => "null".to_string(),
        }
    }
}

impl PartialEq for CellValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CellValue::Null, CellValue::Null) => true,
            _ => self.partial_cmp_value(other) == Some(Ordering::Equal),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Str(value.to_string())
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

/// Immutable column-oriented table keyed by canonical column strings.
///
/// The dataset is treated as a fixed snapshot for the duration of a run;
/// row identifiers are dense indexes into the column vectors.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    columns: IndexMap<CanonicalName, Vec<CellValue>>,
    row_count: usize,
}

impl Dataset {
    /// Build a dataset from named columns, validating uniform length.
    pub fn new(columns: IndexMap<CanonicalName, Vec<CellValue>>) -> Result<Self, HarnessError> {
        let mut row_count = None;
        for (name, values) in &columns {
            match row_count {
                None => row_count = Some(values.len()),
                Some(expected) if expected != values.len() => {
                    return Err(HarnessError::Configuration(format!(
                        "column '{name}' has {} rows, expected {expected}",
                        values.len()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(Self {
            row_count: row_count.unwrap_or(0),
            columns,
        })
    }

    /// Number of rows in the snapshot.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Canonical names of all columns in registration order.
    pub fn column_names(&self) -> impl Iterator<Item = &CanonicalName> {
        self.columns.keys()
    }

    /// Full column by canonical name.
    pub fn column(&self, canonical: &str) -> Option<&[CellValue]> {
        self.columns.get(canonical).map(Vec::as_slice)
    }

    /// Single cell by canonical name and row.
    pub fn value(&self, canonical: &str, row: RowId) -> Option<&CellValue> {
        self.columns.get(canonical).and_then(|values| values.get(row))
    }

    /// All row identifiers of the snapshot.
    pub fn all_rows(&self) -> impl Iterator<Item = RowId> {
        0..self.row_count
    }
}

/// Borrowed row-subset of a dataset handed to user functions.
///
/// User functions address columns by canonical name through the options
/// record, and see only the rows of the slice under evaluation.
pub struct DatasetView<'a> {
    dataset: &'a Dataset,
    rows: Vec<RowId>,
}

impl<'a> DatasetView<'a> {
    /// View over an explicit row subset.
    pub fn new(dataset: &'a Dataset, rows: Vec<RowId>) -> Self {
        Self { dataset, rows }
    }

    /// View over every row of the dataset (the "overall" slice).
    pub fn full(dataset: &'a Dataset) -> Self {
        let rows = dataset.all_rows().collect();
        Self { dataset, rows }
    }

    /// Number of rows in the view.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// The view's row identifiers, in view order.
    pub fn rows(&self) -> &[RowId] {
        &self.rows
    }

    /// Cell at a view-relative position.
    pub fn value(&self, canonical: &str, position: usize) -> Option<&CellValue> {
        let row = *self.rows.get(position)?;
        self.dataset.value(canonical, row)
    }

    /// Materialize one column restricted to the view's rows.
    pub fn column_values(&self, canonical: &str) -> Result<Vec<CellValue>, HarnessError> {
        let column = self
            .dataset
            .column(canonical)
            .ok_or_else(|| HarnessError::ColumnNotFound(canonical.to_string()))?;
        Ok(self.rows.iter().map(|row| column[*row].clone()).collect())
    }
}
