use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::errors::HarnessError;
use crate::filters::{self, FilterPredicateGroup};
use crate::types::{RowId, SliceName};

/// Reserved name for the implicit whole-dataset slice.
pub const OVERALL_SLICE: &str = "overall";

/// A named subset of dataset rows defined by a filter predicate tree.
///
/// Immutable once constructed; the row-id set is derived lazily from the
/// predicate group against the current dataset snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    /// Unique name, also a cache-key component.
    pub name: SliceName,
    /// Organizational grouping only; no semantics.
    pub folder: String,
    /// Predicate tree defining membership.
    pub predicates: FilterPredicateGroup,
}

impl Slice {
    /// The implicit slice covering every row.
    pub fn overall() -> Self {
        Self {
            name: OVERALL_SLICE.to_string(),
            folder: String::new(),
            predicates: FilterPredicateGroup::overall(),
        }
    }

    /// Materialize the slice's row identifiers against `dataset`.
    pub fn row_ids(&self, dataset: &Dataset) -> BTreeSet<RowId> {
        filters::evaluate(&self.predicates, dataset)
    }
}

/// Slice registry keyed by unique name, registration order preserved.
#[derive(Default)]
pub struct SliceRegistry {
    slices: IndexMap<SliceName, Slice>,
}

impl SliceRegistry {
    /// New registry seeded with the implicit overall slice.
    pub fn new() -> Self {
        let mut slices = IndexMap::new();
        let overall = Slice::overall();
        slices.insert(overall.name.clone(), overall);
        Self { slices }
    }

    /// Register a slice; names must be unique within the run.
    pub fn register(&mut self, slice: Slice) -> Result<(), HarnessError> {
        if self.slices.contains_key(&slice.name) {
            return Err(HarnessError::Configuration(format!(
                "slice name '{}' is already registered",
                slice.name
            )));
        }
        self.slices.insert(slice.name.clone(), slice);
        Ok(())
    }

    /// Look up a slice by name.
    pub fn get(&self, name: &str) -> Option<&Slice> {
        self.slices.get(name)
    }

    /// Remove a slice; the overall slice cannot be removed.
    pub fn remove(&mut self, name: &str) -> Option<Slice> {
        if name == OVERALL_SLICE {
            return None;
        }
        self.slices.shift_remove(name)
    }

    /// Iterate slices in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Slice> {
        self.slices.values()
    }

    /// Slice names in registration order.
    pub fn names(&self) -> Vec<SliceName> {
        self.slices.keys().cloned().collect()
    }

    /// Number of registered slices, the overall slice included.
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// True only before construction seeds the overall slice.
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}
