use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{CanonicalName, ModelName};

/// Where a column's values come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Raw metadata loaded with the dataset.
    Metadata,
    /// Feature derived by a distill function before model inference.
    Predistill,
    /// Feature derived by a distill function from a model's output.
    Postdistill,
    /// A model's raw output.
    Output,
    /// High-dimensional embedding produced by a model.
    Embedding,
}

impl ColumnKind {
    /// Marker token used in canonical strings (and in encoder exclusions).
    pub fn marker(self) -> &'static str {
        match self {
            ColumnKind::Metadata => "METADATA",
            ColumnKind::Predistill => "PREDISTILL",
            ColumnKind::Postdistill => "POSTDISTILL",
            ColumnKind::Output => "OUTPUT",
            ColumnKind::Embedding => "EMBEDDING",
        }
    }
}

/// Typed identifier for one dataset column.
///
/// Columns are immutable value objects created when the dataset and model set
/// are registered. Two columns are the same column iff their canonical
/// strings match; the canonical string is the only key used to locate data.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    /// Lifecycle stage the column belongs to.
    pub kind: ColumnKind,
    /// Bare column name as the user knows it.
    pub name: String,
    /// Model that produced this column, for output/distill/embedding kinds.
    pub model: Option<ModelName>,
}

impl Column {
    /// Build a raw metadata column.
    pub fn metadata(name: impl Into<String>) -> Self {
        Self {
            kind: ColumnKind::Metadata,
            name: name.into(),
            model: None,
        }
    }

    /// Build an output column for one model.
    pub fn output(name: impl Into<String>, model: impl Into<ModelName>) -> Self {
        Self {
            kind: ColumnKind::Output,
            name: name.into(),
            model: Some(model.into()),
        }
    }

    /// Canonical string form, a pure function of the column's fields.
    pub fn canonical_string(&self) -> CanonicalName {
        let mut out = String::from(self.kind.marker());
        out.push_str(&self.name);
        if let Some(model) = &self.model {
            out.push_str(model);
        }
        out
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// Find the column whose canonical string equals `canonical`.
///
/// Absent lookups return `None`; callers must tolerate derived columns that
/// do not exist for every model.
pub fn lookup_by_canonical<'a>(columns: &'a [Column], canonical: &str) -> Option<&'a Column> {
    columns
        .iter()
        .find(|column| column.canonical_string() == canonical)
}

/// Resolve a bare column name to its canonical string, if registered.
pub fn lookup_canonical_by_name(columns: &[Column], name: &str) -> Option<CanonicalName> {
    columns
        .iter()
        .find(|column| column.name == name)
        .map(Column::canonical_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_is_a_pure_function_of_fields() {
        let a = Column::metadata("region");
        let b = Column::metadata("region");
        assert_eq!(a.canonical_string(), b.canonical_string());
        assert_eq!(a.canonical_string(), "METADATAregion");

        let out = Column::output("label", "resnet50");
        assert_eq!(out.canonical_string(), "OUTPUTlabelresnet50");
        assert_eq!(out.to_string(), out.canonical_string());
    }

    #[test]
    fn columns_with_different_models_are_distinct() {
        let a = Column::output("label", "model_a");
        let b = Column::output("label", "model_b");
        assert_ne!(a.canonical_string(), b.canonical_string());
    }

    #[test]
    fn lookups_return_none_when_absent() {
        let columns = vec![Column::metadata("region"), Column::output("label", "m")];
        assert!(lookup_by_canonical(&columns, "METADATAregion").is_some());
        assert!(lookup_by_canonical(&columns, "METADATAmissing").is_none());
        assert_eq!(
            lookup_canonical_by_name(&columns, "label"),
            Some("OUTPUTlabelm".to_string())
        );
        assert_eq!(lookup_canonical_by_name(&columns, "missing"), None);
    }
}
