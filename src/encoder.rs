//! Reversible categorical encoding feeding the slice-discovery search.
//!
//! The search operates on dense integer codes; `code_to_value` is a total
//! inverse so discovered constraints can be rendered back into predicates
//! over the original values.

use tracing::debug;

use crate::column::{Column, ColumnKind};
use crate::dataset::{CellValue, Dataset};
use crate::errors::HarnessError;
use crate::types::{CanonicalName, CategoryCode};

/// Markers that exclude a column from the search space: structurally
/// irrelevant (embeddings, identifiers) or target-leaking (outputs,
/// post-distill features).
const EXCLUDED_MARKERS: [&str; 3] = ["EMBEDDING", "POSTDISTILL", "OUTPUT"];

/// One encoded categorical column.
#[derive(Clone, Debug)]
pub struct EncodedColumn {
    /// Dense codes starting at 0, one per row.
    pub codes: Vec<CategoryCode>,
    /// Exact inverse mapping: `code_to_value[code]` is the original value.
    pub code_to_value: Vec<CellValue>,
}

/// Encoded categorical view handed to the discovery engine.
#[derive(Clone, Debug)]
pub struct EncodedTable {
    /// Canonical names of the encoded columns, in dataset order.
    pub column_names: Vec<CanonicalName>,
    /// Encoded columns aligned with `column_names`.
    pub columns: Vec<EncodedColumn>,
    /// Number of rows in the underlying dataset.
    pub row_count: usize,
}

/// Returns `true` when `canonical` is eligible for the search space.
pub fn is_searchable(canonical: &str, id_column: &str) -> bool {
    if canonical == id_column {
        return false;
    }
    !EXCLUDED_MARKERS
        .iter()
        .any(|marker| canonical.contains(marker))
}

/// Encode one column of categorical values into dense integer codes.
///
/// The same distinct value always maps to the same code within one call;
/// first occurrence order assigns codes.
pub fn encode_column(values: &[CellValue]) -> EncodedColumn {
    let mut code_to_value: Vec<CellValue> = Vec::new();
    let mut codes = Vec::with_capacity(values.len());
    for value in values {
        let code = match code_to_value.iter().position(|known| known == value) {
            Some(existing) => existing,
            None => {
                code_to_value.push(value.clone());
                code_to_value.len() - 1
            }
        };
        codes.push(code);
    }
    EncodedColumn {
        codes,
        code_to_value,
    }
}

/// Encode every searchable categorical column of the dataset.
///
/// Filtering (exclusion markers, identifier column, non-categorical dtypes)
/// happens here, before encoding; an empty result is reported by callers as
/// [`HarnessError::NoSearchableFeatures`], not here.
pub fn encode_searchable(
    dataset: &Dataset,
    id_column: &str,
) -> Result<EncodedTable, HarnessError> {
    let mut column_names = Vec::new();
    let mut columns = Vec::new();
    for canonical in dataset.column_names() {
        if !is_searchable(canonical, id_column) {
            continue;
        }
        let values = dataset
            .column(canonical)
            .ok_or_else(|| HarnessError::ColumnNotFound(canonical.clone()))?;
        if !values.iter().all(CellValue::is_categorical) {
            continue;
        }
        column_names.push(canonical.clone());
        columns.push(encode_column(values));
    }
    debug!(
        searchable = column_names.len(),
        rows = dataset.row_count(),
        "encoded categorical search space"
    );
    Ok(EncodedTable {
        column_names,
        columns,
        row_count: dataset.row_count(),
    })
}

/// Canonical id-column guess used when the caller registered no id column:
/// anything whose metadata name is literally `id`.
pub fn default_id_column(columns: &[Column]) -> Option<CanonicalName> {
    columns
        .iter()
        .find(|column| column.kind == ColumnKind::Metadata && column.name == "id")
        .map(Column::canonical_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::Column;
    use indexmap::IndexMap;

    #[test]
    fn encode_round_trips_every_value() {
        let values: Vec<CellValue> =
            vec!["b".into(), "a".into(), "b".into(), true.into(), "a".into()];
        let encoded = encode_column(&values);
        assert_eq!(encoded.codes.len(), values.len());
        for (code, value) in encoded.codes.iter().zip(&values) {
            assert_eq!(&encoded.code_to_value[*code], value);
        }
        // Dense codes from zero, one per distinct value.
        assert_eq!(encoded.code_to_value.len(), 3);
        assert_eq!(encoded.codes[0], 0);
        assert_eq!(encoded.codes[1], 1);
        assert_eq!(encoded.codes[2], 0);
    }

    #[test]
    fn exclusion_markers_remove_columns_before_encoding() {
        assert!(is_searchable("METADATAregion", "METADATAid"));
        assert!(!is_searchable("METADATAid", "METADATAid"));
        assert!(!is_searchable("OUTPUTlabelresnet", "METADATAid"));
        assert!(!is_searchable("POSTDISTILLbrightnessresnet", "METADATAid"));
        assert!(!is_searchable("EMBEDDINGresnet", "METADATAid"));
    }

    #[test]
    fn encode_searchable_skips_numeric_and_excluded_columns() {
        let mut columns = IndexMap::new();
        columns.insert(
            Column::metadata("region").canonical_string(),
            vec!["A".into(), "B".into()],
        );
        columns.insert(
            Column::metadata("score").canonical_string(),
            vec![CellValue::Float(0.5), CellValue::Float(0.2)],
        );
        columns.insert(
            Column::output("label", "m").canonical_string(),
            vec!["x".into(), "y".into()],
        );
        let dataset = Dataset::new(columns).unwrap();
        let table = encode_searchable(&dataset, "METADATAid").unwrap();
        assert_eq!(table.column_names, vec!["METADATAregion".to_string()]);
        assert_eq!(table.row_count, 2);
    }

    #[test]
    fn default_id_column_finds_metadata_id() {
        let columns = vec![Column::metadata("id"), Column::metadata("region")];
        assert_eq!(
            default_id_column(&columns),
            Some("METADATAid".to_string())
        );
        assert_eq!(default_id_column(&columns[1..]), None);
    }
}
