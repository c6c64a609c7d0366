use std::io;

use thiserror::Error;

use crate::types::{CanonicalName, SliceName};

/// Error type for configuration, user-function, and channel failures.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid registration or request parameters.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A canonical column name resolved to nothing in the dataset.
    #[error("column '{0}' not found in dataset")]
    ColumnNotFound(CanonicalName),
    /// A slice name resolved to nothing in the registry.
    #[error("slice '{0}' is not registered")]
    SliceNotFound(SliceName),
    /// Every candidate column was excluded or non-categorical.
    #[error("no searchable categorical features survive exclusion")]
    NoSearchableFeatures,
    /// A registered model, metric, or distill function failed.
    #[error("user function '{function}' failed: {reason}")]
    UserFunction {
        /// Name the function was registered under.
        function: String,
        /// The failure it reported.
        reason: String,
    },
    /// The duplex channel closed or timed out mid-exchange.
    #[error("result channel fault: {0}")]
    Channel(String),
    /// Filesystem failure surfaced by a collaborator.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// JSON serialization failure on the wire path.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
