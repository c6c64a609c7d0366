#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Single-flight metric result cache.
pub mod cache;
/// Worker/responder duplex channel and wire types.
pub mod channel;
/// Typed dataset column identifiers and canonical-string lookups.
pub mod column;
/// Immutable tabular dataset snapshot and row-subset views.
pub mod dataset;
/// Automatic discovery of under-performing slices.
pub mod discovery;
/// Reversible categorical encoding for the search space.
pub mod encoder;
/// User-function registry (models, metrics, distills).
pub mod functions;
/// Filter predicate trees and evaluation.
pub mod filters;
/// Live result subscriptions with change detection.
pub mod server;
/// Named slices and their registry.
pub mod slices;
/// Shared type aliases.
pub mod types;
/// The background computation worker.
pub mod worker;

mod errors;

pub use cache::{CacheEntry, MetricCache, MetricKey, MetricOutcome};
pub use channel::{
    pair, ClientConn, Request, Response, ResultRow, SliceInfo, SlicerInfo, TesterInfo, WorkerConn,
};
pub use column::{lookup_by_canonical, lookup_canonical_by_name, Column, ColumnKind};
pub use dataset::{CellValue, Dataset, DatasetView};
pub use discovery::{DiscoveryRequest, DiscoveryResult, SliceFinder};
pub use encoder::{
    default_id_column, encode_column, encode_searchable, is_searchable, EncodedColumn,
    EncodedTable,
};
pub use errors::HarnessError;
pub use filters::{
    evaluate, FilterOp, FilterPredicate, FilterPredicateGroup, Join, PredicateNode,
};
pub use functions::{
    DistillFn, DistillReturn, FunctionOptions, FunctionRegistry, MetricFn, MetricReturn, ModelFn,
    ModelReturn, SLICE_FINDER_ACCURACY,
};
pub use server::{Notification, ServerHandle, POLL_INTERVAL};
pub use slices::{Slice, SliceRegistry, OVERALL_SLICE};
pub use types::{
    CanonicalName, CategoryCode, MetricName, ModelName, RowId, SliceName, StatusMessage,
};
pub use worker::EvalWorker;
