//! The computation worker.
//!
//! `EvalWorker` exclusively owns the dataset snapshot, the column model, the
//! slice and function registries, and the metric cache. The front-facing
//! responder reaches it only through the result channel; no mutable state is
//! shared across the two actors.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::{MetricCache, MetricKey, MetricOutcome};
use crate::channel::{Request, Response, ResultRow, SliceInfo, SlicerInfo, TesterInfo, WorkerConn};
use crate::column::{Column, ColumnKind};
use crate::dataset::{Dataset, DatasetView};
use crate::discovery::{discover_slices, DiscoveryRequest, DiscoveryResult, SliceFinder};
use crate::encoder::{default_id_column, encode_searchable};
use crate::errors::HarnessError;
use crate::functions::{
    DistillFn, FunctionOptions, FunctionRegistry, MetricFn, MetricReturn, SLICE_FINDER_ACCURACY,
};
use crate::slices::{Slice, SliceRegistry};
use crate::types::{MetricName, ModelName, RowId, SliceName, StatusMessage};

/// Function source label reported over the channel for registered callables.
const PROGRAMMATIC_SOURCE: &str = "programmatic";

/// Rows returned by a `GetSample` response.
const DEFAULT_SAMPLE_ROWS: usize = 30;

/// Background computation actor owning dataset, cache, and discovery.
pub struct EvalWorker {
    dataset: Dataset,
    columns: Vec<Column>,
    registry: FunctionRegistry,
    options: FunctionOptions,
    slices: SliceRegistry,
    cache: MetricCache,
    sample_rows: usize,
    status: Mutex<WorkerStatus>,
}

#[derive(Clone, Debug)]
struct WorkerStatus {
    message: StatusMessage,
    updated_at: DateTime<Utc>,
}

impl EvalWorker {
    /// Worker over one dataset snapshot, column model, and function registry.
    ///
    /// An empty `id_column` in the options falls back to the metadata column
    /// literally named `id`, when one exists.
    pub fn new(
        dataset: Dataset,
        columns: Vec<Column>,
        registry: FunctionRegistry,
        mut options: FunctionOptions,
    ) -> Self {
        if options.id_column.is_empty() {
            if let Some(id_column) = default_id_column(&columns) {
                options.id_column = id_column;
            }
        }
        Self {
            dataset,
            columns,
            registry,
            options,
            slices: SliceRegistry::new(),
            cache: MetricCache::new(),
            sample_rows: DEFAULT_SAMPLE_ROWS,
            status: Mutex::new(WorkerStatus {
                message: "idle".to_string(),
                updated_at: Utc::now(),
            }),
        }
    }

    /// Models known to the run: every distinct producer of an output column.
    pub fn models(&self) -> Vec<ModelName> {
        let mut models = Vec::new();
        for column in &self.columns {
            if column.kind != ColumnKind::Output {
                continue;
            }
            if let Some(model) = &column.model {
                if !models.contains(model) {
                    models.push(model.clone());
                }
            }
        }
        models
    }

    /// Register a user-defined slice; duplicate names are rejected.
    pub fn register_slice(&mut self, slice: Slice) -> Result<(), HarnessError> {
        self.cache.invalidate_slice(&slice.name);
        self.slices.register(slice)
    }

    /// Register every slice of a discovery result.
    pub fn register_discovered(&mut self, result: &DiscoveryResult) -> Result<(), HarnessError> {
        for slice in &result.slices_of_interest {
            self.register_slice(slice.clone())?;
        }
        Ok(())
    }

    /// Remove a slice and drop only its cache keys.
    pub fn remove_slice(&mut self, name: &str) -> Option<Slice> {
        let removed = self.slices.remove(name);
        if removed.is_some() {
            self.cache.invalidate_slice(name);
        }
        removed
    }

    /// Add or replace a metric function, invalidating only its keys.
    pub fn add_metric(&mut self, name: impl Into<MetricName>, function: MetricFn) {
        let name = name.into();
        self.cache.invalidate_metric(&name);
        self.registry.register_metric(name, function);
    }

    /// Add or replace a distill function.
    pub fn add_distill(&mut self, name: impl Into<String>, function: DistillFn) {
        self.registry.register_distill(name, function);
    }

    /// The slice registry, overall slice included.
    pub fn slices(&self) -> &SliceRegistry {
        &self.slices
    }

    /// The metric result cache.
    pub fn cache(&self) -> &MetricCache {
        &self.cache
    }

    /// Rebind the base options to one model's output and distill columns.
    fn options_for_model(&self, model: &str) -> Result<FunctionOptions, HarnessError> {
        let output = self
            .columns
            .iter()
            .find(|column| {
                column.kind == ColumnKind::Output && column.model.as_deref() == Some(model)
            })
            .ok_or_else(|| {
                HarnessError::Configuration(format!("model '{model}' has no output column"))
            })?;
        let mut distill_columns = IndexMap::new();
        for column in &self.columns {
            let model_scoped = match column.kind {
                ColumnKind::Predistill => {
                    column.model.is_none() || column.model.as_deref() == Some(model)
                }
                ColumnKind::Postdistill => column.model.as_deref() == Some(model),
                _ => false,
            };
            if model_scoped {
                distill_columns.insert(column.name.clone(), column.canonical_string());
            }
        }
        Ok(self
            .options
            .for_model(output.canonical_string(), distill_columns))
    }

    /// Per-row error signal for discovery, from the designated metric.
    fn error_signal(&self, model: &str) -> Result<Vec<f64>, HarnessError> {
        let options = self.options_for_model(model)?;
        let view = DatasetView::full(&self.dataset);
        let result = self
            .registry
            .call_metric(SLICE_FINDER_ACCURACY, &view, &options)?;
        let errors = result.error_rate.ok_or_else(|| {
            HarnessError::Configuration(format!(
                "metric '{SLICE_FINDER_ACCURACY}' returned no per-row error signal"
            ))
        })?;
        if errors.len() != self.dataset.row_count() {
            return Err(HarnessError::Configuration(format!(
                "error signal has {} entries for {} rows",
                errors.len(),
                self.dataset.row_count()
            )));
        }
        Ok(errors)
    }

    /// Run slice discovery for one model.
    ///
    /// Synchronous and atomic: either a complete `DiscoveryResult` is
    /// returned or an error; nothing is registered or cached on failure.
    pub fn run_discovery(
        &self,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveryResult, HarnessError> {
        let minimum_size = usize::try_from(request.minimum_size).unwrap_or(0);
        let depth = usize::try_from(request.depth).unwrap_or(0);
        let errors = self.error_signal(&request.model)?;
        let table = encode_searchable(&self.dataset, &self.options.id_column)?;
        let finder = SliceFinder::new(minimum_size, depth);
        debug!(
            model = %request.model,
            column = %request.column_name,
            minimum_size,
            depth,
            "running slice discovery"
        );
        discover_slices(&finder, &table, &errors, &self.columns)
    }

    /// Compute (or fetch) every result row: one per (tester, slice), with a
    /// metric value per model.
    ///
    /// Distinct cache keys fan out across a worker pool sized to available
    /// cores; same-key requests coalesce in the cache. A failing user metric
    /// is recorded for its key and siblings continue.
    pub fn results(&self) -> Vec<ResultRow> {
        let metrics: Vec<MetricName> = self
            .registry
            .metric_names()
            .into_iter()
            .filter(|name| name != SLICE_FINDER_ACCURACY)
            .collect();
        let models = self.models();
        self.set_status("computing results");

        // Materialize each slice once, in registry order.
        let slice_rows: Vec<(SliceName, Vec<RowId>)> = self
            .slices
            .iter()
            .map(|slice| {
                let rows: Vec<RowId> = slice.row_ids(&self.dataset).into_iter().collect();
                (slice.name.clone(), rows)
            })
            .collect();

        let mut keys: Vec<(SliceName, ModelName, MetricName)> = Vec::new();
        for (slice_name, _) in &slice_rows {
            for model in &models {
                for metric in &metrics {
                    keys.push((slice_name.clone(), model.clone(), metric.clone()));
                }
            }
        }
        self.compute_keys(&slice_rows, keys);

        let mut rows = Vec::with_capacity(metrics.len() * slice_rows.len());
        for metric in &metrics {
            for (slice_name, slice_row_ids) in &slice_rows {
                let mut model_results = IndexMap::new();
                for model in &models {
                    let key = MetricKey {
                        slice: slice_name.clone(),
                        model: model.clone(),
                        metric: metric.clone(),
                    };
                    let value = match self.cache.entry(&key).map(|entry| entry.outcome) {
                        Some(MetricOutcome::Ready(result)) => Some(result.metric),
                        _ => None,
                    };
                    model_results.insert(model.clone(), value);
                }
                rows.push(ResultRow {
                    tester_name: metric.clone(),
                    slice_name: slice_name.clone(),
                    slice_size: slice_row_ids.len(),
                    model_results,
                });
            }
        }
        self.set_status("done");
        rows
    }

    /// Drain the key queue across a scoped worker pool.
    fn compute_keys(
        &self,
        slice_rows: &[(SliceName, Vec<RowId>)],
        keys: Vec<(SliceName, ModelName, MetricName)>,
    ) {
        if keys.is_empty() {
            return;
        }
        let parallelism = thread::available_parallelism()
            .map(|value| value.get())
            .unwrap_or(1)
            .min(keys.len());
        let queue = Mutex::new(VecDeque::from(keys));
        thread::scope(|scope| {
            for _ in 0..parallelism {
                scope.spawn(|| loop {
                    let next = {
                        let mut queue = queue.lock().expect("result queue poisoned");
                        queue.pop_front()
                    };
                    let Some((slice, model, metric)) = next else {
                        break;
                    };
                    let Some((_, rows)) = slice_rows.iter().find(|(name, _)| *name == slice) else {
                        continue;
                    };
                    let key = MetricKey {
                        slice: slice.clone(),
                        model: model.clone(),
                        metric: metric.clone(),
                    };
                    self.cache.get_or_compute(&key, || {
                        self.compute_metric(&metric, &model, rows.clone())
                    });
                });
            }
        });
    }

    fn compute_metric(
        &self,
        metric: &str,
        model: &str,
        rows: Vec<RowId>,
    ) -> Result<MetricReturn, HarnessError> {
        let options = self.options_for_model(model)?;
        let view = DatasetView::new(&self.dataset, rows);
        self.registry.call_metric(metric, &view, &options)
    }

    fn set_status(&self, message: &str) {
        let mut status = self.status.lock().expect("worker status poisoned");
        status.message = message.to_string();
        status.updated_at = Utc::now();
    }

    /// Current status line surfaced with `GetResults` responses.
    pub fn status(&self) -> StatusMessage {
        self.status
            .lock()
            .expect("worker status poisoned")
            .message
            .clone()
    }

    /// When the status line last changed.
    pub fn status_updated_at(&self) -> DateTime<Utc> {
        self.status
            .lock()
            .expect("worker status poisoned")
            .updated_at
    }

    /// Slicer listings: distill functions plus the slices filed under them.
    fn slicers(&self) -> Vec<SlicerInfo> {
        self.registry
            .distill_names()
            .into_iter()
            .map(|name| {
                let slices = self
                    .slices
                    .iter()
                    .filter(|slice| slice.folder == name)
                    .map(|slice| slice.name.clone())
                    .collect();
                SlicerInfo {
                    name,
                    source: PROGRAMMATIC_SOURCE.to_string(),
                    slices,
                }
            })
            .collect()
    }

    /// Tester listings: metric functions minus the discovery error signal.
    fn testers(&self) -> Vec<TesterInfo> {
        self.registry
            .metric_names()
            .into_iter()
            .filter(|name| name != SLICE_FINDER_ACCURACY)
            .map(|name| TesterInfo {
                name,
                source: PROGRAMMATIC_SOURCE.to_string(),
            })
            .collect()
    }

    fn slice_infos(&self) -> Vec<SliceInfo> {
        self.slices
            .iter()
            .map(|slice| SliceInfo {
                name: slice.name.clone(),
                size: slice.row_ids(&self.dataset).len(),
            })
            .collect()
    }

    /// Serialize rows of the dataset as a JSON array of objects.
    fn rows_json(&self, rows: &[RowId]) -> Result<String, HarnessError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut object = Map::new();
            for canonical in self.dataset.column_names() {
                let value = self
                    .dataset
                    .value(canonical, *row)
                    .ok_or_else(|| HarnessError::ColumnNotFound(canonical.clone()))?;
                object.insert(canonical.clone(), serde_json::to_value(value)?);
            }
            out.push(Value::Object(object));
        }
        Ok(serde_json::to_string(&Value::Array(out))?)
    }

    fn data_json(&self) -> Result<String, HarnessError> {
        let rows: Vec<RowId> = self.dataset.all_rows().collect();
        self.rows_json(&rows)
    }

    fn sample_json(&self, slice_name: &str) -> Result<String, HarnessError> {
        let slice = self
            .slices
            .get(slice_name)
            .ok_or_else(|| HarnessError::SliceNotFound(slice_name.to_string()))?;
        let rows: Vec<RowId> = slice
            .row_ids(&self.dataset)
            .into_iter()
            .take(self.sample_rows)
            .collect();
        self.rows_json(&rows)
    }

    /// Serve requests until every client endpoint is gone.
    ///
    /// A request that cannot be answered (unknown slice, serialization
    /// fault) receives no response and is expected to time out client-side,
    /// so channel framing stays intact for subsequent requests.
    pub fn serve(&mut self, conn: WorkerConn) {
        while let Some(request) = conn.next_request() {
            let response = match &request {
                Request::GetSlicers => Ok(Response::Slicers(self.slicers())),
                Request::GetTesters => Ok(Response::Testers(self.testers())),
                Request::GetSlices => Ok(Response::Slices(self.slice_infos())),
                Request::GetData => self.data_json().map(Response::Data),
                Request::GetSample(slice) => self.sample_json(slice).map(Response::Sample),
                Request::GetResults => {
                    let rows = self.results();
                    Ok(Response::Results {
                        status: self.status(),
                        rows,
                    })
                }
            };
            match response {
                Ok(response) => {
                    if conn.respond(response).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(?request, error = %err, "dropping unanswerable request");
                }
            }
        }
        debug!("worker request loop terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::CellValue;
    use crate::filters::{FilterOp, FilterPredicate, FilterPredicateGroup, PredicateNode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// 10 rows, `region` B for rows 0-3, outputs wrong exactly on region B.
    fn fixture() -> EvalWorker {
        let id = Column::metadata("id");
        let label = Column::metadata("label");
        let region = Column::metadata("region");
        let output = Column::output("label", "m1");

        let mut columns = IndexMap::new();
        columns.insert(
            id.canonical_string(),
            (0..10).map(|idx| CellValue::Int(idx)).collect(),
        );
        columns.insert(
            label.canonical_string(),
            (0..10).map(|_| CellValue::from("yes")).collect(),
        );
        columns.insert(
            region.canonical_string(),
            (0..10)
                .map(|idx| if idx < 4 { "B".into() } else { "A".into() })
                .collect(),
        );
        columns.insert(
            output.canonical_string(),
            (0..10)
                .map(|idx| if idx < 4 { "no".into() } else { "yes".into() })
                .collect(),
        );
        let dataset = Dataset::new(columns).unwrap();

        let options = FunctionOptions {
            id_column: id.canonical_string(),
            data_column: label.canonical_string(),
            label_column: label.canonical_string(),
            output_column: String::new(),
            distill_columns: IndexMap::new(),
        };

        let mut registry = FunctionRegistry::new();
        registry.register_metric("accuracy", Box::new(accuracy_metric));
        registry.register_metric(
            SLICE_FINDER_ACCURACY,
            Box::new(|view, options| {
                let result = accuracy_metric(view, options)?;
                Ok(MetricReturn {
                    metric: result.metric,
                    error_rate: result.error_rate,
                })
            }),
        );

        EvalWorker::new(dataset, vec![id, label, region, output], registry, options)
    }

    fn accuracy_metric(
        view: &DatasetView<'_>,
        options: &FunctionOptions,
    ) -> Result<MetricReturn, HarnessError> {
        let labels = view.column_values(&options.label_column)?;
        let outputs = view.column_values(&options.output_column)?;
        let errors: Vec<f64> = labels
            .iter()
            .zip(&outputs)
            .map(|(label, output)| if label == output { 0.0 } else { 1.0 })
            .collect();
        let metric = if errors.is_empty() {
            0.0
        } else {
            1.0 - errors.iter().sum::<f64>() / errors.len() as f64
        };
        Ok(MetricReturn {
            metric,
            error_rate: Some(errors),
        })
    }

    fn region_b_slice() -> Slice {
        Slice {
            name: "region_b".to_string(),
            folder: String::new(),
            predicates: FilterPredicateGroup::all(vec![PredicateNode::Leaf(FilterPredicate {
                column: Column::metadata("region"),
                op: FilterOp::Eq,
                value: "B".into(),
            })]),
        }
    }

    #[test]
    fn models_are_derived_from_output_columns() {
        let worker = fixture();
        assert_eq!(worker.models(), vec!["m1".to_string()]);
    }

    #[test]
    fn options_for_model_binds_the_output_column() {
        let worker = fixture();
        let options = worker.options_for_model("m1").unwrap();
        assert_eq!(options.output_column, "OUTPUTlabelm1");
        assert!(worker.options_for_model("missing").is_err());
    }

    #[test]
    fn results_cover_every_tester_and_slice() {
        let mut worker = fixture();
        worker.register_slice(region_b_slice()).unwrap();
        let rows = worker.results();
        // One tester, two slices (overall + region_b); the signal metric is excluded.
        assert_eq!(rows.len(), 2);
        let overall = rows.iter().find(|row| row.slice_name == "overall").unwrap();
        assert_eq!(overall.slice_size, 10);
        let overall_accuracy = overall.model_results["m1"].unwrap();
        assert!((overall_accuracy - 0.6).abs() < 1e-9);
        let region_b = rows.iter().find(|row| row.slice_name == "region_b").unwrap();
        assert_eq!(region_b.slice_size, 4);
        assert_eq!(region_b.model_results["m1"], Some(0.0));
        assert_eq!(worker.status(), "done");
    }

    #[test]
    fn results_are_cached_across_calls() {
        let mut worker = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        worker.add_metric(
            "counted",
            Box::new(move |view, options| {
                counted.fetch_add(1, Ordering::SeqCst);
                accuracy_metric(view, options)
            }),
        );
        let first = worker.results();
        let second = worker.results();
        assert_eq!(first, second);
        // One call per (slice, model) key, not per results() invocation.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_metric_is_recorded_without_aborting_siblings() {
        let mut worker = fixture();
        worker.add_metric(
            "broken",
            Box::new(|_, _| {
                Err(HarnessError::Configuration("bad metric".into()))
            }),
        );
        let rows = worker.results();
        let broken = rows.iter().find(|row| row.tester_name == "broken").unwrap();
        assert_eq!(broken.model_results["m1"], None);
        let accuracy = rows.iter().find(|row| row.tester_name == "accuracy").unwrap();
        let value = accuracy.model_results["m1"].unwrap();
        assert!((value - 0.6).abs() < 1e-9);
    }

    #[test]
    fn slice_mutation_invalidates_only_its_keys() {
        let mut worker = fixture();
        worker.register_slice(region_b_slice()).unwrap();
        worker.results();
        let cached = worker.cache().len();
        assert_eq!(cached, 2);

        worker.remove_slice("region_b");
        assert_eq!(worker.cache().len(), 1);
    }

    #[test]
    fn discovery_finds_the_region_b_slice() {
        let worker = fixture();
        let result = worker
            .run_discovery(&DiscoveryRequest {
                model: "m1".to_string(),
                column_name: "region".to_string(),
                minimum_size: 2,
                depth: 1,
            })
            .unwrap();
        assert!((result.average_error - 0.4).abs() < 1e-9);
        assert_eq!(result.slices_of_interest.len(), 1);
        assert!(result.slices_of_interest[0]
            .name
            .starts_with("slicefinder-result-B-"));
    }

    #[test]
    fn discovery_with_negative_bounds_is_empty_not_an_error() {
        let worker = fixture();
        let result = worker
            .run_discovery(&DiscoveryRequest {
                model: "m1".to_string(),
                column_name: "region".to_string(),
                minimum_size: -5,
                depth: 1,
            })
            .unwrap();
        assert!(result.slices_of_interest.is_empty());
    }

    #[test]
    fn empty_id_column_defaults_to_the_metadata_id_column() {
        let id = Column::metadata("id");
        let label = Column::metadata("label");
        let output = Column::output("label", "m1");
        let mut columns = IndexMap::new();
        columns.insert(id.canonical_string(), vec!["r1".into(), "r2".into()]);
        columns.insert(label.canonical_string(), vec!["yes".into(), "yes".into()]);
        columns.insert(output.canonical_string(), vec!["yes".into(), "no".into()]);
        let dataset = Dataset::new(columns).unwrap();

        let options = FunctionOptions {
            id_column: String::new(),
            data_column: label.canonical_string(),
            label_column: label.canonical_string(),
            output_column: String::new(),
            distill_columns: IndexMap::new(),
        };
        let mut registry = FunctionRegistry::new();
        registry.register_metric(SLICE_FINDER_ACCURACY, Box::new(accuracy_metric));
        let worker = EvalWorker::new(dataset, vec![id, label, output], registry, options);

        // The string-valued id column is excluded from the search space only
        // because the empty binding fell back to `METADATAid`.
        let result = worker
            .run_discovery(&DiscoveryRequest {
                model: "m1".to_string(),
                column_name: "label".to_string(),
                minimum_size: 1,
                depth: 1,
            })
            .unwrap();
        assert_eq!(result.trained_columns, vec!["METADATAlabel".to_string()]);
    }

    #[test]
    fn sample_json_respects_the_row_limit() {
        let mut worker = fixture();
        worker.sample_rows = 3;
        worker.register_slice(region_b_slice()).unwrap();
        let sample = worker.sample_json("region_b").unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&sample).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(worker.sample_json("missing").is_err());
    }
}
