//! Typed user-function registry.
//!
//! Models, metrics, and distill functions are registered explicitly under a
//! name and called with `(view, options)`; the options record tells the
//! function which canonical columns hold identifiers, data, labels, and the
//! active model's outputs.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::dataset::{CellValue, DatasetView};
use crate::errors::HarnessError;
use crate::types::{CanonicalName, MetricName, ModelName};

/// Metric-function name that supplies the per-row error signal consumed by
/// slice discovery.
pub const SLICE_FINDER_ACCURACY: &str = "slice_finder_accuracy";

/// Column-role bindings passed to every user function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionOptions {
    /// Column with unique row identifiers.
    pub id_column: CanonicalName,
    /// Column with raw data or a reference to it.
    pub data_column: CanonicalName,
    /// Column with ground-truth labels.
    pub label_column: CanonicalName,
    /// Column with the active model's raw output.
    pub output_column: CanonicalName,
    /// Map from distill-function name to its materialized column.
    pub distill_columns: IndexMap<String, CanonicalName>,
}

impl FunctionOptions {
    /// Rebind the options to one model's output and distill columns.
    pub fn for_model(
        &self,
        output_column: CanonicalName,
        distill_columns: IndexMap<String, CanonicalName>,
    ) -> Self {
        Self {
            output_column,
            distill_columns,
            ..self.clone()
        }
    }
}

/// Return type for model functions.
pub struct ModelReturn {
    /// Model output for each row of the view.
    pub model_output: Vec<CellValue>,
    /// Optional high-dimensional embedding per row.
    pub embedding: Option<Vec<Vec<f64>>>,
}

/// Return type for distill functions.
pub struct DistillReturn {
    /// Derived feature for each row of the view.
    pub distill_output: Vec<CellValue>,
}

/// Return type for metric functions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricReturn {
    /// Average metric over the view.
    pub metric: f64,
    /// Optional per-row error signal (1.0 wrong, 0.0 correct).
    pub error_rate: Option<Vec<f64>>,
}

/// Boxed model callable.
pub type ModelFn =
    Box<dyn Fn(&DatasetView<'_>, &FunctionOptions) -> Result<ModelReturn, HarnessError> + Send + Sync>;
/// Boxed metric callable.
pub type MetricFn =
    Box<dyn Fn(&DatasetView<'_>, &FunctionOptions) -> Result<MetricReturn, HarnessError> + Send + Sync>;
/// Boxed distill callable.
pub type DistillFn =
    Box<dyn Fn(&DatasetView<'_>, &FunctionOptions) -> Result<DistillReturn, HarnessError> + Send + Sync>;

/// Registry mapping names to typed user callables.
///
/// Construction is explicit registration, in place of the original runtime
/// attribute tagging; listing order is registration order.
#[derive(Default)]
pub struct FunctionRegistry {
    models: IndexMap<ModelName, ModelFn>,
    metrics: IndexMap<MetricName, MetricFn>,
    distills: IndexMap<String, DistillFn>,
}

impl FunctionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a model function.
    pub fn register_model(&mut self, name: impl Into<ModelName>, function: ModelFn) {
        self.models.insert(name.into(), function);
    }

    /// Register or replace a metric function.
    pub fn register_metric(&mut self, name: impl Into<MetricName>, function: MetricFn) {
        self.metrics.insert(name.into(), function);
    }

    /// Register or replace a distill function.
    pub fn register_distill(&mut self, name: impl Into<String>, function: DistillFn) {
        self.distills.insert(name.into(), function);
    }

    /// Look up a model function by name.
    pub fn model(&self, name: &str) -> Option<&ModelFn> {
        self.models.get(name)
    }

    /// Look up a metric function by name.
    pub fn metric(&self, name: &str) -> Option<&MetricFn> {
        self.metrics.get(name)
    }

    /// Look up a distill function by name.
    pub fn distill(&self, name: &str) -> Option<&DistillFn> {
        self.distills.get(name)
    }

    /// Registered model names in registration order.
    pub fn model_names(&self) -> Vec<ModelName> {
        self.models.keys().cloned().collect()
    }

    /// Registered metric names in registration order.
    pub fn metric_names(&self) -> Vec<MetricName> {
        self.metrics.keys().cloned().collect()
    }

    /// Registered distill names in registration order.
    pub fn distill_names(&self) -> Vec<String> {
        self.distills.keys().cloned().collect()
    }

    /// Invoke a metric by name, mapping absence to a configuration error.
    pub fn call_metric(
        &self,
        name: &str,
        view: &DatasetView<'_>,
        options: &FunctionOptions,
    ) -> Result<MetricReturn, HarnessError> {
        let function = self.metric(name).ok_or_else(|| {
            HarnessError::Configuration(format!("metric function '{name}' is not registered"))
        })?;
        function(view, options).map_err(|err| HarnessError::UserFunction {
            function: name.to_string(),
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use indexmap::IndexMap;

    fn options() -> FunctionOptions {
        FunctionOptions {
            id_column: "METADATAid".into(),
            data_column: "METADATAdata".into(),
            label_column: "METADATAlabel".into(),
            output_column: String::new(),
            distill_columns: IndexMap::new(),
        }
    }

    #[test]
    fn registry_lists_names_in_registration_order() {
        let mut registry = FunctionRegistry::new();
        registry.register_metric("accuracy", Box::new(|_, _| Ok(MetricReturn {
            metric: 1.0,
            error_rate: None,
        })));
        registry.register_metric(SLICE_FINDER_ACCURACY, Box::new(|_, _| Ok(MetricReturn {
            metric: 0.0,
            error_rate: Some(vec![]),
        })));
        assert_eq!(
            registry.metric_names(),
            vec!["accuracy".to_string(), SLICE_FINDER_ACCURACY.to_string()]
        );
        assert!(registry.metric("accuracy").is_some());
        assert!(registry.model("accuracy").is_none());
    }

    #[test]
    fn for_model_rebinds_output_and_distill_columns() {
        let base = options();
        let mut distills = IndexMap::new();
        distills.insert("brightness".to_string(), "PREDISTILLbrightness".to_string());
        let rebound = base.for_model("OUTPUTlabelresnet".into(), distills);
        assert_eq!(rebound.output_column, "OUTPUTlabelresnet");
        assert_eq!(rebound.id_column, base.id_column);
        assert_eq!(rebound.distill_columns.len(), 1);
    }

    #[test]
    fn call_metric_wraps_user_failures() {
        let mut registry = FunctionRegistry::new();
        registry.register_metric(
            "broken",
            Box::new(|_, _| {
                Err(HarnessError::Configuration("bad input".into()))
            }),
        );
        let dataset = Dataset::new(IndexMap::new()).unwrap();
        let view = DatasetView::full(&dataset);
        let err = registry.call_metric("broken", &view, &options()).unwrap_err();
        assert!(matches!(err, HarnessError::UserFunction { .. }));

        let missing = registry.call_metric("absent", &view, &options()).unwrap_err();
        assert!(matches!(missing, HarnessError::Configuration(_)));
    }
}
