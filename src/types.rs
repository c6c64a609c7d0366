/// Dense row index into the dataset snapshot (stable for the run).
/// Example: `42`
pub type RowId = usize;
/// Unique slice name used as a cache-key component.
/// Examples: `overall`, `slicefinder-result-B-a3f9c1`
pub type SliceName = String;
/// Registered model name.
/// Examples: `resnet50`, `distilbert-base`
pub type ModelName = String;
/// Registered metric-function name.
/// Examples: `accuracy`, `slice_finder_accuracy`
pub type MetricName = String;
/// Canonical serialized form of a `Column`, the only key used to locate data.
/// Examples: `METADATAregion`, `OUTPUTlabelresnet50`
pub type CanonicalName = String;
/// Dense integer code assigned to one categorical value within an encoding.
/// Example: `0`
pub type CategoryCode = usize;
/// Worker status line surfaced over the result channel.
/// Examples: `done`, `computing accuracy on overall`
pub type StatusMessage = String;
