//! Automatic slice discovery.
//!
//! Level-wise branch-and-bound over conjunctions of single-column equality
//! constraints on the encoded categorical table. Candidates below the
//! minimum slice size are pruned, survivors are scored by a monotone blend
//! of error concentration and support, and only the top-k non-dominated
//! candidates seed the next level, so the full combinatorial space is never
//! materialized.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::column::{lookup_by_canonical, Column};
use crate::encoder::{EncodedColumn, EncodedTable};
use crate::errors::HarnessError;
use crate::filters::{FilterOp, FilterPredicate, FilterPredicateGroup, PredicateNode};
use crate::slices::Slice;
use crate::types::{CategoryCode, ModelName};

/// Discovery request fields as they arrive over the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Model whose error signal drives the search.
    pub model: ModelName,
    /// Column of interest named by the requesting client (UI transparency).
    pub column_name: String,
    /// Lower bound on slice cardinality considered significant.
    pub minimum_size: i64,
    /// Maximum number of AND-joined constraints in one discovered slice.
    pub depth: i64,
}

/// Result of one discovery invocation; immutable after construction.
#[derive(Clone, Debug)]
pub struct DiscoveryResult {
    /// Mean error signal over the full dataset, the baseline for comparison.
    pub average_error: f64,
    /// Canonical names of the columns offered to the search.
    pub trained_columns: Vec<String>,
    /// Generated slices, highest score first.
    pub slices_of_interest: Vec<Slice>,
}

/// A conjunction under consideration: one optional code per searched column,
/// `None` meaning unconstrained.
#[derive(Clone, Debug, PartialEq)]
struct Candidate {
    constraints: Vec<Option<CategoryCode>>,
    support: usize,
    error_sum: f64,
}

impl Candidate {
    fn mean_error(&self) -> f64 {
        if self.support == 0 {
            0.0
        } else {
            self.error_sum / self.support as f64
        }
    }

    fn depth(&self) -> usize {
        self.constraints.iter().filter(|c| c.is_some()).count()
    }

    /// Lexical key over the encoded tuple, used as the final tie-break.
    fn lexical_key(&self) -> Vec<i64> {
        self.constraints
            .iter()
            .map(|constraint| match constraint {
                Some(code) => *code as i64,
                None => -1,
            })
            .collect()
    }
}

/// Bounded heuristic search for high-error conjunctive slices.
pub struct SliceFinder {
    /// Slices smaller than this are pruned.
    pub minimum_size: usize,
    /// Maximum conjunction depth searched.
    pub max_depth: usize,
    /// Trade-off between error concentration and support; closer to 1.0
    /// favors purer-error slices over larger ones.
    pub significance_weight: f64,
    /// Number of candidates retained per level and returned overall.
    pub top_k: usize,
}

impl SliceFinder {
    /// Finder with the default significance weight and beam width.
    pub fn new(minimum_size: usize, max_depth: usize) -> Self {
        Self {
            minimum_size,
            max_depth,
            significance_weight: 0.95,
            top_k: 10,
        }
    }

    /// Search the encoded table for the top-k high-error conjunctions.
    ///
    /// An unsatisfiable size bound (zero, or larger than the dataset) yields
    /// an empty result, not an error. An empty search space is the caller's
    /// error condition; `errors` length must match the table's row count.
    fn fit(
        &self,
        table: &EncodedTable,
        errors: &[f64],
    ) -> Result<(f64, Vec<Candidate>), HarnessError> {
        if table.column_names.is_empty() {
            return Err(HarnessError::NoSearchableFeatures);
        }
        if errors.len() != table.row_count {
            return Err(HarnessError::Configuration(format!(
                "error signal has {} entries for {} rows",
                errors.len(),
                table.row_count
            )));
        }
        let rows = table.row_count;
        let average_error = if rows == 0 {
            0.0
        } else {
            errors.iter().sum::<f64>() / rows as f64
        };
        if self.minimum_size == 0 || self.minimum_size > rows || self.max_depth == 0 {
            return Ok((average_error, Vec::new()));
        }

        let width = table.columns.len();
        let mut top: Vec<Candidate> = Vec::new();
        // Depth-1 seeds: every (column, code) constraint with enough support.
        let mut frontier: Vec<Candidate> = Vec::new();
        for (idx, column) in table.columns.iter().enumerate() {
            for code in 0..column.code_to_value.len() {
                let mut constraints = vec![None; width];
                constraints[idx] = Some(code);
                if let Some(candidate) = self.measure(table, errors, constraints) {
                    frontier.push(candidate);
                }
            }
        }
        self.merge_top(&mut top, &frontier, average_error);
        let mut seeds = self.retain_beam(frontier);

        for level in 2..=self.max_depth.min(width) {
            let mut next: Vec<Candidate> = Vec::new();
            for seed in &seeds {
                let last = seed
                    .constraints
                    .iter()
                    .rposition(Option::is_some)
                    .unwrap_or(0);
                // Extend only rightwards so each conjunction is generated once.
                for idx in last + 1..width {
                    for code in 0..table.columns[idx].code_to_value.len() {
                        let mut constraints = seed.constraints.clone();
                        constraints[idx] = Some(code);
                        if let Some(candidate) = self.measure(table, errors, constraints) {
                            next.push(candidate);
                        }
                    }
                }
            }
            let improved = self.merge_top(&mut top, &next, average_error);
            debug!(
                level,
                candidates = next.len(),
                improved, "slice discovery level complete"
            );
            if next.is_empty() || !improved {
                break;
            }
            seeds = self.retain_beam(next);
        }

        top.sort_by(|a, b| self.compare(a, b, average_error));
        top.truncate(self.top_k);
        Ok((average_error, top))
    }

    /// Count support and accumulated error for a constraint tuple; prune
    /// below the minimum size.
    fn measure(
        &self,
        table: &EncodedTable,
        errors: &[f64],
        constraints: Vec<Option<CategoryCode>>,
    ) -> Option<Candidate> {
        let mut support = 0usize;
        let mut error_sum = 0.0f64;
        'rows: for row in 0..table.row_count {
            for (column, constraint) in table.columns.iter().zip(&constraints) {
                if let Some(code) = constraint {
                    if column.codes[row] != *code {
                        continue 'rows;
                    }
                }
            }
            support += 1;
            error_sum += errors[row];
        }
        if support < self.minimum_size {
            return None;
        }
        Some(Candidate {
            constraints,
            support,
            error_sum,
        })
    }

    /// Monotone score in both error concentration and support.
    fn score(&self, candidate: &Candidate, average_error: f64) -> f64 {
        let concentration = if average_error > 0.0 {
            candidate.mean_error() / average_error
        } else {
            candidate.mean_error()
        };
        let support_ratio = candidate.support as f64;
        self.significance_weight * concentration
            + (1.0 - self.significance_weight) * support_ratio.ln_1p()
    }

    /// Score-descending order; ties prefer smaller support (more specific),
    /// then the lexical order of the encoded tuple for determinism.
    fn compare(&self, a: &Candidate, b: &Candidate, average_error: f64) -> std::cmp::Ordering {
        let score_a = self.score(a, average_error);
        let score_b = self.score(b, average_error);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.support.cmp(&b.support))
            .then_with(|| a.lexical_key().cmp(&b.lexical_key()))
    }

    /// Merge level candidates into the running top-k, keeping only slices
    /// whose error concentration beats the baseline. Returns whether any
    /// newcomer survived the top-k cut.
    fn merge_top(&self, top: &mut Vec<Candidate>, level: &[Candidate], average_error: f64) -> bool {
        let incumbents = top.clone();
        for candidate in level {
            if candidate.mean_error() <= average_error {
                continue;
            }
            if top.contains(candidate) {
                continue;
            }
            top.push(candidate.clone());
        }
        top.sort_by(|a, b| self.compare(a, b, average_error));
        top.truncate(self.top_k);
        top.iter()
            .any(|candidate| !incumbents.contains(candidate))
    }

    /// Keep the best `top_k` candidates of a level as next-level seeds.
    fn retain_beam(&self, mut level: Vec<Candidate>) -> Vec<Candidate> {
        level.sort_by(|a, b| {
            b.mean_error()
                .partial_cmp(&a.mean_error())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.support.cmp(&b.support))
                .then_with(|| a.lexical_key().cmp(&b.lexical_key()))
        });
        level.truncate(self.top_k);
        level
    }
}

/// Run discovery end to end against an encoded table and reconstruct
/// human-readable slices from the numeric result.
pub fn discover_slices(
    finder: &SliceFinder,
    table: &EncodedTable,
    errors: &[f64],
    columns: &[Column],
) -> Result<DiscoveryResult, HarnessError> {
    let (average_error, candidates) = finder.fit(table, errors)?;
    let mut slices_of_interest = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        slices_of_interest.push(reconstruct_slice(candidate, table, columns)?);
    }
    debug!(
        slices = slices_of_interest.len(),
        average_error, "slice discovery finished"
    );
    Ok(DiscoveryResult {
        average_error,
        trained_columns: table.column_names.clone(),
        slices_of_interest,
    })
}

/// Build a `Slice` from a discovered conjunction using the encoder's inverse
/// mapping to recover the original categorical values.
fn reconstruct_slice(
    candidate: &Candidate,
    table: &EncodedTable,
    columns: &[Column],
) -> Result<Slice, HarnessError> {
    let mut members = Vec::with_capacity(candidate.depth());
    let mut name = String::from("slicefinder-result-");
    for (idx, constraint) in candidate.constraints.iter().enumerate() {
        let Some(code) = constraint else {
            continue;
        };
        let canonical = &table.column_names[idx];
        let column = lookup_by_canonical(columns, canonical)
            .ok_or_else(|| HarnessError::ColumnNotFound(canonical.clone()))?;
        let value = decode(&table.columns[idx], *code, canonical)?;
        name.push_str(&value.token());
        name.push('-');
        members.push(PredicateNode::Leaf(FilterPredicate {
            column: column.clone(),
            op: FilterOp::Eq,
            value,
        }));
    }
    name.push_str(&random_suffix());
    Ok(Slice {
        name,
        folder: String::new(),
        predicates: FilterPredicateGroup::all(members),
    })
}

fn decode(
    column: &EncodedColumn,
    code: CategoryCode,
    canonical: &str,
) -> Result<crate::dataset::CellValue, HarnessError> {
    column.code_to_value.get(code).cloned().ok_or_else(|| {
        HarnessError::Configuration(format!(
            "code {code} has no inverse mapping in column '{canonical}'"
        ))
    })
}

/// Six-hex-digit suffix keeping generated names unique across repeated
/// discovery runs with identical predicates. A randomly seeded per-process
/// counter guarantees uniqueness until it wraps at 2^24 names.
fn random_suffix() -> String {
    static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| AtomicU32::new(rand::thread_rng().gen()));
    format!(
        "{:06x}",
        counter.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF
    )
}
