//! Filter predicate trees and their set-valued evaluator.
//!
//! A `FilterPredicateGroup` is the recursive boolean expression that defines
//! a slice. Evaluation is pure: for a fixed dataset snapshot it always yields
//! the same row-id set, independent of member order.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::column::Column;
use crate::dataset::{CellValue, Dataset};
use crate::types::RowId;

/// Comparison operator applied between a column value and a constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

impl FilterOp {
    fn matches(self, cell: &CellValue, value: &CellValue) -> bool {
        match self {
            FilterOp::Eq => cell == value,
            FilterOp::Ne => cell != value,
            // Ordered comparisons are false across incompatible types.
            FilterOp::Lt => cell.partial_cmp_value(value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                cell.partial_cmp_value(value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => cell.partial_cmp_value(value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                cell.partial_cmp_value(value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// How sibling predicates combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Join {
    /// Intersection of member row sets.
    And,
    /// Union of member row sets.
    Or,
}

/// Leaf constraint: `column OP value`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    /// Column the constraint reads.
    pub column: Column,
    /// Comparison operator.
    pub op: FilterOp,
    /// Constant compared against each cell.
    pub value: CellValue,
}

/// Tagged variant over leaves and nested groups.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PredicateNode {
    /// Single column constraint.
    Leaf(FilterPredicate),
    /// Nested group with its own join.
    Group(FilterPredicateGroup),
}

/// Ordered sequence of predicates/groups combined by one join operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicateGroup {
    /// Child predicates and groups, evaluated in order.
    pub members: Vec<PredicateNode>,
    /// Operator combining the members' row sets.
    pub join: Join,
}

impl FilterPredicateGroup {
    /// Group of AND-joined members.
    pub fn all(members: Vec<PredicateNode>) -> Self {
        Self {
            members,
            join: Join::And,
        }
    }

    /// The empty group, which evaluates to the full row set.
    pub fn overall() -> Self {
        Self::all(Vec::new())
    }

    /// True for the whole-dataset group.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Evaluate a predicate group against the dataset snapshot.
///
/// AND intersects member row sets, OR unions them, and the empty group
/// returns every row (identity element for AND, matching "overall" slice
/// semantics). A leaf over a missing column matches no rows.
pub fn evaluate(group: &FilterPredicateGroup, dataset: &Dataset) -> BTreeSet<RowId> {
    if group.members.is_empty() {
        return dataset.all_rows().collect();
    }
    let mut result: Option<BTreeSet<RowId>> = None;
    for member in &group.members {
        let rows = match member {
            PredicateNode::Leaf(predicate) => evaluate_leaf(predicate, dataset),
            PredicateNode::Group(inner) => evaluate(inner, dataset),
        };
        result = Some(match (result, group.join) {
            (None, _) => rows,
            (Some(acc), Join::And) => acc.intersection(&rows).copied().collect(),
            (Some(acc), Join::Or) => acc.union(&rows).copied().collect(),
        });
    }
    result.unwrap_or_default()
}

fn evaluate_leaf(predicate: &FilterPredicate, dataset: &Dataset) -> BTreeSet<RowId> {
    let canonical = predicate.column.canonical_string();
    let Some(column) = dataset.column(&canonical) else {
        return BTreeSet::new();
    };
    column
        .iter()
        .enumerate()
        .filter(|(_, cell)| predicate.op.matches(cell, &predicate.value))
        .map(|(row, _)| row)
        .collect()
}
