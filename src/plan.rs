//! Transform plans: immutable project/filter/sort descriptions.
//!
//! A plan is never mutated; every user change produces a new plan with a
//! fresh process-unique id. Cached windows reference plans by id only, so an
//! abandoned plan's windows go stale by identity and age out of the cache
//! without any scanning.

use std::sync::atomic::{AtomicU64, Ordering};

use polars::prelude::Expr;

use crate::error::Result;
use crate::query::parse_predicate;

static NEXT_PLAN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`TransformPlan`]. Windows hold this, not
/// the plan itself, so evicting a plan never requires walking windows.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct PlanId(u64);

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "plan#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Clone, Debug)]
pub struct SortSpec {
    pub key: String,
    pub direction: SortDirection,
}

#[derive(Clone, Debug)]
pub struct FilterSpec {
    /// Original predicate text, kept for display and template round-trips.
    pub text: String,
    pub expr: Expr,
}

/// Ordered description of the operations applied before display. Post-
/// transform row numbering (0-based, contiguous) is defined against this.
#[derive(Clone, Debug)]
pub struct TransformPlan {
    id: PlanId,
    pub projection: Option<Vec<String>>,
    pub filter: Option<FilterSpec>,
    pub sort: Option<SortSpec>,
}

impl Default for TransformPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformPlan {
    /// The identity plan: all columns, no filter, source order.
    pub fn new() -> Self {
        Self {
            id: Self::fresh_id(),
            projection: None,
            filter: None,
            sort: None,
        }
    }

    fn fresh_id() -> PlanId {
        PlanId(NEXT_PLAN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> PlanId {
        self.id
    }

    /// New plan with the given filter predicate parsed and attached.
    /// Malformed input fails with a Validation error and leaves no new plan.
    pub fn with_filter(&self, predicate: &str) -> Result<Self> {
        let expr = parse_predicate(predicate)?;
        Ok(Self {
            id: Self::fresh_id(),
            projection: self.projection.clone(),
            filter: Some(FilterSpec {
                text: predicate.to_string(),
                expr,
            }),
            sort: self.sort.clone(),
        })
    }

    pub fn without_filter(&self) -> Self {
        Self {
            id: Self::fresh_id(),
            projection: self.projection.clone(),
            filter: None,
            sort: self.sort.clone(),
        }
    }

    pub fn with_sort(&self, key: &str, direction: SortDirection) -> Self {
        Self {
            id: Self::fresh_id(),
            projection: self.projection.clone(),
            filter: self.filter.clone(),
            sort: Some(SortSpec {
                key: key.to_string(),
                direction,
            }),
        }
    }

    pub fn without_sort(&self) -> Self {
        Self {
            id: Self::fresh_id(),
            projection: self.projection.clone(),
            filter: self.filter.clone(),
            sort: None,
        }
    }

    pub fn with_projection(&self, columns: Vec<String>) -> Self {
        Self {
            id: Self::fresh_id(),
            projection: Some(columns),
            filter: self.filter.clone(),
            sort: self.sort.clone(),
        }
    }

    /// Columns that must be read from the source: the projection plus any
    /// filter/sort inputs not already projected. `None` means all columns.
    pub fn read_columns(&self) -> Option<Vec<String>> {
        let mut cols = self.projection.clone()?;
        if let Some(sort) = &self.sort {
            if !cols.contains(&sort.key) {
                cols.push(sort.key.clone());
            }
        }
        if let Some(filter) = &self.filter {
            for name in filter.expr.clone().into_iter().filter_map(|e| match e {
                Expr::Column(name) => Some(name.to_string()),
                _ => None,
            }) {
                if !cols.contains(&name) {
                    cols.push(name);
                }
            }
        }
        Some(cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_changes_produce_fresh_ids() {
        let base = TransformPlan::new();
        let filtered = base.with_filter("a > 5").unwrap();
        let sorted = filtered.with_sort("a", SortDirection::Descending);
        assert_ne!(base.id(), filtered.id());
        assert_ne!(filtered.id(), sorted.id());
        // The original plan is untouched.
        assert!(base.filter.is_none());
        assert!(filtered.sort.is_none());
    }

    #[test]
    fn malformed_filter_leaves_no_plan() {
        let base = TransformPlan::new();
        assert!(base.with_filter("a >").is_err());
    }

    #[test]
    fn read_columns_include_filter_and_sort_inputs() {
        let plan = TransformPlan::new()
            .with_projection(vec!["x".into()])
            .with_filter("y > 1")
            .unwrap()
            .with_sort("z", SortDirection::Ascending);
        let cols = plan.read_columns().unwrap();
        assert!(cols.contains(&"x".to_string()));
        assert!(cols.contains(&"y".to_string()));
        assert!(cols.contains(&"z".to_string()));
        // No projection means read everything.
        assert!(TransformPlan::new().read_columns().is_none());
    }
}
