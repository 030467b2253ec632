//! Lazy frame: deferred transform evaluation over the column store.
//!
//! `materialize` resolves the minimal set of source partitions for a
//! requested post-transform row range, reads them through the adapter, and
//! applies projection/filter/sort in memory. Nothing is evaluated until a
//! window is requested.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use polars::prelude::*;
use tracing::debug;

use crate::error::{DbvError, Result};
use crate::plan::{PlanId, SortDirection, TransformPlan};
use crate::source::{Dataset, ORIGIN_COLUMN};
use crate::worker::CancelToken;

/// Result of materializing one row range. `total_rows` is `None` until the
/// post-transform row count is actually known (a filter hides it until the
/// dataset has been exhausted once).
pub struct Materialized {
    pub df: DataFrame,
    pub total_rows: Option<usize>,
}

/// Deferred view of a [`Dataset`] under arbitrary transform plans.
pub struct LazyTable {
    dataset: Arc<Dataset>,
    /// Initial geometric read-ahead batch, in partitions.
    read_ahead: usize,
    /// Row-order permutations for plans with a sort, computed once per plan
    /// by an explicit full scan (see [`LazyTable::sort_is_expensive`]).
    sorted_orders: Mutex<HashMap<PlanId, Arc<Vec<IdxSize>>>>,
    materialize_calls: AtomicUsize,
}

impl LazyTable {
    pub fn new(dataset: Arc<Dataset>, read_ahead: usize) -> Self {
        Self {
            dataset,
            read_ahead: read_ahead.max(1),
            sorted_orders: Mutex::new(HashMap::new()),
            materialize_calls: AtomicUsize::new(0),
        }
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// True when materializing this plan would force a one-time full scan
    /// (global sort whose row order is not cached yet). The view controller
    /// surfaces this to the user before proceeding.
    pub fn sort_is_expensive(&self, plan: &TransformPlan) -> bool {
        plan.sort.is_some()
            && !self
                .sorted_orders
                .lock()
                .expect("sorted order cache poisoned")
                .contains_key(&plan.id())
    }

    /// Number of materialize calls so far. The cache's coalescing guarantee
    /// is asserted against this counter.
    pub fn materialize_calls(&self) -> usize {
        self.materialize_calls.load(Ordering::Relaxed)
    }

    /// Produce exactly the rows whose post-transform index falls in `rows`.
    /// Errors are annotated with the attempted range before surfacing.
    pub fn materialize(
        &self,
        plan: &TransformPlan,
        rows: std::ops::Range<usize>,
        cancel: &CancelToken,
    ) -> Result<Materialized> {
        self.materialize_calls.fetch_add(1, Ordering::Relaxed);
        let (start, end) = (rows.start, rows.end);
        let result = if plan.sort.is_some() {
            self.materialize_sorted(plan, rows, cancel)
        } else if plan.filter.is_some() {
            self.materialize_filtered(plan, rows, cancel)
        } else {
            self.materialize_plain(plan, rows, cancel)
        };
        result.map_err(|e| e.for_range(start, end))
    }

    /// No filter, no sort: post-transform numbering equals source numbering,
    /// so the boundary table gives the exact partitions to read.
    fn materialize_plain(
        &self,
        plan: &TransformPlan,
        rows: std::ops::Range<usize>,
        cancel: &CancelToken,
    ) -> Result<Materialized> {
        let total = self.dataset.total_rows();
        let start = rows.start.min(total);
        let end = rows.end.min(total);
        let columns = plan.read_columns();

        let parts = self.dataset.partitions_for(start..end);
        let df = self
            .dataset
            .read_rows(parts.clone(), columns.as_deref(), cancel)?;
        let df = if parts.is_empty() {
            df
        } else {
            let base = self.dataset.partition_start(parts.start);
            df.slice((start - base) as i64, end - start)
        };
        debug!(plan_id = %plan.id(), start, end, partitions = ?parts, "materialized plain window");
        Ok(Materialized {
            df,
            total_rows: Some(total),
        })
    }

    /// Filter present: the mapping from post-filter index to partitions is
    /// unknown, so expand the read window geometrically until enough
    /// post-filter rows exist to cover the range or the source is exhausted.
    fn materialize_filtered(
        &self,
        plan: &TransformPlan,
        rows: std::ops::Range<usize>,
        cancel: &CancelToken,
    ) -> Result<Materialized> {
        let filter = plan.filter.as_ref().expect("filtered path without filter");
        let columns = plan.read_columns();
        let part_count = self.dataset.partition_count();

        let mut acc: Option<DataFrame> = None;
        let mut produced = 0usize;
        let mut next_part = 0usize;
        let mut batch = self.read_ahead;

        while produced < rows.end && next_part < part_count {
            if cancel.is_cancelled() {
                return Err(DbvError::Cancelled);
            }
            let run = next_part..(next_part + batch).min(part_count);
            let raw = self.dataset.read_rows(run.clone(), columns.as_deref(), cancel)?;
            let filtered = raw.lazy().filter(filter.expr.clone()).collect()?;
            produced += filtered.height();
            acc = Some(match acc {
                Some(mut df) => {
                    df.vstack_mut(&filtered)?;
                    df
                }
                None => filtered,
            });
            next_part = run.end;
            // Unknown selectivity: double the batch each round so a sparse
            // filter still converges without a full scan on the common case.
            batch = batch.saturating_mul(2);
        }

        let exhausted = next_part >= part_count;
        let acc = match acc {
            Some(df) => df,
            None => self.dataset.read_rows(0..0, columns.as_deref(), cancel)?,
        };
        let start = rows.start.min(produced);
        let len = rows.end.min(produced) - start;
        debug!(
            plan_id = %plan.id(),
            requested = ?rows,
            produced,
            partitions_scanned = next_part,
            exhausted,
            "materialized filtered window"
        );
        Ok(Materialized {
            df: acc.slice(start as i64, len),
            total_rows: exhausted.then_some(produced),
        })
    }

    /// Sort present: gather rows through the cached sorted permutation,
    /// reading only the partitions that hold the needed origin rows.
    fn materialize_sorted(
        &self,
        plan: &TransformPlan,
        rows: std::ops::Range<usize>,
        cancel: &CancelToken,
    ) -> Result<Materialized> {
        let order = self.sorted_order(plan, cancel)?;
        let total = order.len();
        let start = rows.start.min(total);
        let end = rows.end.min(total);
        let needed = &order[start..end];
        let columns = plan.read_columns();

        // Unique partitions holding the needed rows, ascending.
        let mut parts: Vec<usize> = needed
            .iter()
            .map(|&o| self.dataset.partition_at(o as usize))
            .collect();
        parts.sort_unstable();
        parts.dedup();

        // Read contiguous runs of partition ids; the concatenated frame is
        // ascending in origin, so local positions are computable directly.
        let mut local_base: HashMap<usize, usize> = HashMap::with_capacity(parts.len());
        let mut cursor = 0usize;
        for &p in &parts {
            local_base.insert(p, cursor);
            cursor += self.dataset.partition_len(p);
        }

        let mut combined: Option<DataFrame> = None;
        let mut i = 0usize;
        while i < parts.len() {
            if cancel.is_cancelled() {
                return Err(DbvError::Cancelled);
            }
            let run_start = i;
            while i + 1 < parts.len() && parts[i + 1] == parts[i] + 1 {
                i += 1;
            }
            let run = parts[run_start]..parts[i] + 1;
            i += 1;
            let df = self.dataset.read_rows(run, columns.as_deref(), cancel)?;
            combined = Some(match combined {
                Some(mut acc) => {
                    acc.vstack_mut(&df)?;
                    acc
                }
                None => df,
            });
        }

        let combined = match combined {
            Some(df) => df,
            None => self.dataset.read_rows(0..0, columns.as_deref(), cancel)?,
        };
        let positions: Vec<IdxSize> = needed
            .iter()
            .map(|&o| {
                let p = self.dataset.partition_at(o as usize);
                (local_base[&p] + o as usize - self.dataset.partition_start(p)) as IdxSize
            })
            .collect();
        let df = combined.take(&IdxCa::from_vec("gather".into(), positions))?;
        debug!(plan_id = %plan.id(), start, end, partitions = parts.len(), "materialized sorted window");
        Ok(Materialized {
            df,
            total_rows: Some(total),
        })
    }

    /// Compute (or fetch) the sorted row-order permutation for a plan. This
    /// is the one deliberate full scan in the engine: only the sort key and
    /// the origin index are read, the permutation is cached per plan id.
    fn sorted_order(
        &self,
        plan: &TransformPlan,
        cancel: &CancelToken,
    ) -> Result<Arc<Vec<IdxSize>>> {
        if let Some(order) = self
            .sorted_orders
            .lock()
            .expect("sorted order cache poisoned")
            .get(&plan.id())
        {
            return Ok(Arc::clone(order));
        }

        let sort = plan.sort.as_ref().expect("sorted path without sort");
        let mut read_cols = vec![sort.key.clone()];
        if let Some(filter) = &plan.filter {
            for e in filter.expr.clone().into_iter() {
                if let Expr::Column(name) = e {
                    let name = name.to_string();
                    if !read_cols.contains(&name) {
                        read_cols.push(name);
                    }
                }
            }
        }

        let part_count = self.dataset.partition_count();
        let raw = self.dataset.read_rows(0..part_count, Some(&read_cols), cancel)?;
        if cancel.is_cancelled() {
            return Err(DbvError::Cancelled);
        }

        let mut lf = raw.lazy();
        if let Some(filter) = &plan.filter {
            lf = lf.filter(filter.expr.clone());
        }
        let descending = matches!(sort.direction, SortDirection::Descending);
        let sorted = lf
            .sort_by_exprs(
                vec![col(sort.key.as_str())],
                SortMultipleOptions {
                    descending: vec![descending],
                    ..Default::default()
                },
            )
            .select([col(ORIGIN_COLUMN)])
            .collect()?;
        let order: Vec<IdxSize> = sorted
            .column(ORIGIN_COLUMN)?
            .u32()?
            .into_no_null_iter()
            .collect();
        debug!(plan_id = %plan.id(), rows = order.len(), "computed sorted row order (full scan)");

        let order = Arc::new(order);
        self.sorted_orders
            .lock()
            .expect("sorted order cache poisoned")
            .insert(plan.id(), Arc::clone(&order));
        Ok(order)
    }
}
