//! Window cache: bounded, LRU-evicted storage of materialized row ranges.
//!
//! Windows are keyed by plan identity and post-transform row range. A get
//! that is fully covered by a ready window is served as a slice; a partial
//! hit materializes only the missing gaps and merges touching windows into
//! one; concurrent overlapping requests for the same plan coalesce into a
//! single materialization. Total cached rows across all plans never exceed
//! the configured budget.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Condvar, Mutex};

use polars::prelude::DataFrame;
use tracing::debug;

use crate::error::{DbvError, Result};
use crate::frame::LazyTable;
use crate::plan::{PlanId, TransformPlan};
use crate::worker::CancelToken;

/// One cached contiguous range of post-transform rows. Owned exclusively by
/// the cache; callers receive slices (cheap, Arc-backed columns).
struct Window {
    start: usize,
    df: DataFrame,
    last_access: u64,
}

impl Window {
    fn end(&self) -> usize {
        self.start + self.df.height()
    }

    fn covers(&self, rows: &Range<usize>) -> bool {
        self.start <= rows.start && rows.end <= self.end()
    }

    fn slice(&self, rows: &Range<usize>) -> DataFrame {
        self.df
            .slice((rows.start - self.start) as i64, rows.len())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub coalesced_waits: u64,
}

struct CacheState {
    /// Per-plan windows, sorted by start, pairwise non-overlapping.
    windows: HashMap<PlanId, Vec<Window>>,
    /// Post-transform totals learned from materializations.
    totals: HashMap<PlanId, usize>,
    /// Requested ranges currently materializing, for request coalescing.
    in_flight: Vec<(PlanId, usize, usize)>,
    cached_rows: usize,
    access_seq: u64,
    stats: CacheStats,
}

/// Rows served from the cache, plus the post-transform total when known.
#[derive(Debug)]
pub struct CachedRows {
    pub df: DataFrame,
    pub total_rows: Option<usize>,
}

pub struct WindowCache {
    row_budget: usize,
    state: Mutex<CacheState>,
    in_flight_done: Condvar,
}

impl WindowCache {
    pub fn new(row_budget: usize) -> Self {
        Self {
            row_budget: row_budget.max(1),
            state: Mutex::new(CacheState {
                windows: HashMap::new(),
                totals: HashMap::new(),
                in_flight: Vec::new(),
                cached_rows: 0,
                access_seq: 0,
                stats: CacheStats::default(),
            }),
            in_flight_done: Condvar::new(),
        }
    }

    pub fn row_budget(&self) -> usize {
        self.row_budget
    }

    /// Total rows currently held across all plan identities.
    pub fn cached_rows(&self) -> usize {
        self.state.lock().expect("window table poisoned").cached_rows
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().expect("window table poisoned").stats
    }

    /// Post-transform row count for a plan, when a materialization has
    /// already established it.
    pub fn known_total(&self, plan: PlanId) -> Option<usize> {
        self.state
            .lock()
            .expect("window table poisoned")
            .totals
            .get(&plan)
            .copied()
    }

    /// Serve `rows` for `plan`, materializing at most the uncovered gaps.
    ///
    /// Switching plans evicts nothing: windows of other plans stay valid
    /// under the shared budget, so navigating back to a previous plan hits
    /// its still-cached windows.
    pub fn get(
        &self,
        frame: &LazyTable,
        plan: &TransformPlan,
        rows: Range<usize>,
        cancel: &CancelToken,
    ) -> Result<CachedRows> {
        if rows.len() > self.row_budget {
            return Err(DbvError::BudgetExceeded {
                requested: rows.len(),
                budget: self.row_budget,
            });
        }
        if rows.is_empty() {
            let m = frame.materialize(plan, rows, cancel)?;
            return Ok(CachedRows {
                df: m.df,
                total_rows: m.total_rows,
            });
        }

        loop {
            let (wanted, gaps) = {
                let mut state = self.state.lock().expect("window table poisoned");

                // Clamp to a known total so repeated past-end requests hit.
                let mut wanted = clamp_to_total(&rows, state.totals.get(&plan.id()).copied());

                if let Some(df) = state.try_serve(plan.id(), &wanted) {
                    let total_rows = state.totals.get(&plan.id()).copied();
                    return Ok(CachedRows { df, total_rows });
                }

                // Coalesce with an overlapping in-flight materialization:
                // wait for it to land, then re-check coverage.
                while state.overlaps_in_flight(plan.id(), &wanted) {
                    state.stats.coalesced_waits += 1;
                    state = self
                        .in_flight_done
                        .wait(state)
                        .expect("window table poisoned");
                    wanted = clamp_to_total(&rows, state.totals.get(&plan.id()).copied());
                }
                // The wait may have landed exactly what we need.
                if let Some(df) = state.try_serve(plan.id(), &wanted) {
                    let total_rows = state.totals.get(&plan.id()).copied();
                    return Ok(CachedRows { df, total_rows });
                }

                state.stats.misses += 1;
                state
                    .in_flight
                    .push((plan.id(), wanted.start, wanted.end));
                let gaps = state.missing_gaps(plan.id(), &wanted);
                (wanted, gaps)
            };

            // Materialize the gaps without holding the window table lock.
            let mut results = Vec::with_capacity(gaps.len());
            let mut failure: Option<DbvError> = None;
            for gap in &gaps {
                match frame.materialize(plan, gap.clone(), cancel) {
                    Ok(m) => results.push((gap.start, m)),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            let mut state = self.state.lock().expect("window table poisoned");
            state
                .in_flight
                .retain(|&(p, s, e)| !(p == plan.id() && s == wanted.start && e == wanted.end));
            self.in_flight_done.notify_all();

            if let Some(e) = failure {
                return Err(e);
            }
            // A superseded request completes its I/O but never touches the
            // window table.
            if cancel.is_cancelled() {
                return Err(DbvError::Cancelled);
            }

            let mut fallback_empty: Option<DataFrame> = None;
            for (start, m) in results {
                if let Some(total) = m.total_rows {
                    state.totals.insert(plan.id(), total);
                }
                if m.df.height() == 0 {
                    fallback_empty.get_or_insert(m.df);
                    continue;
                }
                state.insert(plan.id(), start, m.df);
            }
            state.merge_touching(plan.id());

            let wanted = clamp_to_total(&wanted, state.totals.get(&plan.id()).copied());
            let served = state.try_serve(plan.id(), &wanted);
            // Slices stay valid after eviction, so trim to budget now.
            let evicted = state.evict_to_budget(self.row_budget);
            if evicted > 0 {
                debug!(evicted, cached_rows = state.cached_rows, "evicted LRU windows");
            }

            match served {
                Some(df) => {
                    let total_rows = state.totals.get(&plan.id()).copied();
                    return Ok(CachedRows { df, total_rows });
                }
                None if wanted.is_empty() => {
                    // Requested range lies entirely past the data.
                    let df = match fallback_empty {
                        Some(df) => {
                            drop(state);
                            df
                        }
                        None => {
                            drop(state);
                            frame.materialize(plan, wanted.clone(), cancel)?.df
                        }
                    };
                    let total_rows = self.known_total(plan.id());
                    return Ok(CachedRows { df, total_rows });
                }
                // Coverage was evicted by a concurrent insert between our
                // gap computation and now; retry.
                None => continue,
            }
        }
    }
}

impl CacheState {
    /// Slice a covering ready window, bumping its access order.
    fn try_serve(&mut self, plan: PlanId, rows: &Range<usize>) -> Option<DataFrame> {
        if rows.is_empty() {
            return None;
        }
        let windows = self.windows.get_mut(&plan)?;
        let w = windows.iter_mut().find(|w| w.covers(rows))?;
        self.access_seq += 1;
        w.last_access = self.access_seq;
        self.stats.hits += 1;
        Some(w.slice(rows))
    }

    fn overlaps_in_flight(&self, plan: PlanId, rows: &Range<usize>) -> bool {
        self.in_flight
            .iter()
            .any(|&(p, s, e)| p == plan && s < rows.end && rows.start < e)
    }

    /// Sub-ranges of `rows` not covered by any ready window of `plan`.
    fn missing_gaps(&self, plan: PlanId, rows: &Range<usize>) -> Vec<Range<usize>> {
        let mut gaps = Vec::new();
        let mut cursor = rows.start;
        if let Some(windows) = self.windows.get(&plan) {
            for w in windows {
                if w.end() <= cursor {
                    continue;
                }
                if w.start >= rows.end {
                    break;
                }
                if w.start > cursor {
                    gaps.push(cursor..w.start.min(rows.end));
                }
                cursor = cursor.max(w.end());
                if cursor >= rows.end {
                    break;
                }
            }
        }
        if cursor < rows.end {
            gaps.push(cursor..rows.end);
        }
        gaps
    }

    fn insert(&mut self, plan: PlanId, start: usize, df: DataFrame) {
        self.access_seq += 1;
        self.cached_rows += df.height();
        let w = Window {
            start,
            df,
            last_access: self.access_seq,
        };
        let windows = self.windows.entry(plan).or_default();
        let pos = windows.partition_point(|x| x.start < start);
        windows.insert(pos, w);
    }

    /// Merge touching windows of a plan so no two cached windows for the
    /// same plan overlap and contiguous coverage is a single window.
    fn merge_touching(&mut self, plan: PlanId) {
        let Some(windows) = self.windows.get_mut(&plan) else {
            return;
        };
        let mut i = 0;
        while i + 1 < windows.len() {
            // Touching, never overlapping: gaps are computed against the
            // ready windows under the same lock that inserts them.
            if windows[i].end() == windows[i + 1].start {
                let next = windows.remove(i + 1);
                let cur = &mut windows[i];
                if cur.df.vstack_mut(&next.df).is_err() {
                    // Shape drift between materializations; keep both apart
                    // rather than corrupt the merged window.
                    windows.insert(i + 1, next);
                    i += 1;
                    continue;
                }
                cur.last_access = cur.last_access.max(next.last_access);
            } else {
                i += 1;
            }
        }
    }

    /// Evict least-recently-used windows until the budget holds. Returns
    /// the number of windows evicted.
    fn evict_to_budget(&mut self, budget: usize) -> u64 {
        let mut evicted = 0u64;
        while self.cached_rows > budget {
            let mut oldest: Option<(PlanId, usize, u64)> = None;
            for (&plan, windows) in &self.windows {
                for (idx, w) in windows.iter().enumerate() {
                    if oldest.map_or(true, |(_, _, seq)| w.last_access < seq) {
                        oldest = Some((plan, idx, w.last_access));
                    }
                }
            }
            let Some((plan, idx, _)) = oldest else { break };
            let windows = self.windows.get_mut(&plan).expect("plan vanished");
            let w = windows.remove(idx);
            self.cached_rows -= w.df.height();
            if windows.is_empty() {
                self.windows.remove(&plan);
            }
            evicted += 1;
            self.stats.evictions += 1;
        }
        evicted
    }
}

/// Clamp a request to the known post-transform total, when there is one.
fn clamp_to_total(rows: &Range<usize>, total: Option<usize>) -> Range<usize> {
    match total {
        Some(t) => rows.start.min(t)..rows.end.min(t),
        None => rows.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_windows(plan: PlanId, ranges: &[Range<usize>]) -> CacheState {
        let mut state = CacheState {
            windows: HashMap::new(),
            totals: HashMap::new(),
            in_flight: Vec::new(),
            cached_rows: 0,
            access_seq: 0,
            stats: CacheStats::default(),
        };
        for r in ranges {
            let df = polars::prelude::df!(
                "v" => (r.start as i64..r.end as i64).collect::<Vec<i64>>()
            )
            .unwrap();
            state.insert(plan, r.start, df);
        }
        state
    }

    fn plan_id() -> PlanId {
        crate::plan::TransformPlan::new().id()
    }

    #[test]
    fn gaps_cover_uncached_subranges() {
        let plan = plan_id();
        let state = state_with_windows(plan, &[10..20, 30..40]);
        assert_eq!(state.missing_gaps(plan, &(0..50)), vec![0..10, 20..30, 40..50]);
        assert_eq!(state.missing_gaps(plan, &(12..18)), Vec::<Range<usize>>::new());
        assert_eq!(state.missing_gaps(plan, &(15..35)), vec![20..30]);
        assert_eq!(state.missing_gaps(plan, &(40..45)), vec![40..45]);
    }

    #[test]
    fn merge_makes_contiguous_coverage_one_window() {
        let plan = plan_id();
        let mut state = state_with_windows(plan, &[0..10, 10..20, 25..30]);
        state.merge_touching(plan);
        let windows = &state.windows[&plan];
        assert_eq!(windows.len(), 2);
        assert_eq!((windows[0].start, windows[0].end()), (0, 20));
        assert_eq!((windows[1].start, windows[1].end()), (25, 30));
        assert_eq!(state.cached_rows, 25);
    }

    #[test]
    fn eviction_is_lru_and_respects_budget() {
        let plan = plan_id();
        let mut state = state_with_windows(plan, &[0..10, 20..30, 40..50]);
        // Touch the first window so the second becomes LRU.
        state.try_serve(plan, &(0..5)).unwrap();
        let evicted = state.evict_to_budget(25);
        assert_eq!(evicted, 1);
        assert!(state.cached_rows <= 25);
        let windows = &state.windows[&plan];
        assert!(windows.iter().any(|w| w.start == 0));
        assert!(windows.iter().any(|w| w.start == 40));
    }

    #[test]
    fn serving_slices_covering_window() {
        let plan = plan_id();
        let mut state = state_with_windows(plan, &[100..200]);
        let df = state.try_serve(plan, &(150..160)).unwrap();
        assert_eq!(df.height(), 10);
        let v = df.column("v").unwrap().i64().unwrap();
        assert_eq!(v.get(0), Some(150));
        assert!(state.try_serve(plan, &(150..250)).is_none());
    }
}
