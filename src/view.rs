//! View controller: turns navigation/filter/sort intents into plan changes
//! and window cache requests.
//!
//! The controller never blocks on I/O. Each visible-range request is
//! submitted to the worker pool; results come back over the event channel
//! and the controller is told via `on_frame_delivered`/`on_request_failed`.
//! Rapid navigation cancels the superseded in-flight request for the old
//! target range; requests for other ranges are left to finish and land in
//! the cache.

use std::ops::Range;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use polars::prelude::{DataFrame, Expr, Schema};
use tracing::debug;

use crate::cache::WindowCache;
use crate::error::{user_message, DbvError, Result};
use crate::frame::LazyTable;
use crate::plan::{SortDirection, TransformPlan};
use crate::worker::{CancelToken, WorkerPool};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ViewMode {
    #[default]
    Idle,
    Navigating,
    Filtering,
    Sorting,
    Error,
}

/// One served window, ready for the render adapter. The rows still carry
/// the origin index column; the renderer decides whether to show it.
#[derive(Clone)]
pub struct ViewFrame {
    pub schema: Arc<Schema>,
    pub rows: DataFrame,
    pub range: Range<usize>,
    pub total_rows: Option<usize>,
}

/// Events the controller emits toward the application loop.
pub enum ViewEvent {
    Frame(ViewFrame),
    Failed(String),
}

/// Outcome of a sort command. A global sort over unordered data forces a
/// one-time full scan, so it is reported back for confirmation instead of
/// silently starting.
#[derive(Debug, Eq, PartialEq)]
pub enum SortOutcome {
    Applied,
    NeedsConfirmation,
}

struct InFlight {
    target: Range<usize>,
    cancel: CancelToken,
}

pub struct ViewController {
    frame: Arc<LazyTable>,
    cache: Arc<WindowCache>,
    pool: Arc<WorkerPool>,
    events: Sender<ViewEvent>,
    plan: Arc<TransformPlan>,
    /// Previous plan, kept for ValidationError revert and for cheap
    /// back-navigation after a filter is removed (its windows stay cached).
    prior_plan: Option<Arc<TransformPlan>>,
    pending_sort: Option<TransformPlan>,
    visible: Range<usize>,
    page_rows: usize,
    focused_row: usize,
    focused_col: usize,
    mode: ViewMode,
    total_rows: Option<usize>,
    in_flight: Option<InFlight>,
    last_error: Option<String>,
}

impl ViewController {
    pub fn new(
        frame: Arc<LazyTable>,
        cache: Arc<WindowCache>,
        pool: Arc<WorkerPool>,
        events: Sender<ViewEvent>,
        page_rows: usize,
    ) -> Self {
        let total = frame.dataset().total_rows();
        Self {
            frame,
            cache,
            pool,
            events,
            plan: Arc::new(TransformPlan::new()),
            prior_plan: None,
            pending_sort: None,
            visible: 0..page_rows.max(1),
            page_rows: page_rows.max(1),
            focused_row: 0,
            focused_col: 0,
            mode: ViewMode::Idle,
            total_rows: Some(total),
            in_flight: None,
            last_error: None,
        }
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn plan(&self) -> &TransformPlan {
        &self.plan
    }

    pub fn visible(&self) -> Range<usize> {
        self.visible.clone()
    }

    pub fn total_rows(&self) -> Option<usize> {
        self.total_rows
    }

    pub fn focused(&self) -> (usize, usize) {
        (self.focused_row, self.focused_col)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Column layout of the current plan, for the render adapter.
    pub fn display_schema(&self) -> Arc<Schema> {
        let source = self.frame.dataset().schema();
        match &self.plan.projection {
            None => source,
            Some(cols) => {
                let mut schema = Schema::with_capacity(cols.len());
                for name in cols {
                    if let Some(dtype) = source.get(name.as_str()) {
                        schema.with_column(name.as_str().into(), dtype.clone());
                    }
                }
                Arc::new(schema)
            }
        }
    }

    /// Viewport height changed; the visible window follows it.
    pub fn set_page_rows(&mut self, rows: usize) {
        self.page_rows = rows.max(1);
        self.visible = self.visible.start..self.visible.start + self.page_rows;
    }

    pub fn scroll_by(&mut self, delta: i64) {
        let start = if delta < 0 {
            self.visible.start.saturating_sub(delta.unsigned_abs() as usize)
        } else {
            self.visible.start.saturating_add(delta as usize)
        };
        self.jump_to(start);
    }

    pub fn page_down(&mut self) {
        self.scroll_by(self.page_rows as i64);
    }

    pub fn page_up(&mut self) {
        self.scroll_by(-(self.page_rows as i64));
    }

    /// Jump so `row` is the first visible row, clamped to keep a full page
    /// in range when the total is known.
    pub fn jump_to(&mut self, row: usize) {
        let start = match self.total_rows {
            Some(total) => row.min(total.saturating_sub(1)),
            None => row,
        };
        self.focused_row = start;
        self.visible = start..start + self.page_rows;
        self.request_visible();
    }

    pub fn focus_col(&mut self, col: usize) {
        self.focused_col = col;
    }

    /// Re-request the current visible range. Cancels a superseded in-flight
    /// request targeting a different range; an identical pending target is
    /// left alone (its result is still wanted).
    pub fn request_visible(&mut self) {
        let target = self.visible.clone();
        if let Some(in_flight) = &self.in_flight {
            if in_flight.target == target {
                return;
            }
            in_flight.cancel.cancel();
        }

        self.mode = ViewMode::Navigating;
        let cancel = CancelToken::new();
        self.in_flight = Some(InFlight {
            target: target.clone(),
            cancel: cancel.clone(),
        });

        let frame = Arc::clone(&self.frame);
        let cache = Arc::clone(&self.cache);
        let plan = Arc::clone(&self.plan);
        let schema = self.display_schema();
        let events = self.events.clone();
        debug!(range = ?target, plan_id = %plan.id(), "requesting window");
        self.pool.submit(move || {
            match cache.get(&frame, &plan, target.clone(), &cancel) {
                Ok(served) => {
                    let range = target.start..target.start + served.df.height();
                    let _ = events.send(ViewEvent::Frame(ViewFrame {
                        schema,
                        rows: served.df,
                        range,
                        total_rows: served.total_rows,
                    }));
                }
                // A cancelled request was superseded; its result is simply
                // discarded.
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    let _ = events.send(ViewEvent::Failed(user_message(&e)));
                }
            }
        });
    }

    /// The app loop delivered a frame; fold its bookkeeping back in.
    pub fn on_frame_delivered(&mut self, frame: &ViewFrame) {
        if let Some(in_flight) = &self.in_flight {
            if in_flight.target.start == frame.range.start {
                self.in_flight = None;
            }
        }
        if frame.total_rows.is_some() {
            self.total_rows = frame.total_rows;
        }
        self.focused_row = self
            .focused_row
            .clamp(frame.range.start, frame.range.end.saturating_sub(1).max(frame.range.start));
        self.last_error = None;
        self.mode = ViewMode::Idle;
    }

    pub fn on_request_failed(&mut self, message: String) {
        // Keep the last good window on screen; only the mode and message
        // change.
        self.in_flight = None;
        self.last_error = Some(message);
        self.mode = ViewMode::Error;
    }

    /// Apply a filter predicate. Malformed input or an unknown column
    /// reports a validation error and leaves the current plan untouched.
    pub fn set_filter(&mut self, predicate: &str) -> Result<()> {
        self.mode = ViewMode::Filtering;
        let new_plan = match self.plan.with_filter(predicate) {
            Ok(p) => p,
            Err(e) => return Err(self.validation_failed(e)),
        };
        if let Some(filter) = &new_plan.filter {
            let schema = self.frame.dataset().schema();
            for e in filter.expr.clone().into_iter() {
                if let Expr::Column(name) = e {
                    if schema.get(name.as_str()).is_none() {
                        return Err(self.validation_failed(DbvError::Validation(format!(
                            "unknown column '{name}' in filter"
                        ))));
                    }
                }
            }
        }
        self.apply_plan(new_plan);
        Ok(())
    }

    fn validation_failed(&mut self, e: DbvError) -> DbvError {
        self.mode = ViewMode::Error;
        self.last_error = Some(user_message(&e));
        e
    }

    /// Drop the active filter. When the prior plan is the unfiltered one we
    /// came from, reuse it so its cached windows serve immediately.
    pub fn clear_filter(&mut self) {
        if self.plan.filter.is_none() {
            return;
        }
        let restored = match &self.prior_plan {
            Some(prior) if prior.filter.is_none() => Arc::clone(prior),
            _ => Arc::new(self.plan.without_filter()),
        };
        self.swap_plan(restored);
    }

    /// Request a sort. An expensive global sort (row order not yet known)
    /// is held back until `confirm_sort`.
    pub fn set_sort(&mut self, key: &str, direction: SortDirection) -> Result<SortOutcome> {
        if self.frame.dataset().schema().get(key).is_none() {
            return Err(
                self.validation_failed(DbvError::Validation(format!("unknown sort column '{key}'")))
            );
        }
        self.mode = ViewMode::Sorting;
        let candidate = self.plan.with_sort(key, direction);
        if self.frame.sort_is_expensive(&candidate) {
            self.pending_sort = Some(candidate);
            return Ok(SortOutcome::NeedsConfirmation);
        }
        self.apply_plan(candidate);
        Ok(SortOutcome::Applied)
    }

    /// Proceed with the expensive sort reported by `set_sort`.
    pub fn confirm_sort(&mut self) {
        if let Some(plan) = self.pending_sort.take() {
            self.apply_plan(plan);
        }
    }

    pub fn cancel_sort(&mut self) {
        self.pending_sort = None;
        self.mode = ViewMode::Idle;
    }

    pub fn clear_sort(&mut self) {
        if self.plan.sort.is_none() {
            return;
        }
        let restored = match &self.prior_plan {
            Some(prior) if prior.sort.is_none() => Arc::clone(prior),
            _ => Arc::new(self.plan.without_sort()),
        };
        self.swap_plan(restored);
    }

    pub fn set_projection(&mut self, columns: Vec<String>) {
        self.apply_plan(self.plan.with_projection(columns));
    }

    /// Install a new plan and restart at the top of the result.
    fn apply_plan(&mut self, plan: TransformPlan) {
        self.swap_plan(Arc::new(plan));
    }

    fn swap_plan(&mut self, plan: Arc<TransformPlan>) {
        debug!(from = %self.plan.id(), to = %plan.id(), "switching transform plan");
        // Any pending request belongs to the outgoing plan now.
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
        }
        self.prior_plan = Some(std::mem::replace(&mut self.plan, plan));
        // Post-transform numbering changed; totals are unknown until a
        // materialization establishes them (immediately, for plans the
        // cache has already seen).
        self.total_rows = self.cache.known_total(self.plan.id()).or_else(|| {
            (self.plan.filter.is_none() && self.plan.sort.is_none())
                .then(|| self.frame.dataset().total_rows())
        });
        self.visible = 0..self.page_rows;
        self.focused_row = 0;
        self.request_visible();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_start_idle() {
        assert_eq!(ViewMode::default(), ViewMode::Idle);
    }
}
