//! Core error taxonomy.
//!
//! Typed variants rather than string matching so callers can decide behavior
//! per class: `Open` is fatal to the dataset handle, `Validation` reverts to
//! the prior transform plan, `PartitionRead` fails only the affected window,
//! `BudgetExceeded` is reported and never silently truncated.

use std::path::PathBuf;

use polars::prelude::PolarsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbvError {
    /// The source could not be opened: missing, unreadable, or not a
    /// recognized columnar format. Fatal to the dataset handle; no retry.
    #[error("cannot open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    /// Malformed filter/sort input. Recoverable; the view controller
    /// reverts to the prior transform plan.
    #[error("invalid expression: {0}")]
    Validation(String),

    /// A partition read kept failing after bounded retries. Only the window
    /// that needed the partition fails, not the dataset.
    #[error("partition {partition} unreadable after {attempts} attempts: {source}")]
    PartitionRead {
        partition: usize,
        attempts: u32,
        source: PolarsError,
    },

    /// The requested window cannot fit in the cache even after evicting
    /// everything else.
    #[error("window of {requested} rows exceeds cache budget of {budget} rows")]
    BudgetExceeded { requested: usize, budget: usize },

    /// The request was superseded and its result discarded. Carries no
    /// cache side effects.
    #[error("request cancelled")]
    Cancelled,

    /// Row-range annotation added by the lazy frame before surfacing an
    /// error to the view controller.
    #[error("while materializing rows [{start}, {end}): {source}")]
    Window {
        start: usize,
        end: usize,
        source: Box<DbvError>,
    },

    #[error(transparent)]
    Polars(#[from] PolarsError),
}

pub type Result<T, E = DbvError> = std::result::Result<T, E>;

impl DbvError {
    /// Wrap an error with the row range that was being materialized.
    pub fn for_range(self, start: usize, end: usize) -> Self {
        match self {
            // Already annotated; keep the innermost (most precise) range.
            e @ DbvError::Window { .. } => e,
            e => DbvError::Window {
                start,
                end,
                source: Box::new(e),
            },
        }
    }

    /// True when the error only means a newer request superseded this one.
    pub fn is_cancelled(&self) -> bool {
        match self {
            DbvError::Cancelled => true,
            DbvError::Window { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// User-facing message for display in the error strip. Polars internals are
/// summarized by variant rather than dumped verbatim.
pub fn user_message(err: &DbvError) -> String {
    match err {
        DbvError::Polars(pe) => user_message_from_polars(pe),
        DbvError::Window { start, end, source } => {
            format!("rows [{}, {}): {}", start, end, user_message(source))
        }
        other => other.to_string(),
    }
}

/// Format a PolarsError by matching on its variant, keeping messages
/// actionable and implementation-agnostic.
pub fn user_message_from_polars(err: &PolarsError) -> String {
    use polars::prelude::PolarsError as PE;

    match err {
        PE::ColumnNotFound(msg) => format!(
            "Column not found: {}. Check spelling and that the column exists.",
            msg
        ),
        PE::IO { error, msg } => match msg {
            Some(m) => format!("I/O error: {} ({})", error, m),
            None => format!("I/O error: {}", error),
        },
        PE::NoData(msg) => format!("No data: {}", msg),
        PE::SchemaMismatch(msg) => format!("Schema mismatch: {}", msg),
        PE::ShapeMismatch(msg) => format!("Row shape mismatch: {}", msg),
        PE::InvalidOperation(msg) => format!("Operation not allowed: {}", msg),
        PE::OutOfBounds(msg) => format!("Index or row out of bounds: {}", msg),
        PE::ComputeError(msg) => msg.to_string(),
        PE::Context { error, msg } => {
            format!("{}: {}", msg, user_message_from_polars(error))
        }
        #[allow(unreachable_patterns)]
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_annotation_keeps_innermost() {
        let err = DbvError::Validation("bad".into())
            .for_range(10, 20)
            .for_range(0, 100);
        match err {
            DbvError::Window { start, end, .. } => {
                assert_eq!((start, end), (10, 20));
            }
            other => panic!("expected Window, got {other}"),
        }
    }

    #[test]
    fn cancelled_detected_through_annotation() {
        let err = DbvError::Cancelled.for_range(0, 10);
        assert!(err.is_cancelled());
        assert!(!DbvError::Validation("x".into()).is_cancelled());
    }
}
