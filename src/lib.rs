//! dbv: out-of-core paginated viewing over columnar datasets.
//!
//! The engine is layered: [`source::Dataset`] maps partitioned files to a
//! global row index, [`frame::LazyTable`] materializes row ranges under a
//! [`plan::TransformPlan`], [`cache::WindowCache`] keeps recently served
//! windows under a row budget, and [`view::ViewController`] drives it all
//! from user intents. The terminal frontend lives in [`app`] and [`render`];
//! everything below the render adapter is frontend-agnostic.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod frame;
pub mod plan;
pub mod query;
pub mod render;
pub mod source;
pub mod view;
pub mod worker;

pub use app::{App, AppEvent};
pub use cache::{CacheStats, CachedRows, WindowCache};
pub use config::{AppConfig, ConfigManager};
pub use error::{DbvError, Result};
pub use frame::{LazyTable, Materialized};
pub use plan::{PlanId, SortDirection, TransformPlan};
pub use source::{Dataset, ORIGIN_COLUMN};
pub use view::{SortOutcome, ViewController, ViewEvent, ViewFrame, ViewMode};
pub use worker::{CancelToken, WorkerPool};

/// Application name used for the config directory and other app paths
pub const APP_NAME: &str = "dbv";
