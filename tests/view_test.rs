//! View controller behavior against a live engine: navigation delivery,
//! filter validation and revert, plan restore, and sort confirmation.

mod common;

use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Duration;

use dbv::{
    Dataset, LazyTable, SortDirection, SortOutcome, ViewController, ViewEvent, ViewFrame,
    ViewMode, WindowCache, WorkerPool,
};

use common::write_parquet;

fn controller_over(
    path: &std::path::Path,
    page_rows: usize,
) -> (ViewController, Receiver<ViewEvent>) {
    let dataset = Arc::new(Dataset::open(path, 0).unwrap());
    let frame = Arc::new(LazyTable::new(dataset, 1));
    let cache = Arc::new(WindowCache::new(50_000));
    let pool = Arc::new(WorkerPool::new(2));
    let (tx, rx) = channel::<ViewEvent>();
    (ViewController::new(frame, cache, pool, tx, page_rows), rx)
}

/// Wait for the next delivered frame, skipping failures from superseded
/// requests.
fn next_frame(rx: &Receiver<ViewEvent>) -> ViewFrame {
    loop {
        match rx.recv_timeout(Duration::from_secs(10)).expect("no frame delivered") {
            ViewEvent::Frame(frame) => return frame,
            ViewEvent::Failed(message) => panic!("request failed: {message}"),
        }
    }
}

#[test]
fn navigation_delivers_the_requested_window() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_parquet(dir.path(), "data.parquet", 2000, 500);
    let (mut controller, rx) = controller_over(&path, 50);

    controller.jump_to(500);
    let frame = next_frame(&rx);
    assert_eq!(frame.range, 500..550);
    assert_eq!(frame.total_rows, Some(2000));
    let a = frame.rows.column("a").unwrap().i64().unwrap();
    assert_eq!(a.get(0), Some(500));

    controller.on_frame_delivered(&frame);
    assert_eq!(controller.mode(), ViewMode::Idle);
}

#[test]
fn jump_past_the_end_clamps() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_parquet(dir.path(), "data.parquet", 100, 50);
    let (mut controller, rx) = controller_over(&path, 10);

    controller.jump_to(1_000_000);
    let frame = next_frame(&rx);
    assert_eq!(frame.range.start, 99);
    assert_eq!(frame.rows.height(), 1);
}

#[test]
fn invalid_filter_keeps_the_current_plan() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_parquet(dir.path(), "data.parquet", 100, 50);
    let (mut controller, _rx) = controller_over(&path, 10);

    let before = controller.plan().id();
    assert!(controller.set_filter("a >").is_err());
    assert_eq!(controller.plan().id(), before);
    assert_eq!(controller.mode(), ViewMode::Error);
    assert!(controller.last_error().is_some());

    // An unknown column is also a validation error, caught at apply time.
    assert!(controller.set_filter("nope > 1").is_err());
    assert_eq!(controller.plan().id(), before);
}

#[test]
fn clearing_a_filter_restores_the_prior_plan_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_parquet(dir.path(), "data.parquet", 1000, 250);
    let (mut controller, rx) = controller_over(&path, 20);

    let original = controller.plan().id();
    controller.jump_to(0);
    next_frame(&rx);

    controller.set_filter("a >= 500").unwrap();
    let filtered = next_frame(&rx);
    let a = filtered.rows.column("a").unwrap().i64().unwrap();
    assert_eq!(a.get(0), Some(500));
    assert_ne!(controller.plan().id(), original);

    // Dropping the filter goes back to the same plan identity, so windows
    // cached for it are still addressable.
    controller.clear_filter();
    assert_eq!(controller.plan().id(), original);
    let restored = next_frame(&rx);
    let a = restored.rows.column("a").unwrap().i64().unwrap();
    assert_eq!(a.get(0), Some(0));
}

#[test]
fn expensive_sort_waits_for_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_parquet(dir.path(), "data.parquet", 1000, 250);
    let (mut controller, rx) = controller_over(&path, 10);

    let before = controller.plan().id();
    let outcome = controller
        .set_sort("a", SortDirection::Descending)
        .unwrap();
    assert_eq!(outcome, SortOutcome::NeedsConfirmation);
    // Nothing applied yet.
    assert_eq!(controller.plan().id(), before);
    assert!(controller.plan().sort.is_none());

    controller.confirm_sort();
    assert!(controller.plan().sort.is_some());
    let frame = next_frame(&rx);
    let a = frame.rows.column("a").unwrap().i64().unwrap();
    assert_eq!(a.get(0), Some(999));
}

#[test]
fn declined_sort_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_parquet(dir.path(), "data.parquet", 1000, 250);
    let (mut controller, _rx) = controller_over(&path, 10);

    let before = controller.plan().id();
    let outcome = controller
        .set_sort("a", SortDirection::Ascending)
        .unwrap();
    assert_eq!(outcome, SortOutcome::NeedsConfirmation);
    controller.cancel_sort();
    assert_eq!(controller.plan().id(), before);
    assert_eq!(controller.mode(), ViewMode::Idle);
}

#[test]
fn unknown_sort_key_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_parquet(dir.path(), "data.parquet", 100, 50);
    let (mut controller, _rx) = controller_over(&path, 10);

    let before = controller.plan().id();
    assert!(controller
        .set_sort("missing", SortDirection::Ascending)
        .is_err());
    assert_eq!(controller.plan().id(), before);
    assert_eq!(controller.mode(), ViewMode::Error);
}

#[test]
fn failure_keeps_the_last_good_frame_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_parquet(dir.path(), "data.parquet", 100, 50);
    let (mut controller, rx) = controller_over(&path, 10);

    controller.jump_to(0);
    let frame = next_frame(&rx);
    controller.on_frame_delivered(&frame);

    controller.on_request_failed("partition 3 unreadable".to_string());
    assert_eq!(controller.mode(), ViewMode::Error);
    assert_eq!(controller.last_error(), Some("partition 3 unreadable"));
    // The viewport is unchanged; the app keeps drawing the delivered frame.
    assert_eq!(controller.visible().start, 0);
}
