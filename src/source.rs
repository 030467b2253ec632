//! Column store adapter: opens a columnar dataset and owns all disk I/O.
//!
//! A dataset is a single Parquet file, a directory of Parquet files, or an
//! Arrow IPC file. Partitions are Parquet row groups (one partition per IPC
//! file); their row counts come from file metadata at open time, so schema
//! and total row count are known without reading any data pages.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use polars::prelude::*;
use polars_parquet::parquet::read::read_metadata;
use tracing::{debug, warn};

use crate::error::{DbvError, Result};
use crate::worker::CancelToken;

/// Pre-transform row index column carried through every read so a row's
/// original dataset offset stays recoverable after filtering and sorting.
pub const ORIGIN_COLUMN: &str = "__origin";

/// Base delay for partition read retries; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SourceFormat {
    Parquet,
    Ipc,
}

/// A contiguous, independently readable chunk of the dataset.
#[derive(Clone, Copy, Debug)]
struct Partition {
    /// Index into `Dataset::files`.
    file: usize,
    /// First row of this partition in global (pre-transform) numbering.
    start: usize,
    /// Row offset of this partition within its file.
    file_offset: usize,
    rows: usize,
}

/// Immutable handle to an on-disk columnar source. Created by
/// [`Dataset::open`], never mutated afterwards.
#[derive(Debug)]
pub struct Dataset {
    files: Vec<PathBuf>,
    format: SourceFormat,
    partitions: Vec<Partition>,
    /// Cumulative end row per partition, for O(log P) partition lookup.
    boundaries: Vec<usize>,
    schema: Arc<Schema>,
    total_rows: usize,
    read_retries: u32,
    // Instrumentation for the debug panel and partition-pruning tests.
    read_calls: AtomicUsize,
    partitions_read: AtomicUsize,
}

impl Dataset {
    /// Open a columnar dataset at `path`. Fails when the path is missing,
    /// unreadable, or not a recognized columnar format.
    pub fn open(path: &Path, read_retries: u32) -> Result<Self> {
        let open_err = |reason: String| DbvError::Open {
            path: path.to_path_buf(),
            reason,
        };

        if !path.exists() {
            return Err(open_err("no such file or directory".into()));
        }

        let (files, format) = if path.is_dir() {
            let files = parquet_files_in_dir(path)
                .map_err(|e| open_err(format!("cannot list directory: {e}")))?;
            if files.is_empty() {
                return Err(open_err("directory contains no .parquet files".into()));
            }
            (files, SourceFormat::Parquet)
        } else {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            match ext.as_deref() {
                Some("parquet" | "pq") => (vec![path.to_path_buf()], SourceFormat::Parquet),
                Some("ipc" | "feather" | "arrow") => (vec![path.to_path_buf()], SourceFormat::Ipc),
                other => {
                    return Err(open_err(format!(
                        "unrecognized columnar format (extension {:?})",
                        other.unwrap_or("")
                    )))
                }
            }
        };

        let (partitions, schema) = match format {
            SourceFormat::Parquet => scan_parquet_layout(&files)
                .map_err(|e| open_err(format!("not readable as Parquet: {e}")))?,
            SourceFormat::Ipc => scan_ipc_layout(&files)
                .map_err(|e| open_err(format!("not readable as Arrow IPC: {e}")))?,
        };

        let mut boundaries = Vec::with_capacity(partitions.len());
        let mut total_rows = 0usize;
        for p in &partitions {
            total_rows += p.rows;
            boundaries.push(total_rows);
        }
        debug!(
            files = files.len(),
            partitions = partitions.len(),
            total_rows,
            "opened dataset"
        );

        Ok(Self {
            files,
            format,
            partitions,
            boundaries,
            schema,
            total_rows,
            read_retries,
            read_calls: AtomicUsize::new(0),
            partitions_read: AtomicUsize::new(0),
        })
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition holding the given global row index. Binary search over the
    /// cumulative boundary table built at open time.
    pub fn partition_at(&self, row: usize) -> usize {
        self.boundaries
            .partition_point(|&end| end <= row)
            .min(self.partitions.len().saturating_sub(1))
    }

    /// Partitions overlapping a global row range, as `start..end` ids.
    pub fn partitions_for(&self, rows: std::ops::Range<usize>) -> std::ops::Range<usize> {
        if rows.start >= rows.end || self.total_rows == 0 {
            return 0..0;
        }
        let first = self.partition_at(rows.start.min(self.total_rows - 1));
        let last = self.partition_at((rows.end - 1).min(self.total_rows - 1));
        first..last + 1
    }

    /// Global row index of the first row of a partition.
    pub fn partition_start(&self, partition: usize) -> usize {
        self.partitions[partition].start
    }

    /// Number of rows in a partition.
    pub fn partition_len(&self, partition: usize) -> usize {
        self.partitions[partition].rows
    }

    /// Read whole partitions, in ascending partition order, optionally
    /// projected to a column subset. The only operation that performs disk
    /// I/O; safe to call concurrently for disjoint partition sets. Output
    /// rows carry [`ORIGIN_COLUMN`] with their global pre-transform index.
    pub fn read_rows(
        &self,
        partitions: std::ops::Range<usize>,
        columns: Option<&[String]>,
        cancel: &CancelToken,
    ) -> Result<DataFrame> {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        let mut out: Option<DataFrame> = None;

        // Consecutive partitions of the same file collapse into one scan.
        let mut id = partitions.start;
        while id < partitions.end {
            if cancel.is_cancelled() {
                return Err(DbvError::Cancelled);
            }
            let file = self.partitions[id].file;
            let run_start = id;
            while id < partitions.end && self.partitions[id].file == file {
                id += 1;
            }
            let df = self.read_partition_run(run_start, id, columns)?;
            out = Some(match out {
                Some(mut acc) => {
                    acc.vstack_mut(&df)?;
                    acc
                }
                None => df,
            });
        }

        match out {
            Some(df) => Ok(df),
            // Empty partition set: empty frame with the right shape.
            None => {
                let mut lf = DataFrame::empty_with_schema(&self.schema)
                    .lazy()
                    .with_row_index(ORIGIN_COLUMN, None);
                if let Some(names) = columns {
                    let mut exprs: Vec<Expr> = Vec::with_capacity(names.len() + 1);
                    exprs.push(col(ORIGIN_COLUMN));
                    exprs.extend(names.iter().map(|n| col(n.as_str())));
                    lf = lf.select(exprs);
                }
                Ok(lf.collect()?)
            }
        }
    }

    /// Read a run of consecutive partitions within one file, with bounded
    /// retries and exponential backoff on transient failures.
    fn read_partition_run(
        &self,
        run_start: usize,
        run_end: usize,
        columns: Option<&[String]>,
    ) -> Result<DataFrame> {
        let first = self.partitions[run_start];
        let rows: usize = self.partitions[run_start..run_end]
            .iter()
            .map(|p| p.rows)
            .sum();
        let file_global_start = first.start - first.file_offset;

        let mut attempt = 0u32;
        loop {
            match self.scan_file_slice(
                first.file,
                file_global_start,
                first.file_offset,
                rows,
                columns,
            ) {
                Ok(df) => {
                    self.partitions_read
                        .fetch_add(run_end - run_start, Ordering::Relaxed);
                    debug!(
                        partitions = ?(run_start..run_end),
                        rows = df.height(),
                        "read partition run"
                    );
                    return Ok(df);
                }
                Err(e) if attempt < self.read_retries => {
                    warn!(partition = run_start, attempt, error = %e, "partition read failed; retrying");
                    std::thread::sleep(RETRY_BACKOFF * 2u32.saturating_pow(attempt));
                    attempt += 1;
                }
                Err(e) => {
                    return Err(DbvError::PartitionRead {
                        partition: run_start,
                        attempts: attempt + 1,
                        source: e,
                    })
                }
            }
        }
    }

    fn scan_file_slice(
        &self,
        file: usize,
        file_global_start: usize,
        offset_in_file: usize,
        rows: usize,
        columns: Option<&[String]>,
    ) -> PolarsResult<DataFrame> {
        let pl_path = PlPath::Local(Arc::from(self.files[file].as_path()));
        let lf = match self.format {
            SourceFormat::Parquet => LazyFrame::scan_parquet(pl_path, ScanArgsParquet::default())?,
            SourceFormat::Ipc => {
                LazyFrame::scan_ipc(pl_path, Default::default(), Default::default())?
            }
        };
        let mut lf = lf
            .with_row_index(ORIGIN_COLUMN, Some(file_global_start as IdxSize))
            .slice(offset_in_file as i64, rows as IdxSize);
        if let Some(names) = columns {
            let mut exprs: Vec<Expr> = Vec::with_capacity(names.len() + 1);
            exprs.push(col(ORIGIN_COLUMN));
            exprs.extend(names.iter().map(|n| col(n.as_str())));
            lf = lf.select(exprs);
        }
        lf.collect()
    }

    /// Total partitions read so far (debug panel; also lets tests assert
    /// that navigation never touched partitions outside the viewed range).
    pub fn partitions_read(&self) -> usize {
        self.partitions_read.load(Ordering::Relaxed)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::Relaxed)
    }
}

/// All .parquet files under a directory (nested key=value layouts allowed),
/// sorted by path for a stable row order.
fn parquet_files_in_dir(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("parquet"))
            {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Build the partition table from Parquet footers: one partition per row
/// group, row counts from metadata only.
fn scan_parquet_layout(files: &[PathBuf]) -> PolarsResult<(Vec<Partition>, Arc<Schema>)> {
    let mut partitions = Vec::new();
    let mut schema: Option<Arc<Schema>> = None;
    let mut global_start = 0usize;

    for (file_idx, path) in files.iter().enumerate() {
        let mut f = File::open(path).map_err(PolarsError::from)?;
        let meta = read_metadata(&mut f)?;
        if schema.is_none() {
            let mut reader = ParquetReader::new(File::open(path).map_err(PolarsError::from)?);
            let arrow_schema = reader.schema()?;
            schema = Some(Arc::new(Schema::from_arrow_schema(arrow_schema.as_ref())));
        }
        let mut file_offset = 0usize;
        for rg in &meta.row_groups {
            let rows = rg.num_rows();
            partitions.push(Partition {
                file: file_idx,
                start: global_start,
                file_offset,
                rows,
            });
            global_start += rows;
            file_offset += rows;
        }
    }

    let schema = schema.ok_or_else(|| PolarsError::NoData("no parquet files".into()))?;
    Ok((partitions, schema))
}

/// IPC files expose no cheap row-group table; treat each file as one
/// partition and count rows with a metadata-only `len()` scan.
fn scan_ipc_layout(files: &[PathBuf]) -> PolarsResult<(Vec<Partition>, Arc<Schema>)> {
    let mut partitions = Vec::new();
    let mut schema: Option<Arc<Schema>> = None;
    let mut global_start = 0usize;

    for (file_idx, path) in files.iter().enumerate() {
        let pl_path = PlPath::Local(Arc::from(path.as_path()));
        let lf = LazyFrame::scan_ipc(pl_path, Default::default(), Default::default())?;
        if schema.is_none() {
            schema = Some(lf.clone().collect_schema()?);
        }
        let counted = lf.select([len()]).collect()?;
        let rows = match counted.get(0).and_then(|r| r.first().cloned()) {
            Some(AnyValue::UInt32(n)) => n as usize,
            _ => 0,
        };
        partitions.push(Partition {
            file: file_idx,
            start: global_start,
            file_offset: 0,
            rows,
        });
        global_start += rows;
    }

    let schema = schema.ok_or_else(|| PolarsError::NoData("no ipc files".into()))?;
    Ok((partitions, schema))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_parquet(dir: &Path, name: &str, rows: usize, row_group: usize) -> PathBuf {
        let path = dir.join(name);
        let mut df = df!(
            "a" => (0..rows as i64).collect::<Vec<i64>>(),
            "b" => (0..rows).map(|i| format!("row_{i}")).collect::<Vec<String>>(),
        )
        .unwrap();
        let file = File::create(&path).unwrap();
        ParquetWriter::new(file)
            .with_row_group_size(Some(row_group))
            .finish(&mut df)
            .unwrap();
        path
    }

    #[test]
    fn open_missing_path_fails() {
        let err = Dataset::open(Path::new("/does/not/exist.parquet"), 0).unwrap_err();
        assert!(matches!(err, DbvError::Open { .. }));
    }

    #[test]
    fn open_unrecognized_extension_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "not columnar").unwrap();
        let err = Dataset::open(&path, 0).unwrap_err();
        assert!(matches!(err, DbvError::Open { .. }));
    }

    #[test]
    fn partition_table_from_row_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_parquet(dir.path(), "data.parquet", 3000, 1000);
        let ds = Dataset::open(&path, 0).unwrap();
        assert_eq!(ds.total_rows(), 3000);
        assert_eq!(ds.partition_count(), 3);
        assert_eq!(ds.partition_at(0), 0);
        assert_eq!(ds.partition_at(999), 0);
        assert_eq!(ds.partition_at(1000), 1);
        assert_eq!(ds.partition_at(2999), 2);
        assert_eq!(ds.partitions_for(900..1100), 0..2);
        assert_eq!(ds.partitions_for(1000..1001), 1..2);
    }

    #[test]
    fn read_rows_carries_origin_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_parquet(dir.path(), "data.parquet", 2000, 500);
        let ds = Dataset::open(&path, 0).unwrap();
        let cancel = CancelToken::new();
        let df = ds.read_rows(1..3, None, &cancel).unwrap();
        assert_eq!(df.height(), 1000);
        let origin = df.column(ORIGIN_COLUMN).unwrap().u32().unwrap();
        assert_eq!(origin.get(0), Some(500));
        assert_eq!(origin.get(999), Some(1499));
    }

    #[test]
    fn read_rows_respects_column_subset() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_parquet(dir.path(), "data.parquet", 100, 100);
        let ds = Dataset::open(&path, 0).unwrap();
        let cancel = CancelToken::new();
        let cols = vec!["b".to_string()];
        let df = ds.read_rows(0..1, Some(&cols), &cancel).unwrap();
        assert_eq!(
            df.get_column_names()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>(),
            vec![ORIGIN_COLUMN, "b"]
        );
    }

    #[test]
    fn directory_of_parquet_files_is_one_dataset() {
        let dir = tempfile::tempdir().unwrap();
        write_parquet(dir.path(), "part-0.parquet", 1000, 1000);
        write_parquet(dir.path(), "part-1.parquet", 1000, 1000);
        let ds = Dataset::open(dir.path(), 0).unwrap();
        assert_eq!(ds.total_rows(), 2000);
        assert_eq!(ds.partition_count(), 2);
        let cancel = CancelToken::new();
        let df = ds.read_rows(1..2, None, &cancel).unwrap();
        let origin = df.column(ORIGIN_COLUMN).unwrap().u32().unwrap();
        assert_eq!(origin.get(0), Some(1000));
    }

    #[test]
    fn cancelled_read_returns_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_parquet(dir.path(), "data.parquet", 100, 50);
        let ds = Dataset::open(&path, 0).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = ds.read_rows(0..2, None, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }
}
