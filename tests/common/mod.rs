use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Write a Parquet file with `rows` rows split into row groups of
/// `row_group` rows. Column `a` is the row index, `b` is a text label.
pub fn write_parquet(dir: &Path, name: &str, rows: usize, row_group: usize) -> PathBuf {
    let path = dir.join(name);
    let mut df = df!(
        "a" => (0..rows as i64).collect::<Vec<i64>>(),
        "b" => (0..rows).map(|i| format!("row_{}", i)).collect::<Vec<String>>(),
    )
    .unwrap();
    let file = File::create(&path).unwrap();
    ParquetWriter::new(file)
        .with_row_group_size(Some(row_group))
        .finish(&mut df)
        .unwrap();
    path
}

/// Like [`write_parquet`] but with `a` in descending order, so an ascending
/// sort reverses the file.
pub fn write_parquet_descending(dir: &Path, name: &str, rows: usize, row_group: usize) -> PathBuf {
    let path = dir.join(name);
    let mut df = df!(
        "a" => (0..rows as i64).rev().collect::<Vec<i64>>(),
    )
    .unwrap();
    let file = File::create(&path).unwrap();
    ParquetWriter::new(file)
        .with_row_group_size(Some(row_group))
        .finish(&mut df)
        .unwrap();
    path
}
