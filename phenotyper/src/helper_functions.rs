use std::env;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use polars::prelude::*;
use tracing::debug;

use crate::models::polars_err;

pub fn project_root() -> PathBuf {
    match env::var_os("PROJECT_ROOT") {
        Some(val) => PathBuf::from(val),
        None => {
            // Fall back to current directory if PROJECT_ROOT not set
            env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        }
    }
}

pub fn read_csv(file_path: &Path) -> PolarsResult<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(10_000))
        .try_into_reader_with_file_path(Some(file_path.to_path_buf()))?
        .finish()
}

/// Reads a gzip-compressed CSV (`*.csv.gz`).
pub fn read_csv_gz(file_path: &Path) -> PolarsResult<DataFrame> {
    let file = File::open(file_path)?;
    let mut bytes = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut bytes)
        .map_err(|e| polars_err(Box::new(e)))?;
    debug!("Decompressed {} bytes from {}", bytes.len(), file_path.display());

    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(10_000))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()
}

/// Writes `df` as a gzip-compressed CSV, creating parent directories.
pub fn write_csv_gz(df: &mut DataFrame, file_path: &Path) -> PolarsResult<()> {
    ensure_parent(file_path)?;
    let file = File::create(file_path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    CsvWriter::new(&mut encoder).include_header(true).finish(df)?;
    encoder.finish().map_err(|e| polars_err(Box::new(e)))?;
    Ok(())
}

pub fn write_tsv(df: &mut DataFrame, file_path: &Path) -> PolarsResult<()> {
    ensure_parent(file_path)?;
    let mut file = File::create(file_path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .finish(df)
}

pub fn write_parquet(df: &mut DataFrame, file_path: &Path) -> PolarsResult<()> {
    ensure_parent(file_path)?;
    let file = File::create(file_path)?;
    ParquetWriter::new(file).finish(df)?;
    Ok(())
}

pub fn ensure_parent(file_path: &Path) -> PolarsResult<()> {
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Returns the column as `f64`s, nulls become NaN.
pub fn f64_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<f64>> {
    let casted = df.column(name)?.cast(&DataType::Float64)?;
    Ok(casted
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

/// Returns the column as owned strings, nulls become empty strings.
pub fn str_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<String>> {
    let casted = df.column(name)?.cast(&DataType::String)?;
    Ok(casted
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}

/// Casts the named column to `String` in place (plate/well/site keys are
/// compared as text across tables).
pub fn cast_to_string(df: &mut DataFrame, name: &str) -> PolarsResult<()> {
    if df.get_column_names().iter().any(|c| c.as_str() == name) {
        let s = df.column(name)?.cast(&DataType::String)?;
        df.with_column(s)?;
    }
    Ok(())
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

/// Sorted list of files directly inside `dir` whose name ends with `suffix`.
pub fn files_with_suffix(dir: &Path, suffix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| {
            let e = e.ok()?;
            let name = e.file_name();
            if e.file_type().ok()?.is_file() && name.to_string_lossy().ends_with(suffix) {
                Some(e.path())
            } else {
                None
            }
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Sorted list of sub-directories of `dir`.
pub fn sub_directories(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| {
            let e = e.ok()?;
            if e.file_type().ok()?.is_dir() {
                Some(e.path())
            } else {
                None
            }
        })
        .collect();
    dirs.sort();
    Ok(dirs)
}
