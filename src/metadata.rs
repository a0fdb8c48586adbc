//! Triplet metadata tables.
//!
//! A table has string columns `a`, `b`, `c` (recording paths relative to the
//! data root) and numeric columns `a_loc`, `b_loc`, `c_loc` (offsets in
//! seconds, `-1` for "whole file"). Tables can be read from Arrow IPC
//! streams, Feather (Arrow IPC file) files, Parquet and CSV.

use arrow::array::{Array, ArrayRef, AsArray, Float64Array, RecordBatch, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type};
use arrow::ipc::reader::{FileReader, StreamReader};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

use crate::dataset::Role;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Missing column: {0}")]
    MissingColumn(String),
    #[error("Invalid column type for {0}")]
    InvalidColumnType(String),
    #[error("Null value in column {column} at row {row}")]
    NullValue { column: String, row: usize },
    #[error("Unsupported metadata file extension: .{0}")]
    UnsupportedExtension(String),
}

/// One recording reference with its offset, as stored in the table.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipRef {
    pub path: String,
    /// Seconds, or [`SENTINEL_OFFSET`](crate::window::SENTINEL_OFFSET).
    pub offset: f64,
}

impl ClipRef {
    pub fn new(path: impl Into<String>, offset: f64) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }
}

/// One row: anchor (`a`), neighbor (`b`) and distant (`c`) clips.
#[derive(Debug, Clone, PartialEq)]
pub struct TripletRecord {
    pub anchor: ClipRef,
    pub neighbor: ClipRef,
    pub distant: ClipRef,
}

impl TripletRecord {
    pub fn clip(&self, role: Role) -> &ClipRef {
        match role {
            Role::Anchor => &self.anchor,
            Role::Neighbor => &self.neighbor,
            Role::Distant => &self.distant,
        }
    }
}

/// Immutable, ordered collection of triplet rows.
#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    rows: Vec<TripletRecord>,
}

impl MetadataTable {
    pub fn new(rows: Vec<TripletRecord>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TripletRecord> {
        self.rows.get(index)
    }

    pub fn rows(&self) -> &[TripletRecord] {
        &self.rows
    }

    /// Load a table, dispatching on the file extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, MetadataError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match ext.as_str() {
            "arrow" | "ipc" => Self::from_arrow_stream(path),
            "feather" => Self::from_arrow_file(path),
            "parquet" | "pq" => Self::from_parquet(path),
            "csv" => Self::from_csv(path),
            other => Err(MetadataError::UnsupportedExtension(other.to_string())),
        }
    }

    /// Read an Arrow IPC stream.
    pub fn from_arrow_stream<P: AsRef<Path>>(path: P) -> Result<Self, MetadataError> {
        let file = File::open(path)?;
        let reader = StreamReader::try_new(BufReader::new(file), None)?;
        Self::from_batches(reader)
    }

    /// Read an Arrow IPC file (Feather v2).
    pub fn from_arrow_file<P: AsRef<Path>>(path: P) -> Result<Self, MetadataError> {
        let file = File::open(path)?;
        let reader = FileReader::try_new(BufReader::new(file), None)?;
        Self::from_batches(reader)
    }

    pub fn from_parquet<P: AsRef<Path>>(path: P) -> Result<Self, MetadataError> {
        let file = File::open(path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        Self::from_batches(reader)
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, MetadataError> {
        let mut reader = csv::Reader::from_path(path)?;
        let rows = reader
            .deserialize::<CsvRow>()
            .map(|row| row.map(TripletRecord::from).map_err(MetadataError::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rows))
    }

    fn from_batches<I>(batches: I) -> Result<Self, MetadataError>
    where
        I: IntoIterator<Item = Result<RecordBatch, arrow::error::ArrowError>>,
    {
        let mut rows = Vec::new();
        for batch in batches {
            extract_rows(&batch?, &mut rows)?;
        }
        Ok(Self::new(rows))
    }
}

impl FromIterator<TripletRecord> for MetadataTable {
    fn from_iter<I: IntoIterator<Item = TripletRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[derive(Deserialize)]
struct CsvRow {
    a: String,
    b: String,
    c: String,
    a_loc: f64,
    b_loc: f64,
    c_loc: f64,
}

impl From<CsvRow> for TripletRecord {
    fn from(row: CsvRow) -> Self {
        TripletRecord {
            anchor: ClipRef::new(row.a, row.a_loc),
            neighbor: ClipRef::new(row.b, row.b_loc),
            distant: ClipRef::new(row.c, row.c_loc),
        }
    }
}

fn extract_rows(batch: &RecordBatch, rows: &mut Vec<TripletRecord>) -> Result<(), MetadataError> {
    let (a, b, c) = (
        string_column(batch, "a")?,
        string_column(batch, "b")?,
        string_column(batch, "c")?,
    );
    let (a_loc, b_loc, c_loc) = (
        float_column(batch, "a_loc")?,
        float_column(batch, "b_loc")?,
        float_column(batch, "c_loc")?,
    );

    let columns = [
        ("a", a.as_string::<i32>(), "a_loc", a_loc.as_primitive::<Float64Type>()),
        ("b", b.as_string::<i32>(), "b_loc", b_loc.as_primitive::<Float64Type>()),
        ("c", c.as_string::<i32>(), "c_loc", c_loc.as_primitive::<Float64Type>()),
    ];

    for row in 0..batch.num_rows() {
        let clip = |(path_col, paths, loc_col, locs): &(&str, &StringArray, &str, &Float64Array)| {
            if paths.is_null(row) {
                return Err(MetadataError::NullValue {
                    column: path_col.to_string(),
                    row,
                });
            }
            if locs.is_null(row) {
                return Err(MetadataError::NullValue {
                    column: loc_col.to_string(),
                    row,
                });
            }
            Ok(ClipRef::new(paths.value(row), locs.value(row)))
        };

        rows.push(TripletRecord {
            anchor: clip(&columns[0])?,
            neighbor: clip(&columns[1])?,
            distant: clip(&columns[2])?,
        });
    }
    Ok(())
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef, MetadataError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| MetadataError::MissingColumn(name.to_string()))
}

fn string_column(batch: &RecordBatch, name: &str) -> Result<ArrayRef, MetadataError> {
    let col = column(batch, name)?;
    match col.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => {
            Ok(cast(col, &DataType::Utf8)?)
        }
        _ => Err(MetadataError::InvalidColumnType(format!("{name} (expected string)"))),
    }
}

fn float_column(batch: &RecordBatch, name: &str) -> Result<ArrayRef, MetadataError> {
    let col = column(batch, name)?;
    if col.data_type().is_numeric() {
        Ok(cast(col, &DataType::Float64)?)
    } else {
        Err(MetadataError::InvalidColumnType(format!("{name} (expected number)")))
    }
}
