//! # Member-Period Table and Data Sources
//!
//! Every stage of the pipeline reads from a [`MemberTable`]: one row per
//! (member id, period start) with the remaining columns kept in their original
//! order. Numeric columns are stored as `f64` with nulls represented as `NaN`;
//! anything else is kept as text so the feature selector can report it.
//!
//! Fetching rows is the job of a [`DataSource`]. A source yields one or more
//! polars `DataFrame` batches which are converted and concatenated here. Column
//! names are trimmed and lower-cased at this boundary, so every later comparison
//! is case-insensitive by construction.

use ahash::AHashMap;
use chrono::NaiveDate;
use log::{info, warn};
use ndarray::Array1;
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default identifier column of the member-period table.
pub const DEFAULT_MEMBER_COLUMN: &str = "fh_id";
/// Default period-start column of the member-period table.
pub const DEFAULT_PERIOD_COLUMN: &str = "effective_month_start";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the input data.")]
    ColumnNotFound(String),
    #[error("Missing values were found in the identifier column '{0}'.")]
    MissingValuesFound(String),
    #[error("Column '{0}' appears more than once after trimming and lower-casing names.")]
    DuplicateColumn(String),
    #[error("Column '{column}' has {found} rows, but the table has {expected}.")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("Batch {batch} does not share the column layout of the first batch.")]
    BatchSchemaMismatch { batch: usize },
    #[error("The data source '{0}' returned no batches.")]
    NoBatches(String),
}

/// Names of the identifier and period columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub member_column: String,
    pub period_column: String,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            member_column: DEFAULT_MEMBER_COLUMN.to_string(),
            period_column: DEFAULT_PERIOD_COLUMN.to_string(),
        }
    }
}

/// Values of a single non-identifier column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// Numeric values, `NaN` where the source was null.
    Numeric(Array1<f64>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(values) => values.len(),
            ColumnData::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnData::Numeric(_))
    }

    fn take(&self, rows: &[usize]) -> ColumnData {
        match self {
            ColumnData::Numeric(values) => {
                ColumnData::Numeric(rows.iter().map(|&r| values[r]).collect())
            }
            ColumnData::Text(values) => {
                ColumnData::Text(rows.iter().map(|&r| values[r].clone()).collect())
            }
        }
    }

    fn extend(&mut self, other: &ColumnData) -> bool {
        match (self, other) {
            (ColumnData::Numeric(values), ColumnData::Numeric(more)) => {
                let mut joined = values.to_vec();
                joined.extend(more.iter().copied());
                *values = Array1::from_vec(joined);
                true
            }
            (ColumnData::Text(values), ColumnData::Text(more)) => {
                values.extend(more.iter().cloned());
                true
            }
            _ => false,
        }
    }
}

/// Trims and lower-cases a column name. All name comparisons go through this.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// The member-period table.
#[derive(Debug, Clone, Default)]
pub struct MemberTable {
    member_ids: Vec<String>,
    periods: Vec<Option<NaiveDate>>,
    names: Vec<String>,
    columns: Vec<ColumnData>,
    index: AHashMap<String, usize>,
}

impl MemberTable {
    /// Builds a table from identifier vectors and named columns. Names are
    /// normalized; every column must have one value per member id.
    pub fn new(
        member_ids: Vec<String>,
        periods: Vec<Option<NaiveDate>>,
        columns: Vec<(String, ColumnData)>,
    ) -> Result<Self, DataError> {
        let rows = member_ids.len();
        if periods.len() != rows {
            return Err(DataError::LengthMismatch {
                column: "period".to_string(),
                expected: rows,
                found: periods.len(),
            });
        }

        let mut names = Vec::with_capacity(columns.len());
        let mut data = Vec::with_capacity(columns.len());
        let mut index = AHashMap::with_capacity(columns.len());
        for (name, values) in columns {
            let name = normalize_name(&name);
            if values.len() != rows {
                return Err(DataError::LengthMismatch {
                    column: name,
                    expected: rows,
                    found: values.len(),
                });
            }
            if index.insert(name.clone(), names.len()).is_some() {
                return Err(DataError::DuplicateColumn(name));
            }
            names.push(name);
            data.push(values);
        }

        Ok(Self {
            member_ids,
            periods,
            names,
            columns: data,
            index,
        })
    }

    /// Converts a polars batch. The identifier and period columns are pulled out;
    /// every other column becomes numeric when its dtype is numeric or boolean,
    /// and text otherwise.
    pub fn from_dataframe(df: &DataFrame, schema: &TableSchema) -> Result<Self, DataError> {
        let original: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let member_key = normalize_name(&schema.member_column);
        let period_key = normalize_name(&schema.period_column);

        let mut member_ids = None;
        let mut periods = None;
        let mut columns = Vec::with_capacity(original.len());
        for raw_name in &original {
            let name = normalize_name(raw_name);
            let column = df.column(raw_name)?;
            if name == member_key {
                if column.null_count() > 0 {
                    return Err(DataError::MissingValuesFound(name));
                }
                let ids = internal::text_values(column)?
                    .into_iter()
                    .map(|v| v.unwrap_or_default())
                    .collect::<Vec<_>>();
                member_ids = Some(ids);
            } else if name == period_key {
                let parsed: Vec<Option<NaiveDate>> = internal::text_values(column)?
                    .iter()
                    .map(|v| v.as_deref().and_then(parse_period))
                    .collect();
                let unparsed = parsed.iter().filter(|p| p.is_none()).count();
                if unparsed > 0 {
                    warn!("{unparsed} rows have a missing or unparseable '{name}' value.");
                }
                periods = Some(parsed);
            } else if internal::is_numeric_dtype(column.dtype()) {
                columns.push((name, ColumnData::Numeric(internal::numeric_values(column)?)));
            } else {
                columns.push((name, ColumnData::Text(internal::text_values(column)?)));
            }
        }

        let member_ids =
            member_ids.ok_or_else(|| DataError::ColumnNotFound(member_key.clone()))?;
        let periods = periods.unwrap_or_else(|| vec![None; member_ids.len()]);
        Self::new(member_ids, periods, columns)
    }

    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }

    pub fn member_ids(&self) -> &[String] {
        &self.member_ids
    }

    pub fn periods(&self) -> &[Option<NaiveDate>] {
        &self.periods
    }

    /// Column names in table order, excluding the identifier and period columns.
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.index
            .get(&normalize_name(name))
            .map(|&i| &self.columns[i])
    }

    /// The numeric values of `name`, or `None` if it is absent or text.
    pub fn numeric(&self, name: &str) -> Option<&Array1<f64>> {
        match self.column(name) {
            Some(ColumnData::Numeric(values)) => Some(values),
            _ => None,
        }
    }

    /// A new table holding the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> MemberTable {
        MemberTable {
            member_ids: rows.iter().map(|&r| self.member_ids[r].clone()).collect(),
            periods: rows.iter().map(|&r| self.periods[r]).collect(),
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c.take(rows)).collect(),
            index: self.index.clone(),
        }
    }

    /// Stacks tables with identical column layouts.
    pub fn concat(tables: Vec<MemberTable>) -> Result<MemberTable, DataError> {
        let mut iter = tables.into_iter();
        let Some(mut combined) = iter.next() else {
            return Ok(MemberTable::default());
        };
        for (offset, table) in iter.enumerate() {
            let batch = offset + 1;
            if table.names != combined.names {
                return Err(DataError::BatchSchemaMismatch { batch });
            }
            for (column, more) in combined.columns.iter_mut().zip(&table.columns) {
                if !column.extend(more) {
                    return Err(DataError::BatchSchemaMismatch { batch });
                }
            }
            combined.member_ids.extend(table.member_ids);
            combined.periods.extend(table.periods);
        }
        Ok(combined)
    }
}

/// Parses the date part of a period value (`YYYY-MM-DD`, optionally followed by a
/// time component).
pub fn parse_period(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// A provider of member-period rows, fetched as one or more batches.
pub trait DataSource {
    /// A short human-readable description used in log lines and errors.
    fn describe(&self) -> String;

    fn fetch_batches(&mut self) -> Result<Vec<DataFrame>, DataError>;
}

/// Reads a delimited text file (tab-separated by default) with polars.
#[derive(Debug, Clone)]
pub struct DelimitedFileSource {
    path: PathBuf,
    separator: u8,
}

impl DelimitedFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            separator: b'\t',
        }
    }

    pub fn with_separator(mut self, separator: u8) -> Self {
        self.separator = separator;
        self
    }
}

impl DataSource for DelimitedFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn fetch_batches(&mut self) -> Result<Vec<DataFrame>, DataError> {
        let df = CsvReader::new(File::open(&self.path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(
                        CsvParseOptions::default().with_separator(self.separator),
                    ),
            )
            .finish()?;
        Ok(vec![df])
    }
}

/// Fetches every batch from `source` and assembles a single table.
pub fn load_table(
    source: &mut dyn DataSource,
    schema: &TableSchema,
) -> Result<MemberTable, DataError> {
    let description = source.describe();
    info!("Fetching member-period data from '{description}'.");
    let batches = source.fetch_batches()?;
    if batches.is_empty() {
        return Err(DataError::NoBatches(description));
    }
    let batch_count = batches.len();
    let tables = batches
        .iter()
        .map(|df| MemberTable::from_dataframe(df, schema))
        .collect::<Result<Vec<_>, _>>()?;
    let table = MemberTable::concat(tables)?;
    info!(
        "Loaded {} rows and {} columns from {} batch(es).",
        table.len(),
        table.column_names().len(),
        batch_count
    );
    Ok(table)
}

mod internal {
    use super::*;

    pub(super) fn is_numeric_dtype(dtype: &DataType) -> bool {
        matches!(
            dtype,
            DataType::Boolean
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
                | DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::Float32
                | DataType::Float64
        )
    }

    pub(super) fn numeric_values(column: &Column) -> Result<Array1<f64>, DataError> {
        let casted = column.cast(&DataType::Float64)?;
        let values: Vec<f64> = casted
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        Ok(Array1::from_vec(values))
    }

    pub(super) fn text_values(column: &Column) -> Result<Vec<Option<String>>, DataError> {
        let casted = column.cast(&DataType::String)?;
        Ok(casted
            .str()?
            .into_iter()
            .map(|v| v.map(|s| s.to_string()))
            .collect())
    }
}
