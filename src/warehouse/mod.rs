//! The remote tabular-data service as seen by the exporter and the loader.
//!
//! [`Warehouse`] is the whole request/response contract both components rely
//! on. [`BqClient`] talks to BigQuery; [`MemoryWarehouse`] keeps everything in
//! process and backs the tests.

mod bigquery;
mod cells;
mod memory;
mod upload;

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use bigquery::BqClient;
pub use memory::{MemoryWarehouse, WarehouseCall};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetRef {
    pub project: String,
    pub dataset: String,
}

impl DatasetRef {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
        }
    }

    pub fn table(&self, table: impl Into<String>) -> TableRef {
        TableRef::new(&self.project, &self.dataset, table)
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.dataset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    pub fn dataset_ref(&self) -> DatasetRef {
        DatasetRef::new(&self.project, &self.dataset)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Column type, as far as turning wire cells into values is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Record,
    Other(String),
}

impl FieldType {
    pub fn parse(name: &str) -> Self {
        match name {
            "STRING" => FieldType::String,
            "INTEGER" | "INT64" => FieldType::Integer,
            "FLOAT" | "FLOAT64" => FieldType::Float,
            "BOOLEAN" | "BOOL" => FieldType::Boolean,
            "TIMESTAMP" => FieldType::Timestamp,
            "RECORD" | "STRUCT" => FieldType::Record,
            other => FieldType::Other(other.to_string()),
        }
    }
}

/// One schema field. `fields` is only populated for records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub field_type: FieldType,
    pub repeated: bool,
    pub fields: Vec<Column>,
}

impl Column {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            repeated: false,
            fields: Vec::new(),
        }
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }

    pub fn with_fields(mut self, fields: Vec<Column>) -> Self {
        self.fields = fields;
        self
    }
}

/// A table and its schema in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub table: TableRef,
    pub columns: Vec<Column>,
}

impl TableDescriptor {
    pub fn new(table: TableRef, columns: Vec<Column>) -> Self {
        Self { table, columns }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// One record, as ordered `(column, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cells(cells: Vec<(String, Value)>) -> Self {
        Self { cells }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cells.push((column.into(), value.into()));
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    pub rows: Vec<Row>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetLookup {
    Found,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    NewlineDelimitedJson,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::NewlineDelimitedJson => "NEWLINE_DELIMITED_JSON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    WriteTruncate,
    WriteAppend,
    WriteEmpty,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::WriteTruncate => "WRITE_TRUNCATE",
            WriteDisposition::WriteAppend => "WRITE_APPEND",
            WriteDisposition::WriteEmpty => "WRITE_EMPTY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    CreateIfNeeded,
    CreateNever,
}

impl CreateDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreateDisposition::CreateIfNeeded => "CREATE_IF_NEEDED",
            CreateDisposition::CreateNever => "CREATE_NEVER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJobConfig {
    pub destination: TableRef,
    pub location: Option<String>,
    pub source_format: SourceFormat,
    pub autodetect: bool,
    pub write_disposition: WriteDisposition,
    pub create_disposition: CreateDisposition,
}

impl LoadJobConfig {
    /// Newline-delimited JSON, auto-detected schema, replacing the table contents.
    pub fn ndjson_truncate(destination: TableRef) -> Self {
        Self {
            destination,
            location: None,
            source_format: SourceFormat::NewlineDelimitedJson,
            autodetect: true,
            write_disposition: WriteDisposition::WriteTruncate,
            create_disposition: CreateDisposition::CreateIfNeeded,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_write_disposition(mut self, disposition: WriteDisposition) -> Self {
        self.write_disposition = disposition;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub project: String,
    pub job_id: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl JobState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "RUNNING" => Some(JobState::Running),
            "DONE" => Some(JobState::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub reason: Option<String>,
    pub message: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub error: Option<JobError>,
    pub output_rows: Option<u64>,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<TableRef>>;

    async fn get_table(&self, table: &TableRef) -> Result<TableDescriptor>;

    /// One page of rows. `None` asks for the first page.
    async fn list_rows(&self, table: &TableDescriptor, page_token: Option<String>) -> Result<RowPage>;

    /// `Absent` only when the service reports the dataset as not found.
    async fn get_dataset(&self, dataset: &DatasetRef) -> Result<DatasetLookup>;

    async fn create_dataset(&self, dataset: &DatasetRef, location: &str) -> Result<()>;

    async fn submit_load_job(&self, source: &Path, config: &LoadJobConfig) -> Result<JobHandle>;

    async fn get_job(&self, job: &JobHandle) -> Result<JobStatus>;
}

/// Forward-only reader over all rows of a table, holding one page at a time.
pub struct RowStream<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    table: &'a TableDescriptor,
    buffer: VecDeque<Row>,
    page_token: Option<String>,
    pages_fetched: usize,
    finished: bool,
}

impl<'a, W: Warehouse + ?Sized> RowStream<'a, W> {
    pub fn new(warehouse: &'a W, table: &'a TableDescriptor) -> Self {
        Self {
            warehouse,
            table,
            buffer: VecDeque::new(),
            page_token: None,
            pages_fetched: 0,
            finished: false,
        }
    }

    pub async fn next(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            if self.finished {
                return Ok(None);
            }

            let page = self.warehouse
                .list_rows(self.table, self.page_token.take())
                .await?;
            self.pages_fetched += 1;
            self.buffer.extend(page.rows);

            match page.next_page_token {
                Some(token) => self.page_token = Some(token),
                None => self.finished = true,
            }
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}
