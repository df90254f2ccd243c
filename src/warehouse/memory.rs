use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{BigQueryError, Result, TransferError};
use super::{
    Column, CreateDisposition, DatasetLookup, FieldType, DatasetRef, JobError, JobHandle, JobState, JobStatus,
    LoadJobConfig, Row, RowPage, TableDescriptor, TableRef, Warehouse, WriteDisposition,
};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// A remote call as observed by [`MemoryWarehouse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseCall {
    ListTables(DatasetRef),
    GetTable(TableRef),
    ListRows { table: TableRef, page_token: Option<String> },
    GetDataset(DatasetRef),
    CreateDataset { dataset: DatasetRef, location: String },
    SubmitLoadJob(TableRef),
    GetJob(String),
}

impl WarehouseCall {
    pub fn op(&self) -> &'static str {
        match self {
            WarehouseCall::ListTables(_) => "list_tables",
            WarehouseCall::GetTable(_) => "get_table",
            WarehouseCall::ListRows { .. } => "list_rows",
            WarehouseCall::GetDataset(_) => "get_dataset",
            WarehouseCall::CreateDataset { .. } => "create_dataset",
            WarehouseCall::SubmitLoadJob(_) => "submit_load_job",
            WarehouseCall::GetJob(_) => "get_job",
        }
    }
}

struct StoredTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

struct StoredJob {
    polls_left: usize,
    error: Option<JobError>,
    output_rows: u64,
}

struct Failure {
    op: &'static str,
    successes_left: usize,
    error: BigQueryError,
}

#[derive(Default)]
struct State {
    datasets: BTreeMap<DatasetRef, String>,
    tables: BTreeMap<TableRef, StoredTable>,
    jobs: HashMap<String, StoredJob>,
    failures: Vec<Failure>,
    calls: Vec<WarehouseCall>,
    next_job: u64,
}

/// In-process warehouse with BigQuery-like semantics for datasets, paged
/// row listing and load jobs.
pub struct MemoryWarehouse {
    state: Mutex<State>,
    page_size: usize,
    polls_until_done: usize,
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: DEFAULT_PAGE_SIZE,
            polls_until_done: 1,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Number of `get_job` calls that report `RUNNING` before `DONE`.
    pub fn with_polls_until_done(mut self, polls: usize) -> Self {
        self.polls_until_done = polls;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_dataset(&self, dataset: &DatasetRef, location: &str) {
        self.state().datasets.insert(dataset.clone(), location.to_string());
    }

    /// Adds (or replaces) a table, creating its dataset if needed.
    pub fn insert_table(&self, table: &TableRef, columns: Vec<String>, rows: Vec<Row>) {
        let mut state = self.state();
        state.datasets
            .entry(table.dataset_ref())
            .or_insert_with(|| "US".to_string());
        state.tables.insert(table.clone(), StoredTable { columns, rows });
    }

    /// Makes the `successes`+1-th call of `op` fail with `error`.
    pub fn fail_after(&self, op: &'static str, successes: usize, error: BigQueryError) {
        self.state().failures.push(Failure {
            op,
            successes_left: successes,
            error,
        });
    }

    pub fn fail_on(&self, op: &'static str, error: BigQueryError) {
        self.fail_after(op, 0, error);
    }

    pub fn has_dataset(&self, dataset: &DatasetRef) -> bool {
        self.state().datasets.contains_key(dataset)
    }

    pub fn dataset_location(&self, dataset: &DatasetRef) -> Option<String> {
        self.state().datasets.get(dataset).cloned()
    }

    pub fn table_columns(&self, table: &TableRef) -> Option<Vec<String>> {
        self.state().tables.get(table).map(|t| t.columns.clone())
    }

    pub fn table_rows(&self, table: &TableRef) -> Option<Vec<Row>> {
        self.state().tables.get(table).map(|t| t.rows.clone())
    }

    pub fn calls(&self) -> Vec<WarehouseCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.op() == op).count()
    }

    fn record(&self, call: WarehouseCall) -> Result<()> {
        let op = call.op();
        let mut state = self.state();
        state.calls.push(call);

        if let Some(idx) = state.failures.iter().position(|f| f.op == op) {
            if state.failures[idx].successes_left == 0 {
                let failure = state.failures.remove(idx);
                return Err(failure.error.into());
            }
            state.failures[idx].successes_left -= 1;
        }
        Ok(())
    }

    fn apply_load(
        state: &mut State,
        config: &LoadJobConfig,
        contents: &str,
    ) -> std::result::Result<u64, JobError> {
        let dataset = config.destination.dataset_ref();
        if !state.datasets.contains_key(&dataset) {
            return Err(JobError {
                reason: Some("notFound".to_string()),
                message: format!("Not found: Dataset {}:{}", dataset.project, dataset.dataset),
                location: None,
            });
        }

        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(map)) => records.push(map),
                _ => {
                    return Err(JobError {
                        reason: Some("invalid".to_string()),
                        message: format!(
                            "Error while reading data, error message: JSON parsing error in row starting at line {}",
                            idx + 1
                        ),
                        location: Some(format!("line {}", idx + 1)),
                    });
                }
            }
        }

        let existing = state.tables.get(&config.destination);
        if existing.is_none() && config.create_disposition == CreateDisposition::CreateNever {
            return Err(JobError {
                reason: Some("notFound".to_string()),
                message: format!("Not found: Table {}", config.destination),
                location: None,
            });
        }
        if config.write_disposition == WriteDisposition::WriteEmpty
            && existing.map(|t| !t.rows.is_empty()).unwrap_or(false)
        {
            return Err(JobError {
                reason: Some("duplicate".to_string()),
                message: format!("Already Exists: Table {}", config.destination),
                location: None,
            });
        }

        let mut columns: Vec<String> = match (config.write_disposition, existing) {
            (WriteDisposition::WriteAppend, Some(t)) => t.columns.clone(),
            _ => Vec::new(),
        };
        for record in &records {
            for key in record.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }

        let loaded: Vec<Row> = records
            .into_iter()
            .map(|record| Row::from_cells(record.into_iter().collect()))
            .collect();
        let output_rows = loaded.len() as u64;

        let rows = match (config.write_disposition, state.tables.remove(&config.destination)) {
            (WriteDisposition::WriteAppend, Some(mut t)) => {
                t.rows.extend(loaded);
                t.rows
            }
            _ => loaded,
        };
        state.tables.insert(config.destination.clone(), StoredTable { columns, rows });

        Ok(output_rows)
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<TableRef>> {
        self.record(WarehouseCall::ListTables(dataset.clone()))?;
        let state = self.state();

        if !state.datasets.contains_key(dataset) {
            return Err(BigQueryError::DatasetNotFound { dataset: dataset.clone() }.into());
        }

        Ok(state.tables
            .keys()
            .filter(|t| t.project == dataset.project && t.dataset == dataset.dataset)
            .cloned()
            .collect())
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableDescriptor> {
        self.record(WarehouseCall::GetTable(table.clone()))?;
        let state = self.state();

        let stored = state.tables
            .get(table)
            .ok_or_else(|| BigQueryError::TableNotFound { table: table.clone() })?;

        // Stored rows already hold decoded values, so column types never matter here.
        let columns = stored.columns
            .iter()
            .map(|name| Column::new(name, FieldType::String))
            .collect();

        Ok(TableDescriptor::new(table.clone(), columns))
    }

    async fn list_rows(&self, table: &TableDescriptor, page_token: Option<String>) -> Result<RowPage> {
        self.record(WarehouseCall::ListRows {
            table: table.table.clone(),
            page_token: page_token.clone(),
        })?;
        let state = self.state();

        let stored = state.tables
            .get(&table.table)
            .ok_or_else(|| BigQueryError::TableNotFound { table: table.table.clone() })?;

        let start = match page_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                TransferError::Warehouse(format!("invalid page token '{}'", token))
            })?,
            None => 0,
        };
        let end = (start + self.page_size).min(stored.rows.len());
        let rows = stored.rows.get(start..end).map(|r| r.to_vec()).unwrap_or_default();
        let next_page_token = (end < stored.rows.len()).then(|| end.to_string());

        Ok(RowPage { rows, next_page_token })
    }

    async fn get_dataset(&self, dataset: &DatasetRef) -> Result<DatasetLookup> {
        self.record(WarehouseCall::GetDataset(dataset.clone()))?;

        if self.state().datasets.contains_key(dataset) {
            Ok(DatasetLookup::Found)
        } else {
            Ok(DatasetLookup::Absent)
        }
    }

    async fn create_dataset(&self, dataset: &DatasetRef, location: &str) -> Result<()> {
        self.record(WarehouseCall::CreateDataset {
            dataset: dataset.clone(),
            location: location.to_string(),
        })?;
        let mut state = self.state();

        if state.datasets.contains_key(dataset) {
            return Err(BigQueryError::AlreadyExists {
                resource: dataset.to_string(),
            }.into());
        }
        state.datasets.insert(dataset.clone(), location.to_string());
        Ok(())
    }

    async fn submit_load_job(&self, source: &Path, config: &LoadJobConfig) -> Result<JobHandle> {
        self.record(WarehouseCall::SubmitLoadJob(config.destination.clone()))?;
        let contents = std::fs::read_to_string(source)?;

        let mut state = self.state();
        state.next_job += 1;
        let job_id = format!("memory_load_{}", state.next_job);

        let (error, output_rows) = match Self::apply_load(&mut state, config, &contents) {
            Ok(rows) => (None, rows),
            Err(e) => (Some(e), 0),
        };
        debug!(job_id = %job_id, rows = output_rows, "memory load job applied");

        state.jobs.insert(job_id.clone(), StoredJob {
            polls_left: self.polls_until_done,
            error,
            output_rows,
        });

        Ok(JobHandle {
            project: config.destination.project.clone(),
            job_id,
            location: config.location.clone(),
        })
    }

    async fn get_job(&self, job: &JobHandle) -> Result<JobStatus> {
        self.record(WarehouseCall::GetJob(job.job_id.clone()))?;
        let mut state = self.state();

        let stored = state.jobs.get_mut(&job.job_id).ok_or_else(|| BigQueryError::Unknown {
            code: Some("notFound".to_string()),
            message: format!("Not found: Job {}:{}", job.project, job.job_id),
        })?;

        if stored.polls_left > 0 {
            stored.polls_left -= 1;
            return Ok(JobStatus {
                state: JobState::Running,
                error: None,
                output_rows: None,
            });
        }

        Ok(JobStatus {
            state: JobState::Done,
            error: stored.error.clone(),
            output_rows: stored.error.is_none().then_some(stored.output_rows),
        })
    }
}
