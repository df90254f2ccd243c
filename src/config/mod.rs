use std::path::{Path, PathBuf};

use crate::error::{Result, TransferError};
use crate::warehouse::{DatasetRef, TableRef};

pub const PROJECT_ID: &str = "saras-bigquery";

pub const EXPORT_DATASET_ID: &str = "dbt_training_marts";
pub const EXPORT_ROOT: &str = "exports";

pub const LOAD_DATASET_ID: &str = "raw_shopify";
pub const LOAD_TABLE_ID: &str = "orders";
pub const LOAD_LOCATION: &str = "US";
pub const LOAD_FILE_PATH: &str = "RAW_DATASETS/bquxjob_12dd921d_19c2829b22b_yourgpt.jsonl";

/// Where the exporter reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportConfig {
    pub dataset: DatasetRef,
    pub output_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetRef::new(PROJECT_ID, EXPORT_DATASET_ID),
            output_dir: Path::new(EXPORT_ROOT).join(EXPORT_DATASET_ID),
        }
    }
}

impl ExportConfig {
    pub fn new(dataset: DatasetRef, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            dataset,
            output_dir: output_dir.into(),
        }
    }

    /// Switching dataset also moves the default output directory unless one is set later.
    pub fn with_dataset(mut self, project: impl Into<String>, dataset: impl Into<String>) -> Self {
        self.dataset = DatasetRef::new(project, dataset);
        self.output_dir = Path::new(EXPORT_ROOT).join(&self.dataset.dataset);
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn file_for(&self, table: &str) -> PathBuf {
        self.output_dir.join(format!("{}.csv", table))
    }
}

/// Source file and destination of a load run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadConfig {
    pub source: PathBuf,
    pub destination: TableRef,
    pub location: String,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from(LOAD_FILE_PATH),
            destination: TableRef::new(PROJECT_ID, LOAD_DATASET_ID, LOAD_TABLE_ID),
            location: LOAD_LOCATION.to_string(),
        }
    }
}

impl LoadConfig {
    pub fn new(source: impl Into<PathBuf>, destination: TableRef) -> Self {
        Self {
            source: source.into(),
            destination,
            location: LOAD_LOCATION.to_string(),
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_destination(
        mut self,
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        self.destination = TableRef::new(project, dataset, table);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn dataset(&self) -> DatasetRef {
        self.destination.dataset_ref()
    }

    /// Absolute path of the source file; `SourceNotFound` if it does not exist.
    pub fn resolve_source(&self) -> Result<PathBuf> {
        let path = std::path::absolute(&self.source)?;
        if !path.exists() {
            return Err(TransferError::SourceNotFound(path));
        }
        Ok(path)
    }
}
