mod bq_error;
mod parser;

use std::path::PathBuf;
use thiserror::Error;

pub use bq_error::BigQueryError;
pub use parser::{parse_bq_error, parse_job_error, parse_response_error, ErrorContext};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("BigQuery error: {0}")]
    BigQuery(#[from] BigQueryError),

    #[error("No tables found in {project}.{dataset}")]
    NoTables { project: String, dataset: String },

    #[error("File not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Load job {job_id} failed: {source}")]
    LoadJobFailed {
        job_id: String,
        #[source]
        source: BigQueryError,
    },

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransferError {
    /// The classified BigQuery failure behind this error, if any.
    pub fn bigquery(&self) -> Option<&BigQueryError> {
        match self {
            TransferError::BigQuery(e) => Some(e),
            TransferError::LoadJobFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
