use thiserror::Error;

use crate::warehouse::{DatasetRef, TableRef};

/// A BigQuery failure, classified so the binaries can print a code and a hint.
#[derive(Debug, Clone, Error)]
pub enum BigQueryError {
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Table not found: {table}")]
    TableNotFound { table: TableRef },

    #[error("Dataset not found: {dataset}")]
    DatasetNotFound { dataset: DatasetRef },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Access denied to {resource}{}", permission_note(.required_permission))]
    AccessDenied {
        resource: String,
        required_permission: Option<String>,
    },

    #[error("Quota exceeded ({quota}): {message}")]
    QuotaExceeded { quota: String, message: String },

    #[error("Invalid load data: {message}{}", location_note(.location))]
    InvalidLoadData {
        message: String,
        location: Option<String>,
    },

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("BigQuery server error (HTTP {status}): {message}")]
    Server { status: i64, message: String },

    #[error("BigQuery error{}: {message}", code_note(.code))]
    Unknown {
        code: Option<String>,
        message: String,
    },
}

fn permission_note(permission: &Option<String>) -> String {
    permission
        .as_ref()
        .map(|p| format!(" (requires {p})"))
        .unwrap_or_default()
}

fn location_note(location: &Option<String>) -> String {
    location.as_ref().map(|l| format!(" ({l})")).unwrap_or_default()
}

fn code_note(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

impl BigQueryError {
    pub fn error_code(&self) -> &'static str {
        match self {
            BigQueryError::AuthenticationFailed { .. } => "AUTH_FAILED",
            BigQueryError::TableNotFound { .. } => "TABLE_NOT_FOUND",
            BigQueryError::DatasetNotFound { .. } => "DATASET_NOT_FOUND",
            BigQueryError::AlreadyExists { .. } => "ALREADY_EXISTS",
            BigQueryError::AccessDenied { .. } => "ACCESS_DENIED",
            BigQueryError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            BigQueryError::InvalidLoadData { .. } => "INVALID_LOAD_DATA",
            BigQueryError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            BigQueryError::Server { .. } => "SERVER_ERROR",
            BigQueryError::Unknown { .. } => "UNKNOWN",
        }
    }

    /// What the operator can do about it, one hint per line.
    pub fn suggestion(&self) -> String {
        let hints: Vec<String> = match self {
            BigQueryError::AuthenticationFailed { .. } => vec![
                "Run: gcloud auth application-default login".into(),
                "Or point GOOGLE_APPLICATION_CREDENTIALS at a service account key".into(),
            ],
            BigQueryError::TableNotFound { table } => vec![
                format!("Run: bq show {}:{}.{}", table.project, table.dataset, table.table),
                "The table may have been dropped after the dataset was listed".into(),
            ],
            BigQueryError::DatasetNotFound { dataset } => vec![
                format!("Run: bq ls {}:{}", dataset.project, dataset.dataset),
                "Check the --project and --dataset values".into(),
            ],
            BigQueryError::AlreadyExists { resource } => vec![
                format!("{resource} was created by another process"),
                "Re-run the command; the existing resource is reused".into(),
            ],
            BigQueryError::AccessDenied { required_permission, .. } => vec![
                format!(
                    "Missing permission: {}",
                    required_permission.as_deref().unwrap_or("unknown")
                ),
                "Exporting needs roles/bigquery.dataViewer".into(),
                "Loading needs roles/bigquery.dataEditor and roles/bigquery.jobUser".into(),
            ],
            BigQueryError::QuotaExceeded { .. } => vec![
                "Wait and re-run; both commands overwrite their targets".into(),
                "Check quotas under IAM & Admin > Quotas in the Cloud Console".into(),
            ],
            BigQueryError::InvalidLoadData { location, .. } => {
                let mut hints = vec![
                    "Every line must hold exactly one JSON object".into(),
                    "A field must keep the same type on every line for schema auto-detection".into(),
                ];
                if let Some(loc) = location {
                    hints.insert(0, format!("Inspect the source near {loc}"));
                }
                hints
            }
            BigQueryError::ConnectionFailed { .. } => vec![
                "Check network access to bigquery.googleapis.com".into(),
                "Verify the BigQuery API is enabled for the project".into(),
            ],
            BigQueryError::Server { .. } => vec![
                "BigQuery reported an internal error; re-run in a few moments".into(),
                "Status page: https://status.cloud.google.com/".into(),
            ],
            BigQueryError::Unknown { .. } => vec![
                "Re-run with --verbose for request details".into(),
            ],
        };

        hints
            .iter()
            .map(|h| format!("• {h}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
