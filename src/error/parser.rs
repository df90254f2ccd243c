use std::sync::OnceLock;

use gcp_bigquery_client::error::{BQError, ResponseError};
use regex::Regex;

use super::bq_error::BigQueryError;
use crate::warehouse::{DatasetRef, TableRef};

/// What was being attempted when a call failed.
#[derive(Debug, Default, Clone)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub dataset: Option<DatasetRef>,
    pub table: Option<TableRef>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, op: impl Into<String>) -> Self {
        self.operation = Some(op.into());
        self
    }

    pub fn with_dataset(mut self, dataset: &DatasetRef) -> Self {
        self.dataset = Some(dataset.clone());
        self
    }

    pub fn with_table(mut self, table: &TableRef) -> Self {
        self.dataset = Some(table.dataset_ref());
        self.table = Some(table.clone());
        self
    }

    /// `project.dataset[.table]` of the target, or the operation name.
    pub fn resource(&self) -> String {
        match (&self.table, &self.dataset, &self.operation) {
            (Some(t), _, _) => t.to_string(),
            (None, Some(d), _) => d.to_string(),
            (None, None, Some(op)) => op.clone(),
            (None, None, None) => "resource".to_string(),
        }
    }
}

pub fn parse_bq_error(error: BQError, context: ErrorContext) -> BigQueryError {
    match error {
        BQError::ResponseError { error } => parse_response_error(&error, context),

        BQError::RequestError(e) => BigQueryError::ConnectionFailed { reason: e.to_string() },
        BQError::ConnectionPoolError(reason) => BigQueryError::ConnectionFailed { reason },

        BQError::NoToken => BigQueryError::AuthenticationFailed {
            reason: "no access token available".to_string(),
        },
        BQError::AuthError(e) => BigQueryError::AuthenticationFailed { reason: format!("{:?}", e) },
        BQError::YupAuthError(e) => BigQueryError::AuthenticationFailed { reason: e.to_string() },
        BQError::InvalidServiceAccountKey(e) => {
            BigQueryError::AuthenticationFailed { reason: e.to_string() }
        }
        BQError::InvalidServiceAccountAuthenticator(e) => {
            BigQueryError::AuthenticationFailed { reason: e.to_string() }
        }
        BQError::InvalidApplicationDefaultCredentialsAuthenticator(e) => {
            BigQueryError::AuthenticationFailed { reason: e.to_string() }
        }

        other => BigQueryError::Unknown {
            code: context.operation,
            message: other.to_string(),
        },
    }
}

/// Classifies an HTTP error body returned by the BigQuery REST API.
pub fn parse_response_error(resp: &ResponseError, context: ErrorContext) -> BigQueryError {
    let status = resp.error.code;
    let message = resp.error.message.clone();
    let first = resp.error.errors.first();
    let reason = first.and_then(|e| e.get("reason")).map(String::as_str);

    match status {
        401 => BigQueryError::AuthenticationFailed { reason: message },
        404 => not_found(&message, &context),
        409 => BigQueryError::AlreadyExists { resource: context.resource() },
        500..=599 => BigQueryError::Server { status, message },
        _ => {
            let location = first.and_then(|e| e.get("location")).cloned();
            classify_reason(reason, message, location, &context)
        }
    }
}

/// Classifies the terminal `errorResult` of a finished job.
pub fn parse_job_error(
    reason: Option<&str>,
    message: &str,
    location: Option<&str>,
    context: ErrorContext,
) -> BigQueryError {
    match reason {
        Some("notFound") => not_found(message, &context),
        _ => classify_reason(reason, message.to_string(), location.map(str::to_string), &context),
    }
}

fn classify_reason(
    reason: Option<&str>,
    message: String,
    location: Option<String>,
    context: &ErrorContext,
) -> BigQueryError {
    match reason {
        Some("invalid") | Some("invalidQuery") => BigQueryError::InvalidLoadData { message, location },
        Some("accessDenied") => BigQueryError::AccessDenied {
            resource: context.resource(),
            required_permission: required_permission(&message),
        },
        Some("quotaExceeded") | Some("rateLimitExceeded") => BigQueryError::QuotaExceeded {
            quota: quota_kind(&message).to_string(),
            message,
        },
        Some("duplicate") => BigQueryError::AlreadyExists { resource: context.resource() },
        other => BigQueryError::Unknown {
            code: other.map(str::to_string),
            message,
        },
    }
}

fn not_found(message: &str, context: &ErrorContext) -> BigQueryError {
    static TABLE: OnceLock<Option<Regex>> = OnceLock::new();
    static DATASET: OnceLock<Option<Regex>> = OnceLock::new();

    // "Not found: Table project:dataset.table"
    let table_re = TABLE.get_or_init(|| Regex::new(r"(?i)table\s+([^:\s]+):([^.\s]+)\.(\S+)").ok());
    if let Some(caps) = table_re.as_ref().and_then(|re| re.captures(message)) {
        return BigQueryError::TableNotFound {
            table: TableRef::new(&caps[1], &caps[2], &caps[3]),
        };
    }

    // "Not found: Dataset project:dataset"
    let dataset_re = DATASET.get_or_init(|| Regex::new(r"(?i)dataset\s+([^:\s]+):(\S+)").ok());
    if let Some(caps) = dataset_re.as_ref().and_then(|re| re.captures(message)) {
        return BigQueryError::DatasetNotFound {
            dataset: DatasetRef::new(&caps[1], &caps[2]),
        };
    }

    match (&context.table, &context.dataset) {
        (Some(table), _) => BigQueryError::TableNotFound { table: table.clone() },
        (None, Some(dataset)) => BigQueryError::DatasetNotFound { dataset: dataset.clone() },
        (None, None) => BigQueryError::Unknown {
            code: Some("notFound".to_string()),
            message: message.to_string(),
        },
    }
}

fn required_permission(message: &str) -> Option<String> {
    static PERMISSION: OnceLock<Option<Regex>> = OnceLock::new();

    PERMISSION
        .get_or_init(|| Regex::new(r"(bigquery\.[a-zA-Z.]+[a-zA-Z])").ok())
        .as_ref()?
        .find(message)
        .map(|m| m.as_str().to_string())
}

fn quota_kind(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("load job") || lower.contains("imports") {
        "load jobs"
    } else if lower.contains("rate") {
        "rate limit"
    } else if lower.contains("daily") {
        "daily limit"
    } else {
        "API"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn response(code: i64, reason: &str, message: &str) -> ResponseError {
        let body = serde_json::json!({
            "error": {
                "code": code,
                "message": message,
                "status": "",
                "errors": [{ "reason": reason, "message": message, "domain": "global" }]
            }
        });
        serde_json::from_value(body).unwrap()
    }

    fn raw_shopify() -> DatasetRef {
        DatasetRef::new("saras-bigquery", "raw_shopify")
    }

    #[test]
    fn test_required_permission() {
        assert_eq!(
            required_permission("User does not have bigquery.tables.getData permission").as_deref(),
            Some("bigquery.tables.getData")
        );
        assert_eq!(
            required_permission("Permission bigquery.datasets.create denied on project saras-bigquery.")
                .as_deref(),
            Some("bigquery.datasets.create")
        );
        assert!(required_permission("Access denied").is_none());
    }

    #[test]
    fn test_quota_kind() {
        assert_eq!(quota_kind("Your table exceeded quota for imports or query appends per table"), "load jobs");
        assert_eq!(quota_kind("Rate limit exceeded"), "rate limit");
        assert_eq!(quota_kind("Something else"), "API");
    }

    #[test]
    fn test_context_resource() {
        let table = raw_shopify().table("orders");
        assert_eq!(ErrorContext::new().with_table(&table).resource(), "saras-bigquery.raw_shopify.orders");
        assert_eq!(ErrorContext::new().with_dataset(&raw_shopify()).resource(), "saras-bigquery.raw_shopify");
        assert_eq!(ErrorContext::new().with_operation("get_job").resource(), "get_job");

        let ctx = ErrorContext::new().with_table(&table);
        assert_eq!(ctx.dataset, Some(raw_shopify()));
    }

    #[test]
    fn test_not_found_from_message() {
        let err = not_found("Not found: Table my-project:my_dataset.my_table", &ErrorContext::new());
        match err {
            BigQueryError::TableNotFound { table } => {
                assert_eq!(table, TableRef::new("my-project", "my_dataset", "my_table"));
            }
            other => panic!("Expected TableNotFound, got {:?}", other),
        }

        let err = not_found("Not found: Dataset saras-bigquery:raw_shopify", &ErrorContext::new());
        match err {
            BigQueryError::DatasetNotFound { dataset } => assert_eq!(dataset, raw_shopify()),
            other => panic!("Expected DatasetNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_not_found_falls_back_to_context() {
        let ctx = ErrorContext::new().with_dataset(&raw_shopify());
        match not_found("Not found", &ctx) {
            BigQueryError::DatasetNotFound { dataset } => assert_eq!(dataset, raw_shopify()),
            other => panic!("Expected DatasetNotFound, got {:?}", other),
        }

        match not_found("Resource unavailable", &ErrorContext::new()) {
            BigQueryError::Unknown { code, .. } => assert_eq!(code.as_deref(), Some("notFound")),
            other => panic!("Expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_response_status_classes() {
        let ctx = || ErrorContext::new().with_dataset(&raw_shopify());

        let err = parse_response_error(&response(409, "duplicate", "Already Exists: Dataset saras-bigquery:raw_shopify"), ctx());
        match err {
            BigQueryError::AlreadyExists { resource } => assert_eq!(resource, "saras-bigquery.raw_shopify"),
            other => panic!("Expected AlreadyExists, got {:?}", other),
        }

        let err = parse_response_error(
            &response(403, "accessDenied", "Access Denied: requires bigquery.datasets.get"),
            ctx(),
        );
        match err {
            BigQueryError::AccessDenied { resource, required_permission } => {
                assert_eq!(resource, "saras-bigquery.raw_shopify");
                assert_eq!(required_permission.as_deref(), Some("bigquery.datasets.get"));
            }
            other => panic!("Expected AccessDenied, got {:?}", other),
        }

        let err = parse_response_error(&response(503, "backendError", "Backend Error"), ctx());
        assert_eq!(err.error_code(), "SERVER_ERROR");

        let err = parse_response_error(&response(401, "unauthorized", "Invalid Credentials"), ctx());
        assert_eq!(err.error_code(), "AUTH_FAILED");
    }

    #[test]
    fn test_response_invalid_upload_keeps_location() {
        let mut resp = response(400, "invalid", "Invalid value for sourceFormat");
        let mut detail = HashMap::new();
        detail.insert("reason".to_string(), "invalid".to_string());
        detail.insert("location".to_string(), "configuration.load.sourceFormat".to_string());
        resp.error.errors = vec![detail];

        match parse_response_error(&resp, ErrorContext::new()) {
            BigQueryError::InvalidLoadData { location, .. } => {
                assert_eq!(location.as_deref(), Some("configuration.load.sourceFormat"));
            }
            other => panic!("Expected InvalidLoadData, got {:?}", other),
        }
    }

    #[test]
    fn test_job_error_reasons() {
        let table = raw_shopify().table("orders");
        let ctx = || ErrorContext::new().with_operation("load_job").with_table(&table);

        let err = parse_job_error(
            Some("invalid"),
            "Error while reading data, error message: JSON table encountered too many errors",
            Some("line 3"),
            ctx(),
        );
        assert_eq!(err.error_code(), "INVALID_LOAD_DATA");

        let err = parse_job_error(Some("notFound"), "Not found", None, ctx());
        assert_eq!(err.error_code(), "TABLE_NOT_FOUND");

        match parse_job_error(Some("backendError"), "boom", None, ctx()) {
            BigQueryError::Unknown { code, message } => {
                assert_eq!(code.as_deref(), Some("backendError"));
                assert_eq!(message, "boom");
            }
            other => panic!("Expected Unknown, got {:?}", other),
        }
    }
}
