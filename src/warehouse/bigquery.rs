use std::path::Path;

use async_trait::async_trait;
use gcp_bigquery_client::Client;
use gcp_bigquery_client::error::{BQError, ResponseError};
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::table_data_list_response::TableDataListResponse;
use gcp_bigquery_client::table::ListOptions;
use gcp_bigquery_client::tabledata::ListQueryParameters;
use gcp_bigquery_client::yup_oauth2::authenticator::ApplicationDefaultCredentialsTypes;
use gcp_bigquery_client::yup_oauth2::{
    ApplicationDefaultCredentialsAuthenticator, ApplicationDefaultCredentialsFlowOpts,
};
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::error::{
    parse_bq_error, parse_response_error, BigQueryError, ErrorContext, Result, TransferError,
};
use super::cells::{columns_from_schema, decode_row};
use super::upload::{job_metadata, parse_inserted_job, MultipartFraming, UploadProtocol};
use super::{
    Column, DatasetLookup, DatasetRef, JobError, JobHandle, JobState, JobStatus, LoadJobConfig,
    RowPage, TableDescriptor, TableRef, Warehouse,
};

const UPLOAD_ENDPOINT: &str = "https://bigquery.googleapis.com/upload/bigquery/v2/projects";
const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

/// Subset of the `Job` resource read while polling.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobSnapshot {
    #[serde(default)]
    status: Option<JobStatusSnapshot>,
    #[serde(default)]
    statistics: Option<JobStatisticsSnapshot>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusSnapshot {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error_result: Option<ErrorProtoSnapshot>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorProtoSnapshot {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JobStatisticsSnapshot {
    #[serde(default)]
    load: Option<LoadStatisticsSnapshot>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatisticsSnapshot {
    #[serde(default)]
    output_rows: Option<String>,
}

impl JobSnapshot {
    fn into_status(self) -> Result<JobStatus> {
        let status = self.status.unwrap_or_default();
        let state_str = status.state.unwrap_or_else(|| "PENDING".to_string());
        let state = JobState::parse(&state_str).ok_or_else(|| {
            TransferError::Warehouse(format!("unexpected job state '{}'", state_str))
        })?;

        let error = status.error_result.map(|e| JobError {
            reason: e.reason,
            message: e.message.unwrap_or_else(|| "load job failed".to_string()),
            location: e.location,
        });

        let output_rows = self.statistics
            .and_then(|s| s.load)
            .and_then(|l| l.output_rows)
            .and_then(|r| r.parse::<u64>().ok());

        Ok(JobStatus { state, error, output_rows })
    }
}

/// BigQuery over application default credentials.
#[derive(Clone)]
pub struct BqClient {
    client: Client,
    http: reqwest::Client,
}

impl BqClient {
    pub async fn new() -> Result<Self> {
        let client = Client::from_application_default_credentials()
            .await
            .map_err(|e| {
                let ctx = ErrorContext::new().with_operation("client_init");
                TransferError::BigQuery(parse_bq_error(e, ctx))
            })?;

        Ok(Self {
            client,
            http: reqwest::Client::new(),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let opts = ApplicationDefaultCredentialsFlowOpts::default();
        let authenticator = match ApplicationDefaultCredentialsAuthenticator::builder(opts).await {
            ApplicationDefaultCredentialsTypes::InstanceMetadata(builder) => builder.build().await,
            ApplicationDefaultCredentialsTypes::ServiceAccount(builder) => builder.build().await,
        }
        .map_err(|e| BigQueryError::AuthenticationFailed { reason: e.to_string() })?;

        let token = authenticator
            .token(&[BIGQUERY_SCOPE])
            .await
            .map_err(|e| BigQueryError::AuthenticationFailed { reason: e.to_string() })?;

        token
            .token()
            .map(|t| t.to_string())
            .ok_or_else(|| BigQueryError::AuthenticationFailed {
                reason: "no access token available".to_string(),
            }.into())
    }

    fn page_from_response(columns: &[Column], response: TableDataListResponse) -> RowPage {
        let rows = response.rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                let cells = row.columns
                    .unwrap_or_default()
                    .into_iter()
                    .map(|cell| cell.value.unwrap_or(Value::Null))
                    .collect();
                decode_row(columns, cells)
            })
            .collect();

        RowPage {
            rows,
            next_page_token: response.page_token.filter(|t| !t.is_empty()),
        }
    }

    /// Opens a resumable upload session and returns its URI.
    async fn start_resumable_upload(
        &self,
        token: &str,
        metadata: Vec<u8>,
        file_len: u64,
        config: &LoadJobConfig,
    ) -> Result<String> {
        let url = format!(
            "{}/{}/jobs?uploadType={}",
            UPLOAD_ENDPOINT,
            config.destination.project,
            UploadProtocol::Resumable.upload_type()
        );

        let response = self.http
            .post(&url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .header("X-Upload-Content-Type", "application/octet-stream")
            .header("X-Upload-Content-Length", file_len)
            .body(metadata)
            .send()
            .await
            .map_err(|e| BigQueryError::ConnectionFailed { reason: e.to_string() })?;

        let session = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self::reply_body(response, config).await?;

        session.ok_or_else(|| TransferError::Upload("resumable upload session has no Location".to_string()))
    }

    /// The reply body, or the classified error when the status is not 2xx.
    async fn reply_body(response: reqwest::Response, config: &LoadJobConfig) -> Result<Bytes> {
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BigQueryError::ConnectionFailed { reason: e.to_string() })?;

        if status.is_success() {
            return Ok(bytes);
        }

        let ctx = ErrorContext::new()
            .with_operation("submit_load_job")
            .with_table(&config.destination);
        Err(match serde_json::from_slice::<ResponseError>(&bytes) {
            Ok(resp) => TransferError::BigQuery(parse_response_error(&resp, ctx)),
            Err(_) => TransferError::Upload(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&bytes)
            )),
        })
    }
}

#[async_trait]
impl Warehouse for BqClient {
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<TableRef>> {
        let mut tables = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut options = ListOptions::default();
            if let Some(token) = page_token.take() {
                options = options.page_token(token);
            }

            let page = self.client
                .table()
                .list(&dataset.project, &dataset.dataset, options)
                .await
                .map_err(|e| {
                    let ctx = ErrorContext::new()
                        .with_operation("list_tables")
                        .with_dataset(dataset);
                    TransferError::BigQuery(parse_bq_error(e, ctx))
                })?;

            tables.extend(
                page.tables
                    .unwrap_or_default()
                    .into_iter()
                    .map(|t| dataset.table(t.table_reference.table_id)),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(tables)
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableDescriptor> {
        let remote = self.client
            .table()
            .get(&table.project, &table.dataset, &table.table, None)
            .await
            .map_err(|e| {
                let ctx = ErrorContext::new()
                    .with_operation("get_table")
                    .with_table(table);
                TransferError::BigQuery(parse_bq_error(e, ctx))
            })?;

        let columns = columns_from_schema(&remote.schema)?;

        Ok(TableDescriptor::new(table.clone(), columns))
    }

    async fn list_rows(&self, table: &TableDescriptor, page_token: Option<String>) -> Result<RowPage> {
        let t = &table.table;
        let params = ListQueryParameters {
            start_index: None,
            max_results: None,
            page_token,
            selected_fields: None,
            // Timestamps as int64 microseconds instead of float seconds.
            format_options: Some(serde_json::from_value(json!({ "useInt64Timestamp": true }))?),
        };

        let response = self.client
            .tabledata()
            .list(&t.project, &t.dataset, &t.table, params)
            .await
            .map_err(|e| {
                let ctx = ErrorContext::new()
                    .with_operation("list_rows")
                    .with_table(t);
                TransferError::BigQuery(parse_bq_error(e, ctx))
            })?;

        let page = Self::page_from_response(&table.columns, response);
        debug!(table = %t, rows = page.rows.len(), "fetched row page");

        Ok(page)
    }

    async fn get_dataset(&self, dataset: &DatasetRef) -> Result<DatasetLookup> {
        match self.client.dataset().get(&dataset.project, &dataset.dataset).await {
            Ok(_) => Ok(DatasetLookup::Found),
            Err(BQError::ResponseError { error }) if error.error.code == 404 => Ok(DatasetLookup::Absent),
            Err(e) => {
                let ctx = ErrorContext::new()
                    .with_operation("get_dataset")
                    .with_dataset(dataset);
                Err(TransferError::BigQuery(parse_bq_error(e, ctx)))
            }
        }
    }

    async fn create_dataset(&self, dataset: &DatasetRef, location: &str) -> Result<()> {
        let mut ds = Dataset::new(&dataset.project, &dataset.dataset);
        ds.location = Some(location.to_string());

        self.client
            .dataset()
            .create(ds)
            .await
            .map_err(|e| {
                let ctx = ErrorContext::new()
                    .with_operation("create_dataset")
                    .with_dataset(dataset);
                TransferError::BigQuery(parse_bq_error(e, ctx))
            })?;

        Ok(())
    }

    async fn submit_load_job(&self, source: &Path, config: &LoadJobConfig) -> Result<JobHandle> {
        let file = tokio::fs::File::open(source).await?;
        let file_len = file.metadata().await?.len();
        let job_id = format!("bqtransfer_load_{}", Uuid::new_v4().simple());
        let metadata = job_metadata(&job_id, config)?;
        let token = self.access_token().await?;

        let protocol = UploadProtocol::for_size(file_len);
        debug!(job_id = %job_id, bytes = file_len, protocol = protocol.upload_type(), "uploading load job");

        let request = match protocol {
            UploadProtocol::Multipart => {
                let framing = MultipartFraming::new(&metadata);
                let url = format!(
                    "{}/{}/jobs?uploadType={}",
                    UPLOAD_ENDPOINT,
                    config.destination.project,
                    protocol.upload_type()
                );
                self.http
                    .post(&url)
                    .bearer_auth(&token)
                    .header(CONTENT_TYPE, framing.content_type())
                    .header(CONTENT_LENGTH, framing.content_length(file_len))
                    .body(reqwest::Body::wrap_stream(framing.wrap(file)))
            }
            UploadProtocol::Resumable => {
                let session = self.start_resumable_upload(&token, metadata, file_len, config).await?;
                self.http
                    .put(&session)
                    .bearer_auth(&token)
                    .header(CONTENT_LENGTH, file_len)
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| BigQueryError::ConnectionFailed { reason: e.to_string() })?;
        let bytes = Self::reply_body(response, config).await?;

        parse_inserted_job(&bytes)
    }

    async fn get_job(&self, job: &JobHandle) -> Result<JobStatus> {
        let remote = self.client
            .job()
            .get_job(&job.project, &job.job_id, job.location.as_deref())
            .await
            .map_err(|e| {
                let ctx = ErrorContext::new().with_operation("get_job");
                TransferError::BigQuery(parse_bq_error(e, ctx))
            })?;

        let snapshot: JobSnapshot = serde_json::from_value(serde_json::to_value(&remote)?)?;
        snapshot.into_status()
    }
}
