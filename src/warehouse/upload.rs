use std::io;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::error::Result;
use super::{JobHandle, LoadJobConfig};

const UPLOAD_BOUNDARY: &str = "bqtransfer_load_job_boundary";

/// Largest file sent as a single multipart request.
pub(crate) const MULTIPART_LIMIT: u64 = 5 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceResource {
    project_id: String,
    job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TableReferenceResource<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
    table_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadResource<'a> {
    destination_table: TableReferenceResource<'a>,
    source_format: &'static str,
    autodetect: bool,
    write_disposition: &'static str,
    create_disposition: &'static str,
}

#[derive(Debug, Serialize)]
struct JobConfigurationResource<'a> {
    load: LoadResource<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobResource<'a> {
    job_reference: JobReferenceResource,
    configuration: JobConfigurationResource<'a>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertedJob {
    job_reference: JobReferenceResource,
}

/// How the file bytes reach the upload endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadProtocol {
    /// Metadata and file in one `multipart/related` request.
    Multipart,
    /// Metadata opens a session, then the file goes up in a single PUT.
    Resumable,
}

impl UploadProtocol {
    pub(crate) fn for_size(file_len: u64) -> Self {
        if file_len <= MULTIPART_LIMIT {
            UploadProtocol::Multipart
        } else {
            UploadProtocol::Resumable
        }
    }

    pub(crate) fn upload_type(self) -> &'static str {
        match self {
            UploadProtocol::Multipart => "multipart",
            UploadProtocol::Resumable => "resumable",
        }
    }
}

/// The `jobs.insert` resource describing a load into `config.destination`.
pub(crate) fn job_metadata(job_id: &str, config: &LoadJobConfig) -> Result<Vec<u8>> {
    let dest = &config.destination;
    let job = JobResource {
        job_reference: JobReferenceResource {
            project_id: dest.project.clone(),
            job_id: job_id.to_string(),
            location: config.location.clone(),
        },
        configuration: JobConfigurationResource {
            load: LoadResource {
                destination_table: TableReferenceResource {
                    project_id: &dest.project,
                    dataset_id: &dest.dataset,
                    table_id: &dest.table,
                },
                source_format: config.source_format.as_str(),
                autodetect: config.autodetect,
                write_disposition: config.write_disposition.as_str(),
                create_disposition: config.create_disposition.as_str(),
            },
        },
    };
    Ok(serde_json::to_vec(&job)?)
}

/// The bytes a `multipart/related` body puts before and after the file.
#[derive(Debug, Clone)]
pub(crate) struct MultipartFraming {
    head: Bytes,
    tail: Bytes,
}

impl MultipartFraming {
    pub(crate) fn new(metadata: &[u8]) -> Self {
        let mut head = Vec::with_capacity(metadata.len() + 160);
        head.extend_from_slice(format!("--{}\r\n", UPLOAD_BOUNDARY).as_bytes());
        head.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        head.extend_from_slice(metadata);
        head.extend_from_slice(format!("\r\n--{}\r\n", UPLOAD_BOUNDARY).as_bytes());
        head.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");

        Self {
            head: Bytes::from(head),
            tail: Bytes::from(format!("\r\n--{}--\r\n", UPLOAD_BOUNDARY)),
        }
    }

    pub(crate) fn content_type(&self) -> String {
        format!("multipart/related; boundary={}", UPLOAD_BOUNDARY)
    }

    pub(crate) fn content_length(&self, file_len: u64) -> u64 {
        self.head.len() as u64 + file_len + self.tail.len() as u64
    }

    /// Streams head, file and tail without holding the file in memory.
    pub(crate) fn wrap(self, file: File) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::iter([Ok::<_, io::Error>(self.head)])
            .chain(ReaderStream::new(file))
            .chain(stream::iter([Ok(self.tail)]))
    }
}

/// Reads the job reference out of a `jobs.insert` response.
pub(crate) fn parse_inserted_job(body: &[u8]) -> Result<JobHandle> {
    let job: InsertedJob = serde_json::from_slice(body)?;
    Ok(JobHandle {
        project: job.job_reference.project_id,
        job_id: job.job_reference.job_id,
        location: job.job_reference.location,
    })
}
