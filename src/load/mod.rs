use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::LoadConfig;
use crate::error::{parse_job_error, BigQueryError, ErrorContext, Result, TransferError};
use crate::warehouse::{
    DatasetLookup, JobHandle, JobStatus, LoadJobConfig, TableRef, Warehouse,
};

const INITIAL_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetStatus {
    Existing,
    Created,
}

#[derive(Debug, Clone)]
pub struct LoadStats {
    pub destination: TableRef,
    pub job_id: String,
    pub output_rows: u64,
    pub polls: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl LoadStats {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub source: PathBuf,
    pub dataset: DatasetStatus,
    pub stats: LoadStats,
}

/// Replaces the contents of one table with a newline-delimited JSON file.
pub struct Loader<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    config: LoadConfig,
    initial_poll: Duration,
    max_poll: Duration,
}

impl<'a, W: Warehouse + ?Sized> Loader<'a, W> {
    pub fn new(warehouse: &'a W, config: LoadConfig) -> Self {
        Self {
            warehouse,
            config,
            initial_poll: INITIAL_POLL_INTERVAL,
            max_poll: MAX_POLL_INTERVAL,
        }
    }

    /// Poll delay starts at `initial` and doubles up to `max`.
    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_poll = initial;
        self.max_poll = max.max(initial);
        self
    }

    /// Absolute path of the source file, or `SourceNotFound`. Touches no remote state.
    pub fn check_source(&self) -> Result<PathBuf> {
        self.config.resolve_source()
    }

    pub async fn ensure_dataset(&self) -> Result<DatasetStatus> {
        let dataset = self.config.dataset();

        match self.warehouse.get_dataset(&dataset).await? {
            DatasetLookup::Found => {
                info!("Dataset {} already exists.", dataset.dataset);
                Ok(DatasetStatus::Existing)
            }
            DatasetLookup::Absent => {
                info!("Creating dataset {} in project {}...", dataset.dataset, dataset.project);
                match self.warehouse.create_dataset(&dataset, &self.config.location).await {
                    Ok(()) => {}
                    Err(TransferError::BigQuery(BigQueryError::AlreadyExists { .. })) => {
                        debug!("dataset {} appeared concurrently", dataset);
                    }
                    Err(e) => return Err(e),
                }
                info!("Dataset created.");
                Ok(DatasetStatus::Created)
            }
        }
    }

    pub async fn load_file(&self, source: &Path) -> Result<LoadStats> {
        let started_at = Utc::now();
        let destination = &self.config.destination;
        let job_config = LoadJobConfig::ndjson_truncate(destination.clone())
            .with_location(&self.config.location);

        info!("Loading {} into {} ...", source.display(), destination);
        let handle = self.warehouse.submit_load_job(source, &job_config).await?;
        debug!(job_id = %handle.job_id, "load job submitted");

        let (status, polls) = self.wait_for_job(&handle).await?;

        if let Some(error) = status.error {
            let ctx = ErrorContext::new()
                .with_operation("load_job")
                .with_table(destination);
            return Err(TransferError::LoadJobFailed {
                job_id: handle.job_id,
                source: parse_job_error(
                    error.reason.as_deref(),
                    &error.message,
                    error.location.as_deref(),
                    ctx,
                ),
            });
        }

        let output_rows = status.output_rows.unwrap_or_default();
        info!("Loaded {} rows into {}.", output_rows, destination);

        Ok(LoadStats {
            destination: destination.clone(),
            job_id: handle.job_id,
            output_rows,
            polls,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn wait_for_job(&self, handle: &JobHandle) -> Result<(JobStatus, usize)> {
        let mut delay = self.initial_poll;
        let mut polls = 0;

        loop {
            let status = self.warehouse.get_job(handle).await?;
            polls += 1;

            if status.is_done() {
                return Ok((status, polls));
            }

            debug!(job_id = %handle.job_id, state = ?status.state, "waiting {:?}", delay);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.max_poll);
        }
    }

    pub async fn run(&self) -> Result<LoadReport> {
        let source = self.check_source()?;
        info!("Source file: {}", source.display());
        let dataset = self.ensure_dataset().await?;
        let stats = self.load_file(&source).await?;

        Ok(LoadReport { source, dataset, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::MemoryWarehouse;

    #[test]
    fn test_check_source_missing() {
        let warehouse = MemoryWarehouse::new();
        let config = LoadConfig::default().with_source("definitely/not/here.jsonl");
        let loader = Loader::new(&warehouse, config);

        match loader.check_source() {
            Err(TransferError::SourceNotFound(path)) => {
                assert!(path.is_absolute());
                assert!(path.ends_with("definitely/not/here.jsonl"));
            }
            other => panic!("Expected SourceNotFound, got {:?}", other),
        }
        assert!(warehouse.calls().is_empty());
    }

    #[test]
    fn test_check_source_existing_is_absolute() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let warehouse = MemoryWarehouse::new();
        let loader = Loader::new(&warehouse, LoadConfig::default().with_source(file.path()));

        let path = loader.check_source().unwrap();
        assert!(path.is_absolute());
        assert_eq!(path, file.path());
    }

    #[test]
    fn test_poll_interval_max_not_below_initial() {
        let warehouse = MemoryWarehouse::new();
        let loader = Loader::new(&warehouse, LoadConfig::default())
            .with_poll_interval(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(loader.max_poll, Duration::from_secs(5));
    }

    #[test]
    fn test_stats_elapsed() {
        let started_at = Utc::now();
        let stats = LoadStats {
            destination: TableRef::new("p", "d", "t"),
            job_id: "j".into(),
            output_rows: 0,
            polls: 1,
            started_at,
            finished_at: started_at + chrono::Duration::seconds(3),
        };
        assert_eq!(stats.elapsed().num_seconds(), 3);
    }
}
