mod csv_writer;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tabled::Tabled;
use tracing::{debug, info, warn};

use crate::config::ExportConfig;
use crate::error::{Result, TransferError};
use crate::warehouse::{DatasetRef, RowStream, TableRef, Warehouse};

pub use csv_writer::{format_value, TableCsvWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedTable {
    pub table: TableRef,
    pub path: PathBuf,
    pub rows: u64,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub dataset: DatasetRef,
    pub tables: Vec<ExportedTable>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExportReport {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }

    pub fn summary_rows(&self) -> Vec<ExportSummaryRow> {
        self.tables.iter().map(ExportSummaryRow::from).collect()
    }
}

#[derive(Debug, Clone, Tabled)]
pub struct ExportSummaryRow {
    #[tabled(rename = "Table")]
    pub table: String,
    #[tabled(rename = "Rows")]
    pub rows: u64,
    #[tabled(rename = "File")]
    pub file: String,
}

impl From<&ExportedTable> for ExportSummaryRow {
    fn from(exported: &ExportedTable) -> Self {
        Self {
            table: exported.table.table.clone(),
            rows: exported.rows,
            file: exported.path.display().to_string(),
        }
    }
}

/// Writes every table of one dataset to `<output_dir>/<table>.csv`.
pub struct Exporter<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    config: ExportConfig,
}

impl<'a, W: Warehouse + ?Sized> Exporter<'a, W> {
    pub fn new(warehouse: &'a W, config: ExportConfig) -> Self {
        Self { warehouse, config }
    }

    /// Tables of the configured dataset. An empty dataset is an error.
    pub async fn list_tables(&self) -> Result<Vec<TableRef>> {
        let dataset = &self.config.dataset;
        let tables = self.warehouse.list_tables(dataset).await?;

        if tables.is_empty() {
            return Err(TransferError::NoTables {
                project: dataset.project.clone(),
                dataset: dataset.dataset.clone(),
            });
        }

        Ok(tables)
    }

    pub async fn export_table(&self, table: &TableRef) -> Result<ExportedTable> {
        let descriptor = self.warehouse.get_table(table).await?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.file_for(&table.table);
        let mut writer = TableCsvWriter::create(&path, &descriptor.column_names())?;
        debug!(table = %table, columns = descriptor.columns.len(), "writing {}", path.display());

        let mut rows = RowStream::new(self.warehouse, &descriptor);
        if let Err(e) = copy_rows(&mut rows, &mut writer).await {
            // The file is left in place, holding only the rows written so far.
            warn!(
                "Export of {} aborted after {} rows; {} is incomplete",
                table,
                writer.rows_written(),
                writer.path().display()
            );
            return Err(e);
        }

        let (path, rows_written) = writer.finish()?;
        debug!(table = %table, pages = rows.pages_fetched(), rows = rows_written, "table exported");

        Ok(ExportedTable {
            table: table.clone(),
            path,
            rows: rows_written,
        })
    }

    pub async fn run(&self) -> Result<ExportReport> {
        let started_at = Utc::now();
        let dataset = &self.config.dataset;

        let tables = self.list_tables().await?;
        info!("Found {} tables in {}.", tables.len(), dataset);

        let mut exported = Vec::with_capacity(tables.len());
        for table in &tables {
            let result = self.export_table(table).await?;
            info!("Exported {} -> {}", table.table, result.path.display());
            exported.push(result);
        }

        Ok(ExportReport {
            dataset: dataset.clone(),
            tables: exported,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Drains `rows` into `writer` and flushes it.
async fn copy_rows<W: Warehouse + ?Sized>(
    rows: &mut RowStream<'_, W>,
    writer: &mut TableCsvWriter,
) -> Result<()> {
    while let Some(row) = rows.next().await? {
        writer.write_row(&row)?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{MemoryWarehouse, Row};
    use tempfile::TempDir;

    #[test]
    fn test_summary_rows() {
        let report = ExportReport {
            dataset: DatasetRef::new("p", "d"),
            tables: vec![
                ExportedTable {
                    table: TableRef::new("p", "d", "a"),
                    path: PathBuf::from("out/a.csv"),
                    rows: 3,
                },
                ExportedTable {
                    table: TableRef::new("p", "d", "b"),
                    path: PathBuf::from("out/b.csv"),
                    rows: 4,
                },
            ],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };

        assert_eq!(report.total_rows(), 7);
        let rows = report.summary_rows();
        assert_eq!(rows[0].table, "a");
        assert_eq!(rows[1].file, "out/b.csv");
    }

    #[test]
    fn test_export_table_returns_path_and_count() {
        let dir = TempDir::new().unwrap();
        let warehouse = MemoryWarehouse::new();
        let table = TableRef::new("p", "d", "orders");
        warehouse.insert_table(
            &table,
            vec!["id".into(), "total".into()],
            vec![Row::new().with("id", "1").with("total", "9.5")],
        );

        let config = ExportConfig::new(DatasetRef::new("p", "d"), dir.path().join("out"));
        let exporter = Exporter::new(&warehouse, config);
        let exported = tokio_test::block_on(exporter.export_table(&table)).unwrap();

        assert_eq!(exported.path, dir.path().join("out").join("orders.csv"));
        assert_eq!(exported.rows, 1);
        assert_eq!(
            std::fs::read_to_string(&exported.path).unwrap(),
            "id,total\n1,9.5\n"
        );
    }
}
