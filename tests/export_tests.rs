use bqtransfer::{
    BigQueryError, DatasetRef, ExportConfig, Exporter, MemoryWarehouse, Row, TableRef,
    TransferError, WarehouseCall,
};
use serde_json::{json, Value};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn marts() -> DatasetRef {
    DatasetRef::new("saras-bigquery", "dbt_training_marts")
}

fn seeded_warehouse(page_size: usize) -> MemoryWarehouse {
    let warehouse = MemoryWarehouse::new().with_page_size(page_size);
    let ds = marts();

    warehouse.insert_table(
        &ds.table("dim_customers"),
        columns(&["customer_id", "first_name", "last_name"]),
        vec![
            Row::new().with("customer_id", "1").with("first_name", "Michael").with("last_name", "P."),
            Row::new().with("customer_id", "2").with("first_name", "Shawn").with("last_name", "M."),
        ],
    );
    warehouse.insert_table(
        &ds.table("fct_orders"),
        columns(&["order_id", "customer_id", "amount", "status"]),
        (1..=7)
            .map(|i| {
                Row::new()
                    .with("status", "completed")
                    .with("amount", json!(i * 10))
                    .with("customer_id", "1")
                    .with("order_id", json!(i))
            })
            .collect(),
    );

    warehouse
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

/// Log output collected by a thread-local subscriber.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    (capture, tracing::subscriber::set_default(subscriber))
}

#[tokio::test]
async fn test_exports_one_file_per_table_with_schema_header() {
    let dir = TempDir::new().unwrap();
    let warehouse = seeded_warehouse(1000);
    let config = ExportConfig::new(marts(), dir.path().join("exports"));

    let report = Exporter::new(&warehouse, config).run().await.unwrap();

    assert_eq!(report.tables.len(), 2);
    assert_eq!(report.total_rows(), 9);

    let customers = dir.path().join("exports/dim_customers.csv");
    let orders = dir.path().join("exports/fct_orders.csv");
    assert_eq!(
        read(&customers),
        "customer_id,first_name,last_name\n1,Michael,P.\n2,Shawn,M.\n"
    );
    assert!(read(&orders).starts_with("order_id,customer_id,amount,status\n1,1,10,completed\n"));
}

#[tokio::test]
async fn test_rows_cross_page_boundaries_in_order() {
    let dir = TempDir::new().unwrap();
    let warehouse = seeded_warehouse(3);
    let config = ExportConfig::new(marts(), dir.path());

    Exporter::new(&warehouse, config).run().await.unwrap();

    let contents = read(&dir.path().join("fct_orders.csv"));
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 8);
    for (i, line) in lines[1..].iter().enumerate() {
        let n = i + 1;
        assert_eq!(*line, format!("{},1,{},completed", n, n * 10));
    }

    let fct = marts().table("fct_orders");
    let calls = warehouse.calls();
    let pages = calls
        .iter()
        .filter(|c| matches!(c, WarehouseCall::ListRows { table, .. } if *table == fct))
        .count();
    assert_eq!(pages, 3);
}

#[tokio::test]
async fn test_duplicate_rows_are_kept() {
    let dir = TempDir::new().unwrap();
    let warehouse = MemoryWarehouse::new();
    let table = marts().table("events");
    let row = Row::new().with("kind", "click");
    warehouse.insert_table(&table, columns(&["kind"]), vec![row.clone(), row.clone(), row]);

    Exporter::new(&warehouse, ExportConfig::new(marts(), dir.path()))
        .run()
        .await
        .unwrap();

    assert_eq!(read(&dir.path().join("events.csv")), "kind\nclick\nclick\nclick\n");
}

#[tokio::test]
async fn test_missing_and_null_values_are_empty_fields() {
    let dir = TempDir::new().unwrap();
    let warehouse = MemoryWarehouse::new();
    warehouse.insert_table(
        &marts().table("sparse"),
        columns(&["a", "b", "c"]),
        vec![Row::new().with("a", "x").with("c", Value::Null)],
    );

    Exporter::new(&warehouse, ExportConfig::new(marts(), dir.path()))
        .run()
        .await
        .unwrap();

    assert_eq!(read(&dir.path().join("sparse.csv")), "a,b,c\nx,,\n");
}

#[tokio::test]
async fn test_rerun_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let warehouse = seeded_warehouse(2);
    let config = ExportConfig::new(marts(), dir.path());

    Exporter::new(&warehouse, config.clone()).run().await.unwrap();
    let first = std::fs::read(dir.path().join("fct_orders.csv")).unwrap();

    Exporter::new(&warehouse, config).run().await.unwrap();
    let second = std::fs::read(dir.path().join("fct_orders.csv")).unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_existing_file_is_overwritten() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dim_customers.csv");
    std::fs::write(&path, "stale\n".repeat(100)).unwrap();

    let warehouse = seeded_warehouse(1000);
    Exporter::new(&warehouse, ExportConfig::new(marts(), dir.path()))
        .run()
        .await
        .unwrap();

    assert_eq!(read(&path).lines().count(), 3);
    assert!(!read(&path).contains("stale"));
}

#[tokio::test]
async fn test_empty_dataset_halts_before_touching_filesystem() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("exports").join("dbt_training_marts");
    let warehouse = MemoryWarehouse::new();
    warehouse.insert_dataset(&marts(), "US");

    let err = Exporter::new(&warehouse, ExportConfig::new(marts(), &output))
        .run()
        .await
        .unwrap_err();

    match err {
        TransferError::NoTables { project, dataset } => {
            assert_eq!(project, "saras-bigquery");
            assert_eq!(dataset, "dbt_training_marts");
        }
        other => panic!("Expected NoTables, got {:?}", other),
    }
    assert!(!output.exists());
    assert!(!dir.path().join("exports").exists());
    assert_eq!(warehouse.call_count("get_table"), 0);
}

#[tokio::test]
async fn test_missing_dataset_propagates() {
    let dir = TempDir::new().unwrap();
    let warehouse = MemoryWarehouse::new();

    let err = Exporter::new(&warehouse, ExportConfig::new(marts(), dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.bigquery().map(|e| e.error_code()), Some("DATASET_NOT_FOUND"));
}

#[tokio::test]
async fn test_row_fetch_failure_aborts_run_and_leaves_partial_file() {
    let dir = TempDir::new().unwrap();
    let warehouse = seeded_warehouse(2);
    // dim_customers needs one page; fct_orders fails on its second page.
    warehouse.fail_after(
        "list_rows",
        2,
        BigQueryError::ConnectionFailed { reason: "connection reset".into() },
    );

    let (logs, _guard) = capture_logs();

    let err = Exporter::new(&warehouse, ExportConfig::new(marts(), dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.bigquery().map(|e| e.error_code()), Some("CONNECTION_FAILED"));
    assert!(logs.contents().contains("aborted after 2 rows"));
    assert!(logs.contents().contains("fct_orders.csv is incomplete"));

    let partial = read(&dir.path().join("fct_orders.csv"));
    assert_eq!(partial, "order_id,customer_id,amount,status\n1,1,10,completed\n2,1,20,completed\n");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_write_failure_warns_about_incomplete_file() {
    if !Path::new("/dev/full").exists() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let warehouse = MemoryWarehouse::new();
    let table = marts().table("wide");
    let payload = "x".repeat(512);
    warehouse.insert_table(
        &table,
        columns(&["id", "payload"]),
        (0..200).map(|i| Row::new().with("id", json!(i)).with("payload", payload.as_str())).collect(),
    );
    // Every write to the output file fails with ENOSPC.
    std::os::unix::fs::symlink("/dev/full", dir.path().join("wide.csv")).unwrap();
    let (logs, _guard) = capture_logs();

    let err = Exporter::new(&warehouse, ExportConfig::new(marts(), dir.path()))
        .export_table(&table)
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Csv(_) | TransferError::Io(_)), "got {:?}", err);
    assert!(logs.contents().contains("wide.csv is incomplete"));
}

#[tokio::test]
async fn test_metadata_failure_stops_remaining_tables() {
    let dir = TempDir::new().unwrap();
    let warehouse = seeded_warehouse(1000);
    warehouse.fail_on(
        "get_table",
        BigQueryError::AccessDenied {
            resource: "saras-bigquery.dbt_training_marts.dim_customers".into(),
            required_permission: Some("bigquery.tables.get".into()),
        },
    );

    let err = Exporter::new(&warehouse, ExportConfig::new(marts(), dir.path()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.bigquery().map(|e| e.error_code()), Some("ACCESS_DENIED"));
    assert!(!dir.path().join("dim_customers.csv").exists());
    assert!(!dir.path().join("fct_orders.csv").exists());
    assert_eq!(warehouse.call_count("get_table"), 1);
}

#[tokio::test]
async fn test_export_single_table_directly() {
    let dir = TempDir::new().unwrap();
    let warehouse = seeded_warehouse(1000);
    let exporter = Exporter::new(&warehouse, ExportConfig::new(marts(), dir.path().join("nested/out")));

    let exported = exporter
        .export_table(&TableRef::new("saras-bigquery", "dbt_training_marts", "dim_customers"))
        .await
        .unwrap();

    assert_eq!(exported.rows, 2);
    assert_eq!(exported.path, dir.path().join("nested/out/dim_customers.csv"));
    assert!(exported.path.exists());
}
