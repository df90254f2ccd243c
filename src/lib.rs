pub mod error;
pub mod config;
pub mod warehouse;
pub mod export;
pub mod load;

pub use error::{TransferError, BigQueryError, Result};
pub use config::{ExportConfig, LoadConfig};
pub use warehouse::{
    Warehouse, BqClient, MemoryWarehouse, WarehouseCall, DatasetRef, TableRef, TableDescriptor,
    Column, FieldType,
    Row, RowPage, RowStream, DatasetLookup, LoadJobConfig, JobHandle, JobState, JobStatus,
};
pub use export::{Exporter, ExportReport, ExportedTable, ExportSummaryRow};
pub use load::{Loader, LoadReport, LoadStats, DatasetStatus};
