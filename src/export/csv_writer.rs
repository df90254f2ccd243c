use std::borrow::Cow;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use csv::Writer;
use serde_json::Value;

use crate::error::Result;
use crate::warehouse::Row;

/// Text written for one cell. Null and missing values become an empty field.
pub fn format_value(value: Option<&Value>) -> Cow<'_, str> {
    match value {
        None | Some(Value::Null) => Cow::Borrowed(""),
        Some(Value::String(s)) => Cow::Borrowed(s.as_str()),
        Some(Value::Bool(b)) => Cow::Owned(b.to_string()),
        Some(Value::Number(n)) => Cow::Owned(n.to_string()),
        Some(other) => Cow::Owned(other.to_string()),
    }
}

/// CSV file for one table. Truncates any existing file on creation.
pub struct TableCsvWriter {
    writer: Writer<BufWriter<File>>,
    path: PathBuf,
    columns: Vec<String>,
    rows_written: u64,
}

impl TableCsvWriter {
    pub fn create(path: impl AsRef<Path>, columns: &[String]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut writer = Writer::from_writer(BufWriter::new(file));
        writer.write_record(columns)?;

        Ok(Self {
            writer,
            path,
            columns: columns.to_vec(),
            rows_written: 0,
        })
    }

    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        let record: Vec<Cow<'_, str>> = self.columns
            .iter()
            .map(|name| format_value(row.get(name)))
            .collect();
        self.writer.write_record(record.iter().map(|c| c.as_bytes()))?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(PathBuf, u64)> {
        self.flush()?;
        Ok((self.path, self.rows_written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_format_scalars() {
        assert_eq!(format_value(None), "");
        assert_eq!(format_value(Some(&Value::Null)), "");
        assert_eq!(format_value(Some(&json!("abc"))), "abc");
        assert_eq!(format_value(Some(&json!(42))), "42");
        assert_eq!(format_value(Some(&json!(1.5))), "1.5");
        assert_eq!(format_value(Some(&json!(true))), "true");
    }

    #[test]
    fn test_format_nested_as_json() {
        assert_eq!(format_value(Some(&json!(["a", 1]))), r#"["a",1]"#);
        assert_eq!(format_value(Some(&json!({"k": "v"}))), r#"{"k":"v"}"#);
    }

    #[test]
    fn test_writes_header_and_rows_in_column_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.csv");
        let columns = vec!["id".to_string(), "name".to_string(), "note".to_string()];

        let mut writer = TableCsvWriter::create(&path, &columns).unwrap();
        writer.write_row(&Row::new().with("name", "Ann").with("id", "1")).unwrap();
        writer.write_row(&Row::new().with("id", "2").with("note", "has, comma")).unwrap();
        let (written, rows) = writer.finish().unwrap();

        assert_eq!(written, path);
        assert_eq!(rows, 2);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "id,name,note\n1,Ann,\n2,,\"has, comma\"\n");
    }

    #[test]
    fn test_create_truncates_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "old,header\nstale,data\nmore,stale\n").unwrap();

        let writer = TableCsvWriter::create(&path, &["a".to_string()]).unwrap();
        writer.finish().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\n");
    }
}
