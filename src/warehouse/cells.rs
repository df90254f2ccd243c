//! Wire cells from `tabledata.list` turned into plain JSON values.
//!
//! BigQuery wraps every cell as `{"v": ...}`, nests record fields under
//! `{"f": [...]}` and sends scalars as strings. The exporter wants the values
//! themselves, so repeated and record cells are unwrapped recursively against
//! the schema and timestamps become UTC datetimes.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::Result;
use super::{Column, FieldType, Row};

#[derive(Debug, Deserialize)]
struct SchemaSnapshot {
    #[serde(default)]
    fields: Option<Vec<FieldSnapshot>>,
}

#[derive(Debug, Deserialize)]
struct FieldSnapshot {
    name: String,
    #[serde(rename = "type", default)]
    field_type: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    fields: Option<Vec<FieldSnapshot>>,
}

impl From<FieldSnapshot> for Column {
    fn from(field: FieldSnapshot) -> Self {
        let field_type = FieldType::parse(field.field_type.as_deref().unwrap_or("STRING"));
        let mut column = Column::new(field.name, field_type).with_fields(
            field.fields
                .unwrap_or_default()
                .into_iter()
                .map(Column::from)
                .collect(),
        );
        if field.mode.as_deref() == Some("REPEATED") {
            column = column.repeated();
        }
        column
    }
}

/// Reads the columns out of a table schema resource.
pub(crate) fn columns_from_schema<S: Serialize>(schema: &S) -> Result<Vec<Column>> {
    let snapshot: SchemaSnapshot = serde_json::from_value(serde_json::to_value(schema)?)?;
    Ok(snapshot.fields
        .unwrap_or_default()
        .into_iter()
        .map(Column::from)
        .collect())
}

/// Pairs positional cells with their columns, decoding each one.
pub(crate) fn decode_row(columns: &[Column], cells: Vec<Value>) -> Row {
    Row::from_cells(
        columns
            .iter()
            .zip(cells)
            .map(|(column, cell)| (column.name.clone(), decode_cell(cell, column)))
            .collect(),
    )
}

pub(crate) fn decode_cell(value: Value, column: &Column) -> Value {
    if !column.repeated {
        return decode_scalar(value, column);
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| decode_scalar(unwrap_v(item), column))
                .collect(),
        ),
        other => decode_scalar(other, column),
    }
}

fn unwrap_v(cell: Value) -> Value {
    match cell {
        Value::Object(mut wrapper) if wrapper.len() == 1 && wrapper.contains_key("v") => {
            wrapper.remove("v").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn decode_scalar(value: Value, column: &Column) -> Value {
    match (&column.field_type, value) {
        (_, Value::Null) => Value::Null,
        (FieldType::Record, Value::Object(mut record)) => {
            let cells = match record.remove("f") {
                Some(Value::Array(cells)) => cells,
                _ => return Value::Object(record),
            };
            let mut decoded = Map::new();
            for (field, cell) in column.fields.iter().zip(cells) {
                decoded.insert(field.name.clone(), decode_cell(unwrap_v(cell), field));
            }
            Value::Object(decoded)
        }
        (FieldType::Timestamp, Value::String(raw)) => match format_timestamp(&raw) {
            Some(text) => Value::String(text),
            None => Value::String(raw),
        },
        (FieldType::Integer, Value::String(raw)) => match raw.parse::<i64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(raw),
        },
        (FieldType::Float, Value::String(raw)) => {
            match raw.parse::<f64>().ok().and_then(Number::from_f64) {
                Some(n) => Value::Number(n),
                None => Value::String(raw),
            }
        }
        (FieldType::Boolean, Value::String(raw)) if raw == "true" || raw == "false" => {
            Value::Bool(raw == "true")
        }
        (_, other) => other,
    }
}

/// `2024-01-01 00:00:00+00:00`, with `.ffffff` only when there are microseconds.
///
/// Accepts int64 microseconds as well as the older float-seconds encoding.
fn format_timestamp(raw: &str) -> Option<String> {
    let micros = match raw.parse::<i64>() {
        Ok(micros) => micros,
        Err(_) => {
            let seconds = raw.parse::<f64>().ok().filter(|s| s.is_finite())?;
            (seconds * 1_000_000.0).round() as i64
        }
    };
    let at = DateTime::from_timestamp_micros(micros)?;

    let text = if at.timestamp_subsec_micros() == 0 {
        at.format("%Y-%m-%d %H:%M:%S+00:00")
    } else {
        at.format("%Y-%m-%d %H:%M:%S%.6f+00:00")
    };
    Some(text.to_string())
}
