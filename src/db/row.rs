//! Conversion of driver rows into JSON maps for callers.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

/// One result row: column name → value, in select-list order.
pub type Row = Map<String, Value>;

pub fn decode_row(row: &PgRow) -> Row {
    let mut out = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_value(row, idx));
    }
    out
}

fn decode_value(row: &PgRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Err(_) => return Value::Null,
        _ => {}
    }

    let type_name = row.columns()[idx].type_info().name().to_string();
    match type_name.as_str() {
        "BOOL" => get::<bool>(row, idx).map(Value::Bool),
        "INT2" => get::<i16>(row, idx).map(Value::from),
        "INT4" => get::<i32>(row, idx).map(Value::from),
        "INT8" => get::<i64>(row, idx).map(Value::from),
        "FLOAT4" => get::<f32>(row, idx).map(|f| float(f as f64)),
        "FLOAT8" => get::<f64>(row, idx).map(float),
        // Kept as text so precision survives the trip through JSON.
        "NUMERIC" => get::<Decimal>(row, idx).map(|d| Value::String(d.to_string())),
        "UUID" => get::<uuid::Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        "DATE" => get::<NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        "TIME" => get::<NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, idx).map(|t| Value::String(t.to_string())),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, idx).map(|t| Value::String(t.to_rfc3339())),
        "JSON" | "JSONB" => get::<Value>(row, idx),
        _ => get::<String>(row, idx).map(Value::String),
    }
    .unwrap_or_else(|| Value::String(format!("<{}>", type_name)))
}

fn get<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get::<T, _>(idx).ok()
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
