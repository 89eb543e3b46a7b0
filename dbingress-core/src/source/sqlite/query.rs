//! SELECT generation and row decoding for SQLite.

use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, SqlitePool};
use tracing::debug;

use crate::Result;
use crate::error::IngressError;
use crate::models::Table;
use crate::row::{Filter, Row};

/// Quotes an identifier with SQLite double-quote quoting.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds the SELECT statement reading `table` under `filter`.
///
/// Equality values become `?` placeholders, in filter order; null values
/// become `IS NULL` and bind nothing. The predicate is appended verbatim.
pub fn build_select(table: &Table, filter: &Filter) -> String {
    let mut sql = format!(
        "SELECT {}* FROM {}",
        if filter.distinct { "DISTINCT " } else { "" },
        quote_identifier(&table.name)
    );

    let mut conditions: Vec<String> = filter
        .values
        .iter()
        .map(|(column, value)| {
            if value.is_null() {
                format!("{} IS NULL", quote_identifier(column))
            } else {
                format!("{} = ?", quote_identifier(column))
            }
        })
        .collect();
    if let Some(predicate) = filter.predicate.as_deref().filter(|p| !p.trim().is_empty()) {
        conditions.push(format!("({})", predicate));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    sql
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &serde_json::Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(n.to_string())
            }
        }
        serde_json::Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Reads the rows of `table` matching `filter`.
pub(crate) async fn fetch_rows(pool: &SqlitePool, table: &Table, filter: &Filter) -> Result<Vec<Row>> {
    let sql = build_select(table, filter);
    debug!("SQLite query: {}", sql);

    let mut query = sqlx::query(&sql);
    for (_, value) in filter.values.iter().filter(|(_, v)| !v.is_null()) {
        query = bind_value(query, value);
    }

    let rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| IngressError::query_failed(&table.name, e))?;

    Ok(rows.iter().map(decode_row).collect())
}

/// Converts a SQLite row into a flat [`Row`], keeping column order.
pub(crate) fn decode_row(row: &SqliteRow) -> Row {
    let mut decoded = Row::new();
    for column in row.columns() {
        let name = column.name();
        decoded = decoded.with(name, extract_column_value(row, name));
    }
    decoded
}

/// Extracts a column value as JSON.
///
/// SQLite is dynamically typed, so each plausible type is tried in turn;
/// BLOBs become `base64:`-prefixed strings.
fn extract_column_value(row: &SqliteRow, column_name: &str) -> serde_json::Value {
    use serde_json::Value as JsonValue;

    if let Ok(v) = row.try_get::<Option<String>, _>(column_name) {
        return v.map_or(JsonValue::Null, JsonValue::String);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(column_name) {
        return v.map_or(JsonValue::Null, |n| JsonValue::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(column_name) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map_or(JsonValue::Null, JsonValue::Number);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(column_name) {
        return v.map_or(JsonValue::Null, JsonValue::Bool);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(column_name) {
        return v.map_or(JsonValue::Null, |bytes| {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            JsonValue::String(format!("base64:{}", encoded))
        });
    }

    JsonValue::Null
}
