//! Schema metadata collection for SQLite.
//!
//! Uses:
//! - `sqlite_master`: table enumeration
//! - `PRAGMA table_info()`: columns and primary-key positions
//! - `PRAGMA foreign_key_list()`: foreign keys, one row per key column

use std::collections::BTreeMap;

use sqlx::{Row as _, SqlitePool};
use tracing::debug;

use crate::Result;
use crate::error::IngressError;
use crate::models::{Catalog, Column, Relation, Table};

/// Reads every user table and foreign key of the database.
///
/// Foreign keys are named `<child>_<parent>_fk<id>`, `id` being SQLite's
/// per-table foreign-key number.
pub(crate) async fn read_catalog(pool: &SqlitePool) -> Result<Catalog> {
    let table_rows = sqlx::query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| IngressError::data_source("Failed to enumerate tables", e))?;

    let mut catalog = Catalog::new();
    let mut names = Vec::with_capacity(table_rows.len());
    for row in &table_rows {
        let name: String = row
            .try_get("name")
            .map_err(|e| IngressError::data_source("Failed to parse table name", e))?;
        let table = read_table(pool, &name).await?;
        catalog.add_table(table);
        names.push(name);
    }

    // Foreign keys may omit the referenced columns, meaning the parent's
    // primary key, so every table must be known first.
    for name in &names {
        for relation in read_foreign_keys(pool, name, &catalog).await? {
            catalog.add_relation(relation);
        }
    }

    debug!(
        "Read SQLite catalog: {} table(s), {} relation(s)",
        catalog.tables.len(),
        catalog.relations.len()
    );
    Ok(catalog)
}

async fn read_table(pool: &SqlitePool, table_name: &str) -> Result<Table> {
    let query = format!("PRAGMA table_info('{}')", table_name.replace('\'', "''"));
    let rows = sqlx::query(&query).fetch_all(pool).await.map_err(|e| {
        IngressError::data_source(format!("Failed to collect columns for table '{}'", table_name), e)
    })?;

    let mut table = Table::new(table_name);
    let mut keys: Vec<(i64, String)> = Vec::new();
    for row in rows {
        let name: String = row.try_get("name").unwrap_or_default();
        let pk: i64 = row.try_get("pk").unwrap_or(0);
        if pk > 0 {
            keys.push((pk, name.clone()));
        }
        table.columns.push(Column::new(name));
    }
    keys.sort();
    table.keys = keys.into_iter().map(|(_, name)| name).collect();

    Ok(table)
}

async fn read_foreign_keys(pool: &SqlitePool, table_name: &str, catalog: &Catalog) -> Result<Vec<Relation>> {
    let query = format!(
        "PRAGMA foreign_key_list('{}')",
        table_name.replace('\'', "''")
    );
    let rows = sqlx::query(&query).fetch_all(pool).await.map_err(|e| {
        IngressError::data_source(
            format!("Failed to collect foreign keys for table '{}'", table_name),
            e,
        )
    })?;

    // Composite foreign keys share an id; seq orders their columns.
    let mut grouped: BTreeMap<i64, (String, Vec<(i64, String, Option<String>)>)> = BTreeMap::new();
    for row in rows {
        let id: i64 = row.try_get("id").unwrap_or(0);
        let seq: i64 = row.try_get("seq").unwrap_or(0);
        let parent: String = row.try_get("table").unwrap_or_default();
        let from: String = row.try_get("from").unwrap_or_default();
        let to: Option<String> = row.try_get("to").unwrap_or(None);

        grouped
            .entry(id)
            .or_insert_with(|| (parent, Vec::new()))
            .1
            .push((seq, from, to));
    }

    let mut relations = Vec::with_capacity(grouped.len());
    for (id, (parent, mut columns)) in grouped {
        columns.sort_by_key(|(seq, _, _)| *seq);

        let child_keys: Vec<String> = columns.iter().map(|(_, from, _)| from.clone()).collect();
        let parent_keys: Vec<String> = if columns.iter().all(|(_, _, to)| to.is_some()) {
            columns.into_iter().filter_map(|(_, _, to)| to).collect()
        } else {
            catalog
                .table(&parent)
                .map(|t| t.keys.clone())
                .unwrap_or_default()
        };

        let relation = Relation::composite(
            format!("{}_{}_fk{}", table_name, parent, id),
            parent,
            parent_keys,
            table_name,
            child_keys,
        );
        if let Err(error) = relation.validate() {
            debug!("Skipping foreign key of '{}': {}", table_name, error);
            continue;
        }
        relations.push(relation);
    }

    Ok(relations)
}
