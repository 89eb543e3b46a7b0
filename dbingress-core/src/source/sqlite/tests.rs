//! Unit tests for the SQLite source.
//!
//! Each test builds its schema in a private in-memory database. The pool is
//! limited to one connection so every query sees the same database.

use serde_json::json;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::SqliteSource;
use crate::Result;
use crate::models::Table;
use crate::row::Filter;
use crate::source::{DataSource, RelationReader, SourceFeature};

async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn seed(pool: &SqlitePool) {
    for statement in [
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id), total REAL)",
        "CREATE TABLE shipments (order_id INTEGER, region TEXT, label BLOB, PRIMARY KEY (order_id, region), FOREIGN KEY (order_id) REFERENCES orders)",
        "INSERT INTO customers VALUES (1, 'ada'), (2, 'bob')",
        "INSERT INTO orders VALUES (10, 1, 9.5), (11, 1, 20.0), (12, 2, NULL)",
        "INSERT INTO shipments VALUES (10, 'eu', x'0102')",
    ] {
        sqlx::query(statement).execute(pool).await.unwrap();
    }
}

// =============================================================================
// Query Tests
// =============================================================================

#[tokio::test]
async fn test_sqlite_query_with_equality_filter() -> Result<()> {
    let pool = memory_pool().await;
    seed(&pool).await;
    let source = SqliteSource::from_pool(pool);
    source.open().await?;

    let rows = source
        .query(&Table::new("orders"), &Filter::new().with_value("customer_id", 1))
        .await?;

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].scalar("id"), Some(&json!(10)));
    assert_eq!(rows[0].scalar("total"), Some(&json!(9.5)));
    assert_eq!(rows[0].columns().collect::<Vec<_>>(), vec!["id", "customer_id", "total"]);
    Ok(())
}

#[tokio::test]
async fn test_sqlite_query_limit_predicate_and_nulls() -> Result<()> {
    let pool = memory_pool().await;
    seed(&pool).await;
    let source = SqliteSource::from_pool(pool);

    let rows = source
        .query(&Table::new("orders"), &Filter::new().with_limit(1))
        .await?;
    assert_eq!(rows.len(), 1);

    let rows = source
        .query(&Table::new("orders"), &Filter::new().with_predicate("total > 10"))
        .await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].scalar("id"), Some(&json!(11)));

    let rows = source
        .query(
            &Table::new("orders"),
            &Filter::new().with_value("total", serde_json::Value::Null),
        )
        .await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].scalar("total"), Some(&serde_json::Value::Null));
    Ok(())
}

#[tokio::test]
async fn test_sqlite_blob_is_base64() -> Result<()> {
    let pool = memory_pool().await;
    seed(&pool).await;
    let source = SqliteSource::from_pool(pool);

    let rows = source
        .query(&Table::new("shipments"), &Filter::new())
        .await?;
    assert_eq!(rows[0].scalar("label"), Some(&json!("base64:AQI=")));
    Ok(())
}

#[tokio::test]
async fn test_sqlite_query_error_names_table() -> Result<()> {
    let source = SqliteSource::from_pool(memory_pool().await);
    let error = source
        .query(&Table::new("missing"), &Filter::new())
        .await
        .unwrap_err();
    assert!(error.is_fatal());
    assert!(error.to_string().contains("missing"));
    Ok(())
}

#[tokio::test]
async fn test_sqlite_borrowed_pool_survives_close() -> Result<()> {
    let pool = memory_pool().await;
    seed(&pool).await;
    let source = SqliteSource::from_pool(pool.clone());
    source.close().await?;
    assert!(!pool.is_closed());
    assert!(source.supports_feature(SourceFeature::Predicate));
    Ok(())
}

// =============================================================================
// Catalog Tests
// =============================================================================

#[tokio::test]
async fn test_sqlite_read_catalog() -> Result<()> {
    let pool = memory_pool().await;
    seed(&pool).await;
    let source = SqliteSource::from_pool(pool);

    let catalog = source.read_catalog().await?;
    assert_eq!(
        catalog.tables.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["customers", "orders", "shipments"]
    );
    assert_eq!(catalog.table("shipments").unwrap().keys, vec!["order_id", "region"]);
    assert_eq!(catalog.table("orders").unwrap().columns.len(), 3);

    let orders_fk = catalog.relation("orders_customers_fk0").unwrap();
    assert_eq!(orders_fk.parent, "customers");
    assert_eq!(orders_fk.child, "orders");
    assert_eq!(orders_fk.parent_keys, vec!["id"]);
    assert_eq!(orders_fk.child_keys, vec!["customer_id"]);

    // REFERENCES orders without columns resolves to the parent's primary key.
    let shipments_fk = catalog.relation("shipments_orders_fk0").unwrap();
    assert_eq!(shipments_fk.parent_keys, vec!["id"]);
    assert_eq!(shipments_fk.child_keys, vec!["order_id"]);
    Ok(())
}
