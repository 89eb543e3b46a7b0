//! Entry points tying descriptors, plans and pullers together.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::config::PullerConfig;
use crate::error::{IngressError, Result};
use crate::graph::Graph;
use crate::models::{IngressDescriptor, IngressRelation};
use crate::parallel::ParallelPuller;
use crate::plan::Plan;
use crate::puller::{self, PullStats};
use crate::row::Filter;
use crate::source::{DataSource, DescriptorStorage, RelationReader, RowExporter};

/// Derives and stores the default descriptor for `start_table`.
///
/// Every relation connected to the start table, directly or through other
/// tables, is listed. Relations whose parent is the start table or one of its
/// descendants are flagged `look_up_child`; all other flags stay off for the
/// user to enable.
///
/// # Errors
/// Returns [`IngressError::StartTableNotFound`] if the catalog does not know
/// `start_table`, or the reader's and storage's errors.
pub async fn create(
    start_table: &str,
    reader: &dyn RelationReader,
    storage: &dyn DescriptorStorage,
) -> Result<IngressDescriptor> {
    let catalog = reader.read_catalog().await?;

    let mut graph = Graph::new();
    for table in catalog.tables.keys() {
        graph.add_table(table.clone());
    }
    for relation in catalog.relations.values() {
        graph.add_relation(IngressRelation::new(relation.clone()));
    }
    if !graph.contains_table(start_table) {
        return Err(IngressError::StartTableNotFound {
            table: start_table.to_string(),
        });
    }

    let connected = graph.connected_subgraph(start_table);
    let mut downstream: BTreeSet<String> = connected.descendants(start_table);
    downstream.insert(start_table.to_string());

    let mut descriptor = IngressDescriptor::new(start_table);
    for relation in connected.relations() {
        let look_up_child = downstream.contains(&relation.relation.parent);
        descriptor
            .relations
            .push(relation.clone().with_look_up_child(look_up_child));
    }

    storage.store_descriptor(&descriptor).await?;
    info!(
        "Created descriptor for '{}': {} relation(s), {} flagged for child lookup",
        start_table,
        descriptor.relations.len(),
        descriptor.active_relations().count()
    );
    Ok(descriptor)
}

/// Reads the stored descriptor and builds its plan.
///
/// # Errors
/// Returns the storage's error, or the planning error of [`Plan::build`].
pub async fn get_puller_plan(storage: &dyn DescriptorStorage) -> Result<Plan> {
    let descriptor = storage.read_descriptor().await?;
    Plan::build(&descriptor)
}

/// Like [`get_puller_plan`], then resolves the plan against live metadata.
///
/// # Errors
/// Returns the storage's or reader's error, or a planning error.
pub async fn get_resolved_plan(storage: &dyn DescriptorStorage, reader: &dyn RelationReader) -> Result<Plan> {
    let mut plan = get_puller_plan(storage).await?;
    let catalog = reader.read_catalog().await?;
    plan.resolve(&catalog);
    Ok(plan)
}

/// Pulls `plan` sequentially. See [`puller::pull`].
///
/// # Errors
/// Returns the first fatal error.
pub async fn pull(
    plan: &Plan,
    filter: &Filter,
    source: &dyn DataSource,
    exporter: &mut dyn RowExporter,
) -> Result<PullStats> {
    puller::pull(plan, filter, source, exporter).await
}

/// Creates a parallel puller with `workers` workers and default settings
/// otherwise.
///
/// # Errors
/// Returns a configuration error if `workers` is out of range.
pub fn new_puller_parallel(
    plan: Arc<Plan>,
    source: Arc<dyn DataSource>,
    exporter: Box<dyn RowExporter>,
    workers: usize,
) -> Result<ParallelPuller> {
    ParallelPuller::new(
        plan,
        source,
        exporter,
        PullerConfig::default().with_workers(workers),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Catalog, Relation, Table};
    use crate::source::MemorySource;
    use crate::storage::MemoryStorage;

    fn catalog() -> Catalog {
        Catalog::new()
            .with_table(Table::new("customers").with_keys(["id"]))
            .with_table(Table::new("orders").with_keys(["id"]))
            .with_table(Table::new("items").with_keys(["id"]))
            .with_table(Table::new("audit").with_keys(["id"]))
            .with_relation(Relation::new("orders_customers", "customers", "id", "orders", "customer_id"))
            .with_relation(Relation::new("items_orders", "orders", "id", "items", "order_id"))
    }

    #[tokio::test]
    async fn test_create_flags_downstream_relations() -> Result<()> {
        let reader = MemorySource::new().with_catalog(catalog());
        let storage = MemoryStorage::new();

        let descriptor = create("orders", &reader, &storage).await?;
        assert_eq!(descriptor.start_table, "orders");
        assert_eq!(descriptor.relations.len(), 2);

        let flags: Vec<(&str, bool, bool)> = descriptor
            .relations
            .iter()
            .map(|r| (r.name(), r.look_up_parent, r.look_up_child))
            .collect();
        assert_eq!(
            flags,
            vec![("items_orders", false, true), ("orders_customers", false, false)]
        );

        assert_eq!(storage.read_descriptor().await?, descriptor);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_unknown_start_table() {
        let reader = MemorySource::new().with_catalog(catalog());
        let error = create("nothing", &reader, &MemoryStorage::new())
            .await
            .unwrap_err();
        assert!(matches!(error, IngressError::StartTableNotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_isolated_table() -> Result<()> {
        let reader = MemorySource::new().with_catalog(catalog());
        let descriptor = create("audit", &reader, &MemoryStorage::new()).await?;
        assert!(descriptor.relations.is_empty());

        let plan = Plan::build(&descriptor)?;
        assert_eq!(plan.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolved_plan_records_gaps() -> Result<()> {
        let storage = MemoryStorage::with_descriptor(
            IngressDescriptor::new("orders").with_relation(
                IngressRelation::new(Relation::new("orders_notes", "orders", "id", "notes", "order_id"))
                    .with_look_up_child(true),
            ),
        );
        let reader = MemorySource::new().with_catalog(catalog());

        let plan = get_resolved_plan(&storage, &reader).await?;
        assert!(plan.is_missing_table("notes"));
        assert!(plan.is_missing_relation("orders_notes"));
        assert_eq!(plan.table("orders").keys, vec!["id"]);
        Ok(())
    }

    #[test]
    fn test_new_puller_parallel_validates_workers() {
        let plan = Arc::new(Plan::build(&IngressDescriptor::new("orders")).unwrap());
        let result = new_puller_parallel(
            plan,
            Arc::new(MemorySource::new()),
            Box::new(crate::export::MemoryExporter::new()),
            65,
        );
        assert!(result.is_err());
    }
}
