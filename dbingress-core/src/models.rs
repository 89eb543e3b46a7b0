//! Core data models for ingress descriptors and schema metadata.
//!
//! Tables and relations are identified by name everywhere; registries hold
//! owned values keyed by name, and graphs, components and cycles refer to
//! them by name rather than by reference.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::IngressError;

/// Direction in which a relation is followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From a parent row to every child row referencing it (nested as an array)
    ToChild,
    /// From a child row to the single parent row it references (nested as an object)
    ToParent,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToChild => write!(f, "child"),
            Direction::ToParent => write!(f, "parent"),
        }
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Whether the column is written to exported rows
    #[serde(default = "default_export")]
    pub export: bool,
}

const fn default_export() -> bool {
    true
}

impl Column {
    /// Creates an exported column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            export: true,
        }
    }
}

/// Table metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Schema-qualified table name
    pub name: String,
    /// Primary-key columns, in key order
    #[serde(default)]
    pub keys: Vec<String>,
    /// Known columns; empty when the metadata carries none
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Table {
    /// Creates a table with no key or column metadata.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Builder method to set the primary-key columns.
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to add a column.
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Returns whether `column` should be kept in exported rows.
    ///
    /// Columns unknown to the metadata are always exported.
    pub fn exports(&self, column: &str) -> bool {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .is_none_or(|c| c.export)
    }
}

/// A named foreign-key relationship from a parent table to a child table.
///
/// `parent_keys[i]` is paired with `child_keys[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub parent: String,
    pub child: String,
    pub parent_keys: Vec<String>,
    pub child_keys: Vec<String>,
}

impl Relation {
    /// Creates a single-column relation.
    pub fn new(
        name: impl Into<String>,
        parent: impl Into<String>,
        parent_key: impl Into<String>,
        child: impl Into<String>,
        child_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parent: parent.into(),
            child: child.into(),
            parent_keys: vec![parent_key.into()],
            child_keys: vec![child_key.into()],
        }
    }

    /// Creates a relation over a composite key.
    pub fn composite<I, J, S, T>(
        name: impl Into<String>,
        parent: impl Into<String>,
        parent_keys: I,
        child: impl Into<String>,
        child_keys: J,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            parent: parent.into(),
            child: child.into(),
            parent_keys: parent_keys.into_iter().map(Into::into).collect(),
            child_keys: child_keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Direction taken when this relation is followed from `table`.
    ///
    /// A self-referencing relation is always followed towards its children.
    pub fn direction_from(&self, table: &str) -> Option<Direction> {
        if self.parent == table {
            Some(Direction::ToChild)
        } else if self.child == table {
            Some(Direction::ToParent)
        } else {
            None
        }
    }

    /// Table reached when following this relation in `direction`.
    pub fn target(&self, direction: Direction) -> &str {
        match direction {
            Direction::ToChild => &self.child,
            Direction::ToParent => &self.parent,
        }
    }

    /// Table a follow in `direction` starts from.
    pub fn source(&self, direction: Direction) -> &str {
        match direction {
            Direction::ToChild => &self.parent,
            Direction::ToParent => &self.child,
        }
    }

    /// Returns true if both endpoints are the same table.
    pub fn is_self_referencing(&self) -> bool {
        self.parent == self.child
    }

    /// Checks that both key lists are non-empty and of equal length.
    ///
    /// # Errors
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(IngressError::configuration(format!(
                "relation between '{}' and '{}' has an empty name",
                self.parent, self.child
            )));
        }

        if self.parent_keys.is_empty() || self.child_keys.is_empty() {
            return Err(IngressError::configuration(format!(
                "relation '{}' has an empty key list",
                self.name
            )));
        }

        if self.parent_keys.len() != self.child_keys.len() {
            return Err(IngressError::configuration(format!(
                "relation '{}' pairs {} parent key(s) with {} child key(s)",
                self.name,
                self.parent_keys.len(),
                self.child_keys.len()
            )));
        }

        Ok(())
    }
}

/// A relation annotated with the directions in which it is traversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRelation {
    #[serde(flatten)]
    pub relation: Relation,
    /// From a child row, fetch the parent row it references
    #[serde(default)]
    pub look_up_parent: bool,
    /// From a parent row, fetch every child row referencing it
    #[serde(default)]
    pub look_up_child: bool,
}

impl IngressRelation {
    /// Wraps a relation with both lookups disabled.
    pub fn new(relation: Relation) -> Self {
        Self {
            relation,
            look_up_parent: false,
            look_up_child: false,
        }
    }

    /// Builder method to set `look_up_parent`.
    pub fn with_look_up_parent(mut self, enabled: bool) -> Self {
        self.look_up_parent = enabled;
        self
    }

    /// Builder method to set `look_up_child`.
    pub fn with_look_up_child(mut self, enabled: bool) -> Self {
        self.look_up_child = enabled;
        self
    }

    /// Relation name
    pub fn name(&self) -> &str {
        &self.relation.name
    }

    /// Returns true if the relation is traversed in at least one direction.
    pub fn is_active(&self) -> bool {
        self.look_up_parent || self.look_up_child
    }

    /// Returns true if the relation may be followed in `direction`.
    pub fn is_active_towards(&self, direction: Direction) -> bool {
        match direction {
            Direction::ToChild => self.look_up_child,
            Direction::ToParent => self.look_up_parent,
        }
    }
}

/// Declarative start table plus flagged relation list a plan is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressDescriptor {
    pub start_table: String,
    #[serde(default)]
    pub relations: Vec<IngressRelation>,
}

impl IngressDescriptor {
    /// Creates a descriptor with no relations.
    pub fn new(start_table: impl Into<String>) -> Self {
        Self {
            start_table: start_table.into(),
            relations: Vec::new(),
        }
    }

    /// Builder method to append a relation.
    pub fn with_relation(mut self, relation: IngressRelation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Rejects duplicate relation names and malformed key lists.
    ///
    /// # Errors
    /// Returns a configuration error naming the offending relation.
    pub fn validate(&self) -> crate::Result<()> {
        if self.start_table.is_empty() {
            return Err(IngressError::configuration("start table cannot be empty"));
        }

        let mut names = BTreeSet::new();
        for relation in &self.relations {
            relation.relation.validate()?;
            if !names.insert(relation.name()) {
                return Err(IngressError::configuration(format!(
                    "duplicate relation name '{}'",
                    relation.name()
                )));
            }
        }

        Ok(())
    }

    /// Relations with at least one lookup enabled.
    pub fn active_relations(&self) -> impl Iterator<Item = &IngressRelation> {
        self.relations.iter().filter(|r| r.is_active())
    }
}

/// Schema metadata read from a live database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub tables: BTreeMap<String, Table>,
    #[serde(default)]
    pub relations: BTreeMap<String, Relation>,
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to register a table.
    pub fn with_table(mut self, table: Table) -> Self {
        self.add_table(table);
        self
    }

    /// Builder method to register a relation.
    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.add_relation(relation);
        self
    }

    /// Registers a table, replacing any previous entry of the same name.
    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Registers a relation, replacing any previous entry of the same name.
    pub fn add_relation(&mut self, relation: Relation) {
        self.relations.insert(relation.name.clone(), relation);
    }

    /// Looks up table metadata by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Looks up a relation by name.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_to_items() -> Relation {
        Relation::new("orders_items", "orders", "id", "items", "order_id")
    }

    #[test]
    fn test_relation_direction() {
        let relation = orders_to_items();
        assert_eq!(relation.direction_from("orders"), Some(Direction::ToChild));
        assert_eq!(relation.direction_from("items"), Some(Direction::ToParent));
        assert_eq!(relation.direction_from("customers"), None);

        assert_eq!(relation.target(Direction::ToChild), "items");
        assert_eq!(relation.source(Direction::ToChild), "orders");
        assert_eq!(relation.target(Direction::ToParent), "orders");
    }

    #[test]
    fn test_relation_validation() {
        assert!(orders_to_items().validate().is_ok());

        let relation = Relation::composite(
            "bad",
            "orders",
            ["id", "region"],
            "items",
            ["order_id"],
        );
        let error = relation.validate().unwrap_err();
        assert!(error.to_string().contains("2 parent key(s)"));

        let relation = Relation::composite(
            "empty",
            "orders",
            Vec::<String>::new(),
            "items",
            Vec::<String>::new(),
        );
        assert!(relation.validate().is_err());
    }

    #[test]
    fn test_ingress_relation_flags() {
        let relation = IngressRelation::new(orders_to_items());
        assert!(!relation.is_active());

        let relation = relation.with_look_up_child(true);
        assert!(relation.is_active());
        assert!(relation.is_active_towards(Direction::ToChild));
        assert!(!relation.is_active_towards(Direction::ToParent));
    }

    #[test]
    fn test_descriptor_rejects_duplicate_names() {
        let descriptor = IngressDescriptor::new("orders")
            .with_relation(IngressRelation::new(orders_to_items()))
            .with_relation(IngressRelation::new(Relation::new(
                "orders_items",
                "customers",
                "id",
                "orders",
                "customer_id",
            )));

        let error = descriptor.validate().unwrap_err();
        assert!(error.to_string().contains("duplicate relation name 'orders_items'"));
    }

    #[test]
    fn test_descriptor_serialization_flattens_relation() {
        let descriptor = IngressDescriptor::new("orders").with_relation(
            IngressRelation::new(orders_to_items()).with_look_up_child(true),
        );

        let json = serde_json::to_value(&descriptor).unwrap();
        let relation = &json["relations"][0];
        assert_eq!(relation["name"], "orders_items");
        assert_eq!(relation["parent_keys"][0], "id");
        assert_eq!(relation["look_up_child"], true);

        let parsed: IngressDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn test_table_export_flags() {
        let table = Table::new("users")
            .with_keys(["id"])
            .with_column(Column::new("id"))
            .with_column(Column {
                name: "password_hash".to_string(),
                export: false,
            });

        assert!(table.exports("id"));
        assert!(!table.exports("password_hash"));
        assert!(table.exports("unknown"));
    }
}
