//! Ingress descriptor storage.
//!
//! Descriptors are persisted as pretty-printed JSON so they can be reviewed
//! and hand-edited between `create` and `pull`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::Result;
use crate::error::IngressError;
use crate::models::IngressDescriptor;
use crate::source::DescriptorStorage;

/// Descriptor stored in a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    /// Creates a storage reading and writing `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the descriptor file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DescriptorStorage for JsonFileStorage {
    async fn read_descriptor(&self) -> Result<IngressDescriptor> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| IngressError::Io {
                context: format!("Failed to read descriptor from {}", self.path.display()),
                source: e,
            })?;

        let descriptor: IngressDescriptor =
            serde_json::from_str(&content).map_err(|e| IngressError::Serialization {
                context: format!("Invalid descriptor in {}", self.path.display()),
                source: e,
            })?;

        debug!(
            "Read descriptor for '{}' with {} relation(s) from {}",
            descriptor.start_table,
            descriptor.relations.len(),
            self.path.display()
        );
        Ok(descriptor)
    }

    async fn store_descriptor(&self, descriptor: &IngressDescriptor) -> Result<()> {
        let json = serde_json::to_string_pretty(descriptor).map_err(|e| IngressError::Serialization {
            context: "Failed to serialize descriptor".to_string(),
            source: e,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IngressError::Io {
                    context: format!("Failed to create directory {}", parent.display()),
                    source: e,
                })?;
        }

        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| IngressError::Io {
                context: format!("Failed to write descriptor to {}", self.path.display()),
                source: e,
            })
    }
}

/// Descriptor held in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    descriptor: RwLock<Option<IngressDescriptor>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a storage already holding `descriptor`.
    pub fn with_descriptor(descriptor: IngressDescriptor) -> Self {
        Self {
            descriptor: RwLock::new(Some(descriptor)),
        }
    }
}

#[async_trait]
impl DescriptorStorage for MemoryStorage {
    async fn read_descriptor(&self) -> Result<IngressDescriptor> {
        self.descriptor
            .read()
            .await
            .clone()
            .ok_or_else(|| IngressError::configuration("no ingress descriptor stored"))
    }

    async fn store_descriptor(&self, descriptor: &IngressDescriptor) -> Result<()> {
        *self.descriptor.write().await = Some(descriptor.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IngressRelation, Relation};
    use tempfile::TempDir;

    fn descriptor() -> IngressDescriptor {
        IngressDescriptor::new("orders").with_relation(
            IngressRelation::new(Relation::new("orders_items", "orders", "id", "items", "order_id"))
                .with_look_up_child(true),
        )
    }

    #[tokio::test]
    async fn test_json_file_round_trip() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let storage = JsonFileStorage::new(temp_dir.path().join("nested/descriptor.json"));

        storage.store_descriptor(&descriptor()).await?;
        let read = storage.read_descriptor().await?;
        assert_eq!(read, descriptor());

        let raw = std::fs::read_to_string(storage.path()).unwrap();
        assert!(raw.contains("\"look_up_child\": true"));
        Ok(())
    }

    #[tokio::test]
    async fn test_json_file_missing_and_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("descriptor.json");
        let storage = JsonFileStorage::new(&path);

        assert!(matches!(
            storage.read_descriptor().await,
            Err(IngressError::Io { .. })
        ));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            storage.read_descriptor().await,
            Err(IngressError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_storage() -> Result<()> {
        let storage = MemoryStorage::new();
        assert!(storage.read_descriptor().await.is_err());

        storage.store_descriptor(&descriptor()).await?;
        assert_eq!(storage.read_descriptor().await?, descriptor());
        Ok(())
    }
}
