// Shard registry: in-memory view of the catalog's `shards` collection.
// Lookup misses trigger a reload, so a freshly added shard becomes visible
// without an explicit refresh cycle.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::catalog::client::CatalogClient;
use crate::catalog::types::ShardEntry;
use crate::common::ShardId;
use crate::error::{Result, ShardError};

pub struct ShardRegistry {
    catalog: Arc<dyn CatalogClient>,
    shards: RwLock<HashMap<ShardId, ShardEntry>>,
}

impl ShardRegistry {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            catalog,
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the cached view with the catalog's current shard set.
    pub async fn reload(&self) -> Result<()> {
        let entries = self.catalog.get_shards().await?;
        debug!(count = entries.len(), "reloaded shard registry");
        let mut shards = self.shards.write();
        shards.clear();
        for entry in entries {
            shards.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    /// Look up a shard, reloading once on a miss before giving up.
    pub async fn get(&self, id: &ShardId) -> Result<ShardEntry> {
        if let Some(entry) = self.shards.read().get(id) {
            return Ok(entry.clone());
        }
        self.reload().await?;
        self.shards
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(id.to_string()))
    }

    /// Whether the shard exists without forcing a reload.
    pub fn contains(&self, id: &ShardId) -> bool {
        self.shards.read().contains_key(id)
    }

    pub fn all(&self) -> Vec<ShardEntry> {
        self.shards.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::config_catalog::ConfigCatalog;

    #[tokio::test]
    async fn test_lookup_reloads_on_miss() {
        let catalog = Arc::new(ConfigCatalog::new());
        let registry = ShardRegistry::new(catalog.clone());

        assert!(registry.get(&ShardId::from("s1")).await.is_err());

        catalog.add_shard(ShardEntry::new("s1", "host1:27018")).unwrap();
        let entry = registry.get(&ShardId::from("s1")).await.unwrap();
        assert_eq!(entry.host, "host1:27018");
        assert!(registry.contains(&ShardId::from("s1")));
    }

    #[tokio::test]
    async fn test_reload_replaces_view() {
        let catalog = Arc::new(ConfigCatalog::new());
        catalog.add_shard(ShardEntry::new("s1", "host1:27018")).unwrap();
        let registry = ShardRegistry::new(catalog.clone());
        registry.reload().await.unwrap();
        assert_eq!(registry.all().len(), 1);

        catalog.add_shard(ShardEntry::new("s2", "host2:27018")).unwrap();
        registry.reload().await.unwrap();
        assert_eq!(registry.all().len(), 2);
    }
}
