//! Registry of remote instances a direct transfer can use as a source or
//! target, persisted to the `migration_instances` collection. Separate from
//! `cluster::NodeRegistry`: a remote instance is any authenticated running
//! deployment of this system, not necessarily a member of this process's
//! own cluster.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ClusterError, Result};
use crate::migration::security;
use crate::store::Store;
use crate::util::{new_id, now_unix_seconds};

pub const INSTANCES_COLLECTION: &str = "migration_instances";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInstance {
    pub instance_id: String,
    pub owner_id: String,
    pub name: String,
    pub base_url: String,
    /// AES-256-GCM ciphertext of the instance's API key, keyed by this
    /// node's cluster auth token. Never returned to callers in plaintext.
    pub encrypted_api_key: String,
    pub cached_size_bytes: u64,
    pub cached_collection_count: u64,
    /// Storage capacity the instance advertised at registration, if any.
    /// Checked before a transfer targets it.
    pub capacity_bytes: Option<u64>,
    pub last_synced: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct InstanceRegistry {
    store: Arc<dyn Store>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn register(
        &self,
        owner_id: &str,
        name: &str,
        base_url: &str,
        api_key: &str,
        capacity_bytes: Option<u64>,
        auth_key: &[u8; 32],
    ) -> Result<RemoteInstance> {
        let now = now_unix_seconds();
        let instance = RemoteInstance {
            instance_id: format!("inst-{}", new_id()),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            encrypted_api_key: hex::encode(security::encrypt(api_key.as_bytes(), auth_key)?),
            cached_size_bytes: 0,
            cached_collection_count: 0,
            capacity_bytes,
            last_synced: None,
            created_at: now,
            updated_at: now,
        };
        self.store
            .insert(INSTANCES_COLLECTION, &instance.instance_id, serde_json::to_value(&instance)?)
            .await?;
        Ok(instance)
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<RemoteInstance>> {
        match self.store.get(INSTANCES_COLLECTION, instance_id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn require(&self, instance_id: &str) -> Result<RemoteInstance> {
        self.get(instance_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("remote instance {instance_id}")))
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<RemoteInstance>> {
        let docs = self.store.list(INSTANCES_COLLECTION).await?;
        let mut instances = Vec::new();
        for (_, doc) in docs {
            let instance: RemoteInstance = serde_json::from_value(doc)?;
            if instance.owner_id == owner_id {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    pub async fn delete(&self, instance_id: &str) -> Result<()> {
        self.store.delete(INSTANCES_COLLECTION, instance_id).await
    }

    /// Decrypts the stored API key for use in an outbound request header.
    /// Never logged or returned over HTTP.
    pub fn decrypt_api_key(&self, instance: &RemoteInstance, auth_key: &[u8; 32]) -> Result<String> {
        let ciphertext =
            hex::decode(&instance.encrypted_api_key).map_err(|e| ClusterError::Encryption(e.to_string()))?;
        let plaintext = security::decrypt(&ciphertext, auth_key)?;
        String::from_utf8(plaintext).map_err(|e| ClusterError::Encryption(e.to_string()))
    }

    pub async fn record_sync(&self, instance_id: &str, size_bytes: u64, collection_count: u64) -> Result<()> {
        let mut instance = self.require(instance_id).await?;
        instance.cached_size_bytes = size_bytes;
        instance.cached_collection_count = collection_count;
        instance.last_synced = Some(now_unix_seconds());
        instance.updated_at = now_unix_seconds();
        self.store
            .replace(INSTANCES_COLLECTION, instance_id, serde_json::to_value(&instance)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn auth_key() -> [u8; 32] {
        [3u8; 32]
    }

    #[tokio::test]
    async fn register_then_get_roundtrips_and_hides_the_key() {
        let reg = InstanceRegistry::new(Arc::new(InMemoryStore::new()));
        let instance = reg
            .register("tenant-a", "backup-site", "https://backup.example.com/", "s3cr3t", Some(1_000_000), &auth_key())
            .await
            .unwrap();
        assert_eq!(instance.base_url, "https://backup.example.com");
        assert_ne!(instance.encrypted_api_key, "s3cr3t");

        let fetched = reg.require(&instance.instance_id).await.unwrap();
        let decrypted = reg.decrypt_api_key(&fetched, &auth_key()).unwrap();
        assert_eq!(decrypted, "s3cr3t");
    }

    #[tokio::test]
    async fn list_filters_by_owner() {
        let reg = InstanceRegistry::new(Arc::new(InMemoryStore::new()));
        reg.register("tenant-a", "one", "http://a", "k", None, &auth_key()).await.unwrap();
        reg.register("tenant-b", "two", "http://b", "k", None, &auth_key()).await.unwrap();
        let owned = reg.list("tenant-a").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, "one");
    }

    #[tokio::test]
    async fn record_sync_updates_cached_size_and_timestamp() {
        let reg = InstanceRegistry::new(Arc::new(InMemoryStore::new()));
        let instance = reg.register("tenant-a", "one", "http://a", "k", None, &auth_key()).await.unwrap();
        reg.record_sync(&instance.instance_id, 4096, 3).await.unwrap();
        let fetched = reg.require(&instance.instance_id).await.unwrap();
        assert_eq!(fetched.cached_size_bytes, 4096);
        assert_eq!(fetched.cached_collection_count, 3);
        assert!(fetched.last_synced.is_some());
    }
}
