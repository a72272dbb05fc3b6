// Local registry
//
// Repositories and image records kept in memory and optionally persisted next
// to the stack state. Retention runs on every push, the way the registry
// service's lifecycle policy would.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{RegistryApi, RegistryCredentials, RepositoryInfo};
use crate::resources::registry::{ImageRecord, RetentionPolicy};
use crate::resources::RegistryRepository;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRepository {
    retention: RetentionPolicy,
    scan_on_push: bool,
    #[serde(default)]
    images: Vec<ImageRecord>,
}

pub struct MemoryRegistry {
    region: String,
    account_id: String,
    path: Option<PathBuf>,
    repositories: Mutex<BTreeMap<String, StoredRepository>>,
}

impl MemoryRegistry {
    pub fn new(region: &str, account_id: &str) -> Self {
        Self {
            region: region.to_string(),
            account_id: account_id.to_string(),
            path: None,
            repositories: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registry persisted at `path`
    pub fn open(path: &Path, region: &str, account_id: &str) -> Result<Self> {
        let repositories = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read registry {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse registry {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            region: region.to_string(),
            account_id: account_id.to_string(),
            path: Some(path.to_path_buf()),
            repositories: Mutex::new(repositories),
        })
    }

    fn save(&self, repositories: &BTreeMap<String, StoredRepository>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json =
            serde_json::to_string_pretty(repositories).context("Failed to serialize registry")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write registry {}", path.display()))
    }

    fn info(&self, name: &str) -> RepositoryInfo {
        RepositoryInfo {
            name: name.to_string(),
            uri: format!(
                "{}.dkr.ecr.{}.amazonaws.com/{}",
                self.account_id, self.region, name
            ),
            arn: format!(
                "arn:aws:ecr:{}:{}:repository/{}",
                self.region, self.account_id, name
            ),
        }
    }
}

#[async_trait]
impl RegistryApi for MemoryRegistry {
    async fn ensure_repository(&self, repository: &RegistryRepository) -> Result<RepositoryInfo> {
        let mut repositories = self.repositories.lock().await;
        match repositories.get_mut(&repository.repository_name) {
            Some(existing) => {
                debug!("Repository {} already exists", repository.repository_name);
                existing.retention = repository.retention.clone();
                existing.scan_on_push = repository.scan_on_push;
            }
            None => {
                info!("Creating repository: {}", repository.repository_name);
                repositories.insert(
                    repository.repository_name.clone(),
                    StoredRepository {
                        retention: repository.retention.clone(),
                        scan_on_push: repository.scan_on_push,
                        images: Vec::new(),
                    },
                );
            }
        }
        self.save(&repositories)?;
        Ok(self.info(&repository.repository_name))
    }

    async fn delete_repository(&self, repository_name: &str) -> Result<()> {
        let mut repositories = self.repositories.lock().await;
        if repositories.remove(repository_name).is_some() {
            info!("Deleted repository: {}", repository_name);
        }
        self.save(&repositories)
    }

    async fn credentials(&self) -> Result<Option<RegistryCredentials>> {
        Ok(None)
    }

    async fn confirm_push(
        &self,
        repository_name: &str,
        tag: &str,
        local_digest: &str,
    ) -> Result<ImageRecord> {
        let mut repositories = self.repositories.lock().await;
        let repository = repositories
            .get_mut(repository_name)
            .with_context(|| format!("Repository {} does not exist", repository_name))?;

        // A tag points at exactly one image
        for image in repository.images.iter_mut() {
            image.tags.retain(|t| t != tag);
        }

        let record = match repository
            .images
            .iter_mut()
            .find(|i| i.digest == local_digest)
        {
            Some(existing) => {
                existing.tags.push(tag.to_string());
                existing.clone()
            }
            None => {
                // Keep push order strict even when two pushes share a timestamp
                let mut pushed_at = Utc::now();
                if let Some(last) = repository.images.iter().map(|i| i.pushed_at).max() {
                    if pushed_at <= last {
                        pushed_at = last + Duration::milliseconds(1);
                    }
                }
                let record = ImageRecord {
                    digest: local_digest.to_string(),
                    tags: vec![tag.to_string()],
                    pushed_at,
                };
                repository.images.push(record.clone());
                if repository.scan_on_push {
                    debug!(digest = %record.digest, "Queued image scan");
                }
                record
            }
        };

        let expired = repository.retention.select_expired(&repository.images);
        if !expired.is_empty() {
            info!(
                repository = repository_name,
                expired = expired.len(),
                "Retention policy expired images"
            );
            repository.images.retain(|i| !expired.contains(&i.digest));
        }

        self.save(&repositories)?;
        Ok(record)
    }

    async fn list_images(&self, repository_name: &str) -> Result<Vec<ImageRecord>> {
        let repositories = self.repositories.lock().await;
        let repository = repositories
            .get(repository_name)
            .with_context(|| format!("Repository {} does not exist", repository_name))?;
        let mut images = repository.images.clone();
        images.sort_by_key(|i| i.pushed_at);
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repository(max: u32) -> RegistryRepository {
        RegistryRepository::new("repo", "bedrock-proxy-api-ecs", max)
    }

    #[tokio::test]
    async fn test_push_beyond_cap_evicts_oldest() {
        let registry = MemoryRegistry::new("us-east-1", "123456789012");
        registry.ensure_repository(&repository(3)).await.unwrap();
        for i in 0..5 {
            registry
                .confirm_push("bedrock-proxy-api-ecs", "latest", &format!("sha256:{:04}", i))
                .await
                .unwrap();
            let images = registry.list_images("bedrock-proxy-api-ecs").await.unwrap();
            assert!(images.len() <= 3);
        }
        let digests: Vec<String> = registry
            .list_images("bedrock-proxy-api-ecs")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.digest)
            .collect();
        assert_eq!(digests, vec!["sha256:0002", "sha256:0003", "sha256:0004"]);
    }

    #[tokio::test]
    async fn test_tag_moves_to_newest_push() {
        let registry = MemoryRegistry::new("us-east-1", "123456789012");
        registry.ensure_repository(&repository(10)).await.unwrap();
        registry
            .confirm_push("bedrock-proxy-api-ecs", "latest", "sha256:aaaa")
            .await
            .unwrap();
        registry
            .confirm_push("bedrock-proxy-api-ecs", "latest", "sha256:bbbb")
            .await
            .unwrap();
        let images = registry.list_images("bedrock-proxy-api-ecs").await.unwrap();
        assert!(images[0].tags.is_empty());
        assert_eq!(images[1].tags, vec!["latest"]);
    }

    #[tokio::test]
    async fn test_push_to_missing_repository_fails() {
        let registry = MemoryRegistry::new("us-east-1", "123456789012");
        assert!(registry
            .confirm_push("missing", "latest", "sha256:aaaa")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_registry_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        {
            let registry = MemoryRegistry::open(&path, "us-east-1", "123456789012").unwrap();
            let info = registry.ensure_repository(&repository(10)).await.unwrap();
            assert_eq!(
                info.uri,
                "123456789012.dkr.ecr.us-east-1.amazonaws.com/bedrock-proxy-api-ecs"
            );
            registry
                .confirm_push("bedrock-proxy-api-ecs", "latest", "sha256:aaaa")
                .await
                .unwrap();
        }
        let reopened = MemoryRegistry::open(&path, "us-east-1", "123456789012").unwrap();
        let images = reopened.list_images("bedrock-proxy-api-ecs").await.unwrap();
        assert_eq!(images.len(), 1);
    }
}
