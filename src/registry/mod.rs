// Container registry drivers
//
// The Image Publisher talks to the registry through `RegistryApi`: ensure the
// repository exists with its retention policy, fetch push credentials, and
// confirm a pushed tag so the deployment can pin the resulting digest.

#[cfg(feature = "aws")]
pub mod ecr;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::resources::registry::ImageRecord;
use crate::resources::RegistryRepository;

#[cfg(feature = "aws")]
pub use ecr::EcrRegistry;
pub use memory::MemoryRegistry;

/// A repository as the registry reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub name: String,
    pub uri: String,
    pub arn: String,
}

/// Credentials for `docker login`
#[derive(Clone)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Create the repository if missing and (re)apply its settings
    async fn ensure_repository(&self, repository: &RegistryRepository) -> Result<RepositoryInfo>;

    /// Delete a repository and every image in it
    async fn delete_repository(&self, repository_name: &str) -> Result<()>;

    /// Credentials for pushing with a container CLI.
    ///
    /// `None` means the registry is not reachable over the network and pushes
    /// are recorded through `confirm_push` alone.
    async fn credentials(&self) -> Result<Option<RegistryCredentials>>;

    /// Record (or look up) the image `tag` now points at
    async fn confirm_push(
        &self,
        repository_name: &str,
        tag: &str,
        local_digest: &str,
    ) -> Result<ImageRecord>;

    /// Images in a repository, oldest first
    async fn list_images(&self, repository_name: &str) -> Result<Vec<ImageRecord>>;
}
