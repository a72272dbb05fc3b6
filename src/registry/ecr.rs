use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ecr::types::{ImageIdentifier, ImageScanningConfiguration, Tag};
use aws_sdk_ecr::Client as EcrClient;
use base64::Engine;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{RegistryApi, RegistryCredentials, RepositoryInfo};
use crate::resources::registry::ImageRecord;
use crate::resources::RegistryRepository;

/// Extract a clean error message from an AWS SDK error's Debug output
///
/// The AWS SDK errors have verbose Debug output, but we can extract just the
/// meaningful message by parsing for the `message: Some("...")` pattern.
fn format_sdk_error<E: std::fmt::Debug>(err: &E) -> String {
    let debug_str = format!("{:?}", err);

    if let Some(start) = debug_str.find("message: Some(\"") {
        let start = start + 15;
        if let Some(end) = debug_str[start..].find("\")") {
            return debug_str[start..start + end].to_string();
        }
    }

    if debug_str.len() > 200 {
        let cut = (0..=200)
            .rev()
            .find(|i| debug_str.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}...", &debug_str[..cut])
    } else {
        debug_str
    }
}

/// Account id of the caller, for rendering ARNs
pub async fn caller_account_id(region: &str) -> Result<String> {
    let aws_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await;
    let sts = aws_sdk_sts::Client::new(&aws_config);
    let identity = sts
        .get_caller_identity()
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get caller identity: {}", format_sdk_error(&e)))?;
    identity
        .account()
        .map(|a| a.to_string())
        .context("Caller identity has no account id")
}

/// Amazon ECR driver
pub struct EcrRegistry {
    client: EcrClient,
    region: String,
    account_id: String,
    stack_name: String,
}

impl EcrRegistry {
    pub async fn new(region: &str, account_id: &str, stack_name: &str) -> Result<Self> {
        // Default credential chain (env vars, profile, instance role)
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;

        Ok(Self {
            client: EcrClient::new(&aws_config),
            region: region.to_string(),
            account_id: account_id.to_string(),
            stack_name: stack_name.to_string(),
        })
    }

    fn registry_url(&self) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com", self.account_id, self.region)
    }

    fn info(&self, name: &str) -> RepositoryInfo {
        RepositoryInfo {
            name: name.to_string(),
            uri: format!("{}/{}", self.registry_url(), name),
            arn: format!(
                "arn:aws:ecr:{}:{}:repository/{}",
                self.region, self.account_id, name
            ),
        }
    }

    async fn repository_exists(&self, name: &str) -> Result<bool> {
        match self
            .client
            .describe_repositories()
            .repository_names(name)
            .send()
            .await
        {
            Ok(response) => Ok(!response.repositories().is_empty()),
            Err(err) => {
                if let Some(service_err) = err.as_service_error() {
                    if service_err.is_repository_not_found_exception() {
                        return Ok(false);
                    }
                }
                Err(anyhow::anyhow!(
                    "Failed to check ECR repository existence for '{}': {}",
                    name,
                    format_sdk_error(&err)
                ))
            }
        }
    }
}

fn to_record(detail: &aws_sdk_ecr::types::ImageDetail) -> Option<ImageRecord> {
    let digest = detail.image_digest()?.to_string();
    let pushed_at = detail
        .image_pushed_at()
        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now);
    Some(ImageRecord {
        digest,
        tags: detail.image_tags().to_vec(),
        pushed_at,
    })
}

#[async_trait]
impl RegistryApi for EcrRegistry {
    async fn ensure_repository(&self, repository: &RegistryRepository) -> Result<RepositoryInfo> {
        let name = &repository.repository_name;

        if self.repository_exists(name).await? {
            debug!("ECR repository {} already exists", name);
            self.client
                .put_image_scanning_configuration()
                .repository_name(name)
                .image_scanning_configuration(
                    ImageScanningConfiguration::builder()
                        .scan_on_push(repository.scan_on_push)
                        .build(),
                )
                .send()
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to update scanning for '{}': {}",
                        name,
                        format_sdk_error(&e)
                    )
                })?;
        } else {
            info!("Creating ECR repository: {}", name);

            let managed_tag = Tag::builder()
                .key("gateway-stack:managed")
                .value("true")
                .build()
                .context("Failed to build managed tag")?;
            let stack_tag = Tag::builder()
                .key("gateway-stack:stack")
                .value(&self.stack_name)
                .build()
                .context("Failed to build stack tag")?;

            self.client
                .create_repository()
                .repository_name(name)
                .tags(managed_tag)
                .tags(stack_tag)
                .image_scanning_configuration(
                    ImageScanningConfiguration::builder()
                        .scan_on_push(repository.scan_on_push)
                        .build(),
                )
                .send()
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to create ECR repository '{}': {}",
                        name,
                        format_sdk_error(&e)
                    )
                })?;
        }

        let policy = repository.retention.to_lifecycle_policy().to_string();
        self.client
            .put_lifecycle_policy()
            .repository_name(name)
            .lifecycle_policy_text(policy)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to put lifecycle policy on '{}': {}",
                    name,
                    format_sdk_error(&e)
                )
            })?;

        Ok(self.info(name))
    }

    async fn delete_repository(&self, repository_name: &str) -> Result<()> {
        if !self.repository_exists(repository_name).await? {
            debug!(
                "ECR repository {} does not exist, nothing to delete",
                repository_name
            );
            return Ok(());
        }

        info!("Deleting ECR repository: {}", repository_name);
        self.client
            .delete_repository()
            .repository_name(repository_name)
            .force(true)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to delete ECR repository '{}': {}",
                    repository_name,
                    format_sdk_error(&e)
                )
            })?;
        Ok(())
    }

    async fn credentials(&self) -> Result<Option<RegistryCredentials>> {
        let response = self
            .client
            .get_authorization_token()
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to get ECR authorization token: {}",
                    format_sdk_error(&e)
                )
            })?;

        let auth_data = response
            .authorization_data()
            .first()
            .context("No authorization data returned from ECR")?;
        let token = auth_data
            .authorization_token()
            .context("No authorization token in response")?;

        // Token is base64("AWS:<password>")
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token)
            .context("Failed to decode ECR token")?;
        let decoded = String::from_utf8(decoded).context("ECR token is not valid UTF-8")?;
        let (username, password) = decoded
            .split_once(':')
            .context("Invalid ECR token format")?;

        Ok(Some(RegistryCredentials {
            server: self.registry_url(),
            username: username.to_string(),
            password: password.to_string(),
        }))
    }

    async fn confirm_push(
        &self,
        repository_name: &str,
        tag: &str,
        _local_digest: &str,
    ) -> Result<ImageRecord> {
        let response = self
            .client
            .describe_images()
            .repository_name(repository_name)
            .image_ids(ImageIdentifier::builder().image_tag(tag).build())
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to describe {}:{}: {}",
                    repository_name,
                    tag,
                    format_sdk_error(&e)
                )
            })?;

        response
            .image_details()
            .iter()
            .find_map(to_record)
            .with_context(|| format!("{}:{} not found after push", repository_name, tag))
    }

    async fn list_images(&self, repository_name: &str) -> Result<Vec<ImageRecord>> {
        let mut images = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let response = self
                .client
                .describe_images()
                .repository_name(repository_name)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to list images in '{}': {}",
                        repository_name,
                        format_sdk_error(&e)
                    )
                })?;
            images.extend(response.image_details().iter().filter_map(to_record));
            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        images.sort_by_key(|i| i.pushed_at);
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sdk_error_extracts_message() {
        #[derive(Debug)]
        #[allow(dead_code)]
        struct FakeError {
            message: Option<&'static str>,
        }
        let err = FakeError {
            message: Some("Repository already exists"),
        };
        assert_eq!(format_sdk_error(&err), "Repository already exists");
    }
}
