use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{RemovalPolicy, ResourceId, ResourceKind};

/// Which images a retention rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Any,
    Tagged,
    Untagged,
}

impl TagStatus {
    fn applies_to(&self, image: &ImageRecord) -> bool {
        match self {
            TagStatus::Any => true,
            TagStatus::Tagged => !image.tags.is_empty(),
            TagStatus::Untagged => image.tags.is_empty(),
        }
    }
}

/// Keep only the most recently pushed images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_image_count: u32,
    pub tag_status: TagStatus,
    pub description: String,
}

impl RetentionPolicy {
    pub fn keep_latest(max_image_count: u32) -> Self {
        Self {
            max_image_count,
            tag_status: TagStatus::Any,
            description: format!("Delete more than {} image", max_image_count),
        }
    }

    /// Digests of the images this policy expires, oldest first.
    ///
    /// Images the rule applies to are ranked by push time; everything past the
    /// newest `max_image_count` is expired regardless of its tags.
    pub fn select_expired(&self, images: &[ImageRecord]) -> Vec<String> {
        let mut candidates: Vec<&ImageRecord> = images
            .iter()
            .filter(|image| self.tag_status.applies_to(image))
            .collect();

        // Newest first; ties broken by digest so the result is deterministic
        candidates.sort_by(|a, b| {
            b.pushed_at
                .cmp(&a.pushed_at)
                .then_with(|| a.digest.cmp(&b.digest))
        });

        let mut expired: Vec<&ImageRecord> = candidates
            .into_iter()
            .skip(self.max_image_count as usize)
            .collect();
        expired.reverse();
        expired.into_iter().map(|i| i.digest.clone()).collect()
    }

    /// Lifecycle policy document understood by the registry service
    pub fn to_lifecycle_policy(&self) -> serde_json::Value {
        json!({
            "rules": [
                {
                    "rulePriority": 1,
                    "description": self.description,
                    "selection": {
                        "tagStatus": self.tag_status,
                        "countType": "imageCountMoreThan",
                        "countNumber": self.max_image_count,
                    },
                    "action": { "type": "expire" }
                }
            ]
        })
    }
}

/// An image stored in a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub digest: String,
    pub tags: Vec<String>,
    pub pushed_at: DateTime<Utc>,
}

/// Container image repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRepository {
    pub id: ResourceId,
    pub repository_name: String,
    pub retention: RetentionPolicy,
    pub scan_on_push: bool,
    pub removal_policy: RemovalPolicy,
}

impl RegistryRepository {
    /// Repository that outlives the stack so pushed images survive teardown
    pub fn new(id: &str, repository_name: &str, max_image_count: u32) -> Self {
        Self {
            id: ResourceId::new(ResourceKind::Registry, id),
            repository_name: repository_name.to_string(),
            retention: RetentionPolicy::keep_latest(max_image_count),
            scan_on_push: true,
            removal_policy: RemovalPolicy::Retain,
        }
    }

    pub fn arn(&self, region: &str, account_id: &str) -> String {
        format!(
            "arn:aws:ecr:{}:{}:repository/{}",
            region, account_id, self.repository_name
        )
    }

    pub fn uri(&self, region: &str, account_id: &str) -> String {
        format!(
            "{}.dkr.ecr.{}.amazonaws.com/{}",
            account_id, region, self.repository_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn images(count: usize) -> Vec<ImageRecord> {
        let base = Utc::now();
        (0..count)
            .map(|i| ImageRecord {
                digest: format!("sha256:{:04}", i),
                // Every image is tagged; retention must not care
                tags: vec![format!("build-{}", i)],
                pushed_at: base + Duration::seconds(i as i64),
            })
            .collect()
    }

    #[test]
    fn test_retention_never_exceeds_cap() {
        for cap in 1..=5u32 {
            let policy = RetentionPolicy::keep_latest(cap);
            for count in 0..10usize {
                let imgs = images(count);
                let expired = policy.select_expired(&imgs);
                let kept = count - expired.len();
                assert!(kept <= cap as usize, "cap {} count {}", cap, count);
                assert_eq!(kept, count.min(cap as usize));
            }
        }
    }

    #[test]
    fn test_retention_expires_oldest_first() {
        let policy = RetentionPolicy::keep_latest(3);
        let expired = policy.select_expired(&images(5));
        assert_eq!(expired, vec!["sha256:0000", "sha256:0001"]);
    }

    #[test]
    fn test_retention_ignores_tag_names() {
        let mut imgs = images(3);
        // The oldest image carries the deployment tag; it still goes first
        imgs[0].tags = vec!["latest".to_string()];
        let expired = RetentionPolicy::keep_latest(2).select_expired(&imgs);
        assert_eq!(expired, vec!["sha256:0000"]);
    }

    #[test]
    fn test_untagged_rule_leaves_tagged_images() {
        let mut imgs = images(4);
        imgs[0].tags.clear();
        imgs[1].tags.clear();
        let policy = RetentionPolicy {
            max_image_count: 1,
            tag_status: TagStatus::Untagged,
            description: "untagged".into(),
        };
        assert_eq!(policy.select_expired(&imgs), vec!["sha256:0000"]);
    }

    #[test]
    fn test_lifecycle_policy_document() {
        let doc = RetentionPolicy::keep_latest(10).to_lifecycle_policy();
        let rule = &doc["rules"][0];
        assert_eq!(rule["selection"]["tagStatus"], "any");
        assert_eq!(rule["selection"]["countNumber"], 10);
        assert_eq!(rule["action"]["type"], "expire");
    }

    #[test]
    fn test_repository_is_retained() {
        let repo = RegistryRepository::new("repo", "bedrock-proxy-api-ecs", 10);
        assert_eq!(repo.removal_policy, RemovalPolicy::Retain);
        assert!(repo.scan_on_push);
        assert_eq!(
            repo.uri("us-east-1", "123456789012"),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/bedrock-proxy-api-ecs"
        );
    }
}
