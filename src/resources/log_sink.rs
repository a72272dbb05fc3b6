use serde::{Deserialize, Serialize};

use super::{RemovalPolicy, ResourceId, ResourceKind};

/// Log group the container's log driver writes to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSink {
    pub id: ResourceId,
    pub log_group_name: String,
    /// None keeps events forever
    #[serde(default)]
    pub retention_days: Option<u32>,
    pub removal_policy: RemovalPolicy,
}

impl LogSink {
    /// A log sink that is destroyed together with the stack
    pub fn new(id: &str, log_group_name: &str) -> Self {
        Self {
            id: ResourceId::new(ResourceKind::LogSink, id),
            log_group_name: log_group_name.to_string(),
            retention_days: None,
            removal_policy: RemovalPolicy::Destroy,
        }
    }

    pub fn arn(&self, region: &str, account_id: &str) -> String {
        format!(
            "arn:aws:logs:{}:{}:log-group:{}",
            region, account_id, self.log_group_name
        )
    }

    /// Pattern covering every stream inside the group
    pub fn streams_arn(&self, region: &str, account_id: &str) -> String {
        format!("{}:*", self.arn(region, account_id))
    }
}
