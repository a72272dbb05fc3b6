// Roles and permission statements for the gateway workload.
//
// Two roles are always built separately: the execution role is what the
// container platform uses to pull the image and ship logs, the task role is
// what the application itself uses to call the inference backend and read its
// API key parameter. They must never be merged.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::wildcard;
use super::{ResourceId, ResourceKind};
use crate::error::{ProvisionError, ProvisionResult};

/// Service principal of the container platform's task runtime
pub const TASKS_SERVICE_PRINCIPAL: &str = "ecs-tasks.amazonaws.com";

pub const REGISTRY_AUTH_ACTIONS: &[&str] = &["ecr:GetAuthorizationToken"];
pub const REGISTRY_READ_ACTIONS: &[&str] = &[
    "ecr:BatchCheckLayerAvailability",
    "ecr:GetDownloadUrlForLayer",
    "ecr:BatchGetImage",
];
pub const LOG_WRITE_ACTIONS: &[&str] = &["logs:CreateLogStream", "logs:PutLogEvents"];
pub const MODEL_INVOKE_ACTIONS: &[&str] = &[
    "bedrock:InvokeModel",
    "bedrock:InvokeModelWithResponseStream",
    "bedrock:GetInferenceProfile",
    "bedrock:ListInferenceProfiles",
];
pub const PARAMETER_READ_ACTIONS: &[&str] = &[
    "ssm:GetParameter",
    "ssm:GetParameters",
    "ssm:GetParametersByPath",
];

/// Model ARNs are addressed across regions, so these stay wildcarded
pub const FOUNDATION_MODEL_ARN_PATTERN: &str = "arn:aws:bedrock:*::foundation-model/*";
pub const INFERENCE_PROFILE_ARN_PATTERN: &str = "arn:aws:bedrock:*:*:inference-profile/*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub sid: Option<String>,
    pub effect: Effect,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

impl PolicyStatement {
    pub fn allow(sid: &str, actions: &[&str], resources: &[String]) -> Self {
        Self {
            sid: Some(sid.to_string()),
            effect: Effect::Allow,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources: resources.to_vec(),
        }
    }

    fn matches(&self, action: &str, resource: &str) -> bool {
        self.actions.iter().any(|a| wildcard::matches(a, action))
            && self.resources.iter().any(|r| wildcard::matches(r, resource))
    }

    fn to_json(&self) -> serde_json::Value {
        let mut statement = json!({
            "Effect": self.effect,
            "Action": self.actions,
            "Resource": self.resources,
        });
        if let Some(sid) = &self.sid {
            statement["Sid"] = json!(sid);
        }
        statement
    }
}

/// What a role is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolePurpose {
    /// Platform operations: pulling images, writing logs
    Execution,
    /// Application operations: calling the backend, reading the API key
    Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: ResourceId,
    pub purpose: RolePurpose,
    /// Service allowed to assume the role
    pub trusted_service: String,
    pub statements: Vec<PolicyStatement>,
    /// Resources named in the statements
    #[serde(default)]
    pub references: Vec<ResourceId>,
}

impl Role {
    /// Evaluate a request: an explicit deny wins, otherwise any allow grants,
    /// otherwise the request is implicitly denied
    pub fn is_allowed(&self, action: &str, resource: &str) -> bool {
        let mut allowed = false;
        for statement in &self.statements {
            if statement.matches(action, resource) {
                match statement.effect {
                    Effect::Deny => return false,
                    Effect::Allow => allowed = true,
                }
            }
        }
        allowed
    }

    /// True if any allow statement grants an action matching `action`
    pub fn grants_action(&self, action: &str) -> bool {
        self.statements.iter().any(|s| {
            s.effect == Effect::Allow && s.actions.iter().any(|a| wildcard::matches(a, action))
        })
    }

    pub fn policy_document(&self) -> serde_json::Value {
        json!({
            "Version": "2012-10-17",
            "Statement": self.statements.iter().map(|s| s.to_json()).collect::<Vec<_>>(),
        })
    }

    pub fn trust_policy(&self) -> serde_json::Value {
        json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Principal": { "Service": self.trusted_service },
                    "Action": "sts:AssumeRole",
                }
            ]
        })
    }
}

/// Inputs for the execution role
pub struct ExecutionGrants<'a> {
    pub repository_arn: String,
    pub log_streams_arn: String,
    pub references: &'a [ResourceId],
}

/// Inputs for the task role
pub struct TaskGrants {
    pub parameter_arn: String,
}

pub fn execution_role(id: &str, grants: ExecutionGrants<'_>) -> Role {
    Role {
        id: ResourceId::new(ResourceKind::Role, id),
        purpose: RolePurpose::Execution,
        trusted_service: TASKS_SERVICE_PRINCIPAL.to_string(),
        statements: vec![
            // The token API does not support resource-level scoping
            PolicyStatement::allow("RegistryAuth", REGISTRY_AUTH_ACTIONS, &["*".to_string()]),
            PolicyStatement::allow(
                "RegistryPull",
                REGISTRY_READ_ACTIONS,
                &[grants.repository_arn],
            ),
            PolicyStatement::allow("LogWrite", LOG_WRITE_ACTIONS, &[grants.log_streams_arn]),
        ],
        references: grants.references.to_vec(),
    }
}

pub fn task_role(id: &str, grants: TaskGrants) -> Role {
    Role {
        id: ResourceId::new(ResourceKind::Role, id),
        purpose: RolePurpose::Task,
        trusted_service: TASKS_SERVICE_PRINCIPAL.to_string(),
        statements: vec![
            PolicyStatement::allow(
                "ModelInvoke",
                MODEL_INVOKE_ACTIONS,
                &[
                    FOUNDATION_MODEL_ARN_PATTERN.to_string(),
                    INFERENCE_PROFILE_ARN_PATTERN.to_string(),
                ],
            ),
            PolicyStatement::allow(
                "ApiKeyParameterRead",
                PARAMETER_READ_ACTIONS,
                &[grants.parameter_arn],
            ),
        ],
        references: Vec::new(),
    }
}

/// ARN of a parameter store entry given its absolute path
pub fn parameter_arn(region: &str, account_id: &str, path: &str) -> String {
    format!(
        "arn:aws:ssm:{}:{}:parameter/{}",
        region,
        account_id,
        path.trim_start_matches('/')
    )
}

/// Check that the two roles keep to their own purpose.
///
/// The execution role may not invoke models or read parameters; the task role
/// may not authenticate against or pull from the registry. Parameter grants
/// must name a single parameter.
pub fn validate_separation(execution: &Role, task: &Role) -> ProvisionResult<()> {
    if execution.purpose != RolePurpose::Execution || task.purpose != RolePurpose::Task {
        return Err(ProvisionError::Validation {
            resource: execution.id.clone(),
            message: "execution and task roles are swapped".to_string(),
        });
    }
    if execution.id == task.id {
        return Err(ProvisionError::Validation {
            resource: execution.id.clone(),
            message: "execution role and task role must be distinct roles".to_string(),
        });
    }

    let forbidden_for_execution = MODEL_INVOKE_ACTIONS
        .iter()
        .chain(PARAMETER_READ_ACTIONS.iter());
    for action in forbidden_for_execution {
        if execution.grants_action(action) {
            return Err(ProvisionError::Validation {
                resource: execution.id.clone(),
                message: format!("execution role must not grant application action {}", action),
            });
        }
    }

    let forbidden_for_task = REGISTRY_AUTH_ACTIONS
        .iter()
        .chain(REGISTRY_READ_ACTIONS.iter());
    for action in forbidden_for_task {
        if task.grants_action(action) {
            return Err(ProvisionError::Validation {
                resource: task.id.clone(),
                message: format!("task role must not grant platform action {}", action),
            });
        }
    }

    for statement in &task.statements {
        let reads_parameters = statement
            .actions
            .iter()
            .any(|a| a.starts_with("ssm:") || a == "*");
        if reads_parameters && statement.resources.iter().any(|r| wildcard::is_wildcard(r)) {
            return Err(ProvisionError::Validation {
                resource: task.id.clone(),
                message: "parameter read access must name exactly one parameter".to_string(),
            });
        }
    }

    Ok(())
}

/// A grant worth a human look before rollout
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewFinding {
    pub role: ResourceId,
    pub statement: String,
    pub resource: String,
    pub note: String,
}

/// List wildcard resource grants.
///
/// Cross-region model ARNs are kept wildcarded on purpose; they are reported
/// here so the decision stays visible rather than being narrowed silently.
pub fn review_findings(roles: &[&Role]) -> Vec<ReviewFinding> {
    let mut findings = Vec::new();
    for role in roles {
        for statement in &role.statements {
            for resource in &statement.resources {
                if !wildcard::is_wildcard(resource) {
                    continue;
                }
                let note = if resource == "*" {
                    "action does not support resource-level permissions".to_string()
                } else if resource.starts_with("arn:aws:bedrock:") {
                    "model access spans all regions/accounts; narrow to the deployment region if cross-region inference is not needed".to_string()
                } else {
                    "wildcard resource grant".to_string()
                };
                findings.push(ReviewFinding {
                    role: role.id.clone(),
                    statement: statement.sid.clone().unwrap_or_default(),
                    resource: resource.clone(),
                    note,
                });
            }
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: &str = "us-east-1";
    const ACCOUNT: &str = "123456789012";

    fn roles() -> (Role, Role) {
        let exec = execution_role(
            "exec",
            ExecutionGrants {
                repository_arn: format!(
                    "arn:aws:ecr:{}:{}:repository/bedrock-proxy-api-ecs",
                    REGION, ACCOUNT
                ),
                log_streams_arn: format!(
                    "arn:aws:logs:{}:{}:log-group:cursor-gateway-logs:*",
                    REGION, ACCOUNT
                ),
                references: &[],
            },
        );
        let task = task_role(
            "task",
            TaskGrants {
                parameter_arn: parameter_arn(REGION, ACCOUNT, "/bedrock-api/BedrockProxyAPIKey"),
            },
        );
        (exec, task)
    }

    #[test]
    fn test_roles_are_separated() {
        let (exec, task) = roles();
        assert!(validate_separation(&exec, &task).is_ok());
    }

    #[test]
    fn test_execution_role_never_invokes_models() {
        let (exec, _) = roles();
        for action in MODEL_INVOKE_ACTIONS {
            assert!(!exec.grants_action(action));
        }
        assert!(!exec.is_allowed(
            "bedrock:InvokeModel",
            "arn:aws:bedrock:us-east-1::foundation-model/anthropic.claude-3-5-sonnet-20240620-v1:0"
        ));
    }

    #[test]
    fn test_task_role_never_authenticates_to_registry() {
        let (_, task) = roles();
        for action in REGISTRY_AUTH_ACTIONS.iter().chain(REGISTRY_READ_ACTIONS) {
            assert!(!task.grants_action(action));
        }
        assert!(!task.is_allowed("ecr:GetAuthorizationToken", "*"));
    }

    #[test]
    fn test_parameter_grant_matches_exactly_one_path() {
        let (_, task) = roles();
        let granted = parameter_arn(REGION, ACCOUNT, "/bedrock-api/BedrockProxyAPIKey");
        assert!(task.is_allowed("ssm:GetParameter", &granted));

        // Same namespace, different parameter
        let sibling = parameter_arn(REGION, ACCOUNT, "/bedrock-api/OtherKey");
        assert!(!task.is_allowed("ssm:GetParameter", &sibling));
        // Nested below the granted path
        let nested = parameter_arn(REGION, ACCOUNT, "/bedrock-api/BedrockProxyAPIKey/child");
        assert!(!task.is_allowed("ssm:GetParameter", &nested));
        // Same path in another account
        let other_account = parameter_arn(REGION, "999999999999", "/bedrock-api/BedrockProxyAPIKey");
        assert!(!task.is_allowed("ssm:GetParameter", &other_account));
    }

    #[test]
    fn test_model_access_is_cross_region() {
        let (_, task) = roles();
        assert!(task.is_allowed(
            "bedrock:InvokeModel",
            "arn:aws:bedrock:eu-west-1::foundation-model/cohere.embed-multilingual-v3"
        ));
        assert!(task.is_allowed(
            "bedrock:InvokeModelWithResponseStream",
            "arn:aws:bedrock:us-west-2:123456789012:inference-profile/us.anthropic.claude-3-5-sonnet-20240620-v1:0"
        ));
        assert!(!task.is_allowed(
            "bedrock:CreateModelCustomizationJob",
            "arn:aws:bedrock:us-east-1::foundation-model/x"
        ));
    }

    #[test]
    fn test_explicit_deny_wins() {
        let (_, mut task) = roles();
        task.statements.push(PolicyStatement {
            sid: None,
            effect: Effect::Deny,
            actions: vec!["bedrock:*".to_string()],
            resources: vec!["*".to_string()],
        });
        assert!(!task.is_allowed(
            "bedrock:InvokeModel",
            "arn:aws:bedrock:us-east-1::foundation-model/x"
        ));
    }

    #[test]
    fn test_merged_role_is_rejected() {
        let (exec, task) = roles();
        let mut merged = exec.clone();
        merged.statements.extend(task.statements.clone());
        assert!(validate_separation(&merged, &task).is_err());

        let mut greedy_task = task.clone();
        greedy_task
            .statements
            .push(PolicyStatement::allow("Pull", &["ecr:*"], &["*".to_string()]));
        assert!(validate_separation(&exec, &greedy_task).is_err());
    }

    #[test]
    fn test_wildcard_parameter_grant_is_rejected() {
        let (exec, _) = roles();
        let task = task_role(
            "task",
            TaskGrants {
                parameter_arn: parameter_arn(REGION, ACCOUNT, "/bedrock-api/*"),
            },
        );
        assert!(validate_separation(&exec, &task).is_err());
    }

    #[test]
    fn test_review_findings_flag_wildcards() {
        let (exec, task) = roles();
        let findings = review_findings(&[&exec, &task]);
        let resources: Vec<&str> = findings.iter().map(|f| f.resource.as_str()).collect();
        assert!(resources.contains(&"*"));
        assert!(resources.contains(&FOUNDATION_MODEL_ARN_PATTERN));
        assert!(resources.contains(&INFERENCE_PROFILE_ARN_PATTERN));
        // The log stream pattern is scoped to one group and still reported
        assert_eq!(findings.len(), 4);
        assert!(!resources.iter().any(|r| r.contains(":parameter/")));
    }

    #[test]
    fn test_policy_document_shape() {
        let (_, task) = roles();
        let doc = task.policy_document();
        assert_eq!(doc["Version"], "2012-10-17");
        assert_eq!(doc["Statement"][0]["Effect"], "Allow");
        assert_eq!(doc["Statement"][1]["Sid"], "ApiKeyParameterRead");
        assert_eq!(
            task.trust_policy()["Statement"][0]["Principal"]["Service"],
            TASKS_SERVICE_PRINCIPAL
        );
    }
}
