// Container environment schema
//
// The gateway container reads five settings from its environment. Each has a
// documented default; values are resolved once at provisioning start and
// validated before any resource is created.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ProvisionError, ProvisionResult};

pub const DEFAULT_API_KEY_PARAM_NAME: &str = "/bedrock-api/BedrockProxyAPIKey";
pub const DEFAULT_MODEL: &str = "anthropic.claude-3-5-sonnet-20240620-v1:0";
pub const DEFAULT_EMBEDDING_MODEL: &str = "cohere.embed-multilingual-v3";
pub const DEFAULT_MAX_TOKENS: &str = "2048";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnvKey {
    ApiKeyParamName,
    Debug,
    DefaultModel,
    DefaultEmbeddingModel,
    DefaultMaxTokens,
}

impl EnvKey {
    pub const ALL: [EnvKey; 5] = [
        EnvKey::ApiKeyParamName,
        EnvKey::Debug,
        EnvKey::DefaultModel,
        EnvKey::DefaultEmbeddingModel,
        EnvKey::DefaultMaxTokens,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EnvKey::ApiKeyParamName => "API_KEY_PARAM_NAME",
            EnvKey::Debug => "DEBUG",
            EnvKey::DefaultModel => "DEFAULT_MODEL",
            EnvKey::DefaultEmbeddingModel => "DEFAULT_EMBEDDING_MODEL",
            EnvKey::DefaultMaxTokens => "DEFAULT_MAX_TOKENS",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            EnvKey::ApiKeyParamName => DEFAULT_API_KEY_PARAM_NAME,
            EnvKey::Debug => "false",
            EnvKey::DefaultModel => DEFAULT_MODEL,
            EnvKey::DefaultEmbeddingModel => DEFAULT_EMBEDDING_MODEL,
            EnvKey::DefaultMaxTokens => DEFAULT_MAX_TOKENS,
        }
    }

    pub fn effect(&self) -> &'static str {
        match self {
            EnvKey::ApiKeyParamName => "parameter path the gateway reads its API key from",
            EnvKey::Debug => "verbose logging in the gateway",
            EnvKey::DefaultModel => "fallback inference model identifier",
            EnvKey::DefaultEmbeddingModel => "fallback embedding model identifier",
            EnvKey::DefaultMaxTokens => "fallback generation length cap",
        }
    }

    fn validate(&self, value: &str) -> Result<(), String> {
        match self {
            EnvKey::ApiKeyParamName => {
                if !value.starts_with('/') || value.ends_with('/') || value.contains('*') {
                    return Err(format!(
                        "{} must be a single absolute parameter path, got '{}'",
                        self, value
                    ));
                }
            }
            EnvKey::Debug => {
                if !matches!(value.to_ascii_lowercase().as_str(), "true" | "false") {
                    return Err(format!("{} must be 'true' or 'false', got '{}'", self, value));
                }
            }
            EnvKey::DefaultMaxTokens => match value.parse::<u32>() {
                Ok(n) if n > 0 => {}
                _ => {
                    return Err(format!(
                        "{} must be a positive integer, got '{}'",
                        self, value
                    ))
                }
            },
            EnvKey::DefaultModel | EnvKey::DefaultEmbeddingModel => {
                if value.chars().any(char::is_whitespace) {
                    return Err(format!("{} must not contain whitespace", self));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for EnvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Override,
    Default,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSource::Override => write!(f, "override"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// Fully resolved container environment: every key has a value
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerEnvironment {
    values: BTreeMap<EnvKey, (String, ValueSource)>,
}

impl ContainerEnvironment {
    /// Resolve every key through `lookup`; empty values count as unset
    pub fn resolve<F>(lookup: F) -> ProvisionResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = BTreeMap::new();
        for key in EnvKey::ALL {
            let (value, source) = match lookup(key.name()).filter(|v| !v.is_empty()) {
                Some(v) => (v, ValueSource::Override),
                None => (key.default_value().to_string(), ValueSource::Default),
            };
            key.validate(&value).map_err(ProvisionError::Config)?;
            values.insert(key, (value, source));
        }
        Ok(Self { values })
    }

    /// Resolve from the process environment
    pub fn from_process_env() -> ProvisionResult<Self> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Every key resolved to its default
    #[cfg(test)]
    pub fn defaults() -> Self {
        let values = EnvKey::ALL
            .iter()
            .map(|k| (*k, (k.default_value().to_string(), ValueSource::Default)))
            .collect();
        Self { values }
    }

    pub fn get(&self, key: EnvKey) -> &str {
        // Every key is inserted on construction
        self.values
            .get(&key)
            .map(|(v, _)| v.as_str())
            .unwrap_or_else(|| key.default_value())
    }

    pub fn source(&self, key: EnvKey) -> ValueSource {
        self.values
            .get(&key)
            .map(|(_, s)| *s)
            .unwrap_or(ValueSource::Default)
    }

    pub fn api_key_param_name(&self) -> &str {
        self.get(EnvKey::ApiKeyParamName)
    }

    /// The container's environment mapping
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, (v, _))| (k.name().to_string(), v.clone()))
            .collect()
    }
}
