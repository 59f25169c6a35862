//! Provider and credential configuration shapes.
//!
//! Adapted from the single-credential-per-provider `ProviderAuth` pattern into
//! a pool: `credentials.apiKey` accepts either one string or an array, and the
//! array form is what feeds the Route Preprocessor's `CredentialPool`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::routing::credential::RotationStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectTag {
    Openai,
    Gemini,
    Codewhisperer,
    Lmstudio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Bearer,
    XApiKey,
    Header,
}

impl Default for AuthMethod {
    fn default() -> Self {
        AuthMethod::Bearer
    }
}

impl AuthMethod {
    /// Build the `(header-name, header-value)` pair dispatch attaches to the
    /// outgoing upstream request for one selected credential.
    pub fn build_header(&self, key: &str, header_name: Option<&str>) -> (String, String) {
        match self {
            AuthMethod::Bearer => ("authorization".to_string(), format!("Bearer {}", key)),
            AuthMethod::XApiKey => ("x-api-key".to_string(), key.to_string()),
            AuthMethod::Header => (
                header_name.unwrap_or("x-api-key").to_string(),
                key.to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiKeySpec {
    Single(String),
    Many(Vec<String>),
}

impl ApiKeySpec {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ApiKeySpec::Single(s) => vec![s],
            ApiKeySpec::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    #[serde(rename = "apiKey")]
    pub api_key: ApiKeySpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticationConfig {
    #[serde(rename = "type", default)]
    pub method: AuthMethod,
    pub credentials: CredentialsConfig,
    #[serde(rename = "headerName", default)]
    pub header_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyRotationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: RotationStrategy,
    #[serde(rename = "cooldownMs", default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(rename = "maxRetriesPerKey", default = "default_max_retries_per_key")]
    pub max_retries_per_key: u32,
}

fn default_true() -> bool {
    true
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_max_retries_per_key() -> u32 {
    2
}

impl Default for KeyRotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RotationStrategy::RoundRobin,
            cooldown_ms: default_cooldown_ms(),
            max_retries_per_key: default_max_retries_per_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: DialectTag,
    pub endpoint: String,
    pub authentication: AuthenticationConfig,
    #[serde(rename = "keyRotation", default)]
    pub key_rotation: KeyRotationConfig,
    #[serde(rename = "compatibilityAdapter", default)]
    pub compatibility_adapter: Option<String>,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_spec_single_normalizes_to_one_element_vec() {
        let spec: ApiKeySpec = serde_json::from_str("\"sk-abc\"").unwrap();
        assert_eq!(spec.into_vec(), vec!["sk-abc".to_string()]);
    }

    #[test]
    fn api_key_spec_array_preserves_order() {
        let spec: ApiKeySpec = serde_json::from_str("[\"k1\",\"k2\",\"k3\"]").unwrap();
        assert_eq!(
            spec.into_vec(),
            vec!["k1".to_string(), "k2".to_string(), "k3".to_string()]
        );
    }

    #[test]
    fn bearer_auth_header() {
        let (name, value) = AuthMethod::Bearer.build_header("sk-abc", None);
        assert_eq!(name, "authorization");
        assert_eq!(value, "Bearer sk-abc");
    }

    #[test]
    fn x_api_key_auth_header() {
        let (name, value) = AuthMethod::XApiKey.build_header("sk-abc", None);
        assert_eq!(name, "x-api-key");
        assert_eq!(value, "sk-abc");
    }
}
