//! KL-004: Deployment configuration and deep merge.
//!
//! Parameter precedence, highest first: resource > environment > template
//! defaults. Objects merge key by key; any other value replaces wholesale.

use super::gitsource::normalize_host;
use super::types::{EnvironmentCompute, Manifest, Secret};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Azure deployment scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AzureProvider {
    /// `/subscriptions/{id}/resourceGroups/{name}`
    pub scope: String,
}

/// AWS deployment scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AwsProvider {
    /// `/planes/aws/aws/accounts/{id}/regions/{region}`
    pub scope: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Providers {
    #[serde(default)]
    pub azure: Option<AzureProvider>,
    #[serde(default)]
    pub aws: Option<AwsProvider>,
}

/// Authentication material for one git host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GitAuth {
    /// Personal access token
    #[serde(default)]
    pub token: Option<Secret>,
    /// PEM CA bundle path
    #[serde(default)]
    pub ca_bundle: Option<String>,
    /// Client certificate path
    #[serde(default)]
    pub client_cert: Option<String>,
    /// Client key path
    #[serde(default)]
    pub client_key: Option<Secret>,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl GitAuth {
    /// Field-by-field overlay: any field set in `over` wins.
    pub fn overlay(&self, over: &GitAuth) -> GitAuth {
        GitAuth {
            token: over.token.clone().or_else(|| self.token.clone()),
            ca_bundle: over.ca_bundle.clone().or_else(|| self.ca_bundle.clone()),
            client_cert: over
                .client_cert
                .clone()
                .or_else(|| self.client_cert.clone()),
            client_key: over.client_key.clone().or_else(|| self.client_key.clone()),
            proxy_url: over.proxy_url.clone().or_else(|| self.proxy_url.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GitConfig {
    /// Auth keyed by normalized hostname
    #[serde(default)]
    pub pat: IndexMap<String, GitAuth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TerraformConfig {
    /// Provider blocks keyed by provider name, passed through to main.tf.json
    #[serde(default)]
    pub providers: IndexMap<String, Vec<Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RecipeConfig {
    #[serde(default)]
    pub terraform: TerraformConfig,
    /// Extra environment variables for recipe subprocesses
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub git: GitConfig,
}

/// Merged configuration handed to a recipe driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub runtime: EnvironmentCompute,
    pub providers: Providers,
    pub recipe_config: RecipeConfig,
}

impl Configuration {
    /// Environment-level configuration declared in a manifest.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            runtime: manifest.runtime.clone(),
            providers: manifest.providers.clone(),
            recipe_config: manifest.recipe_config.clone(),
        }
    }
}

/// Resource-level settings layered over the environment configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverlay<'a> {
    pub git_auth: Option<&'a IndexMap<String, GitAuth>>,
    pub providers: Option<&'a Providers>,
}

/// Merge environment configuration with resource-level overrides.
///
/// Git auth is merged per host and per field, the resource's entry winning.
/// Provider scopes set on the overlay replace the environment's.
pub fn merge(environment: &Configuration, overlay: &ConfigOverlay<'_>) -> Configuration {
    let mut merged = environment.clone();

    if let Some(providers) = overlay.providers {
        if providers.azure.is_some() {
            merged.providers.azure = providers.azure.clone();
        }
        if providers.aws.is_some() {
            merged.providers.aws = providers.aws.clone();
        }
    }

    if let Some(auth) = overlay.git_auth {
        let pat = &mut merged.recipe_config.git.pat;
        for (host, over) in auth {
            let key = normalize_host(host);
            // Environment keys are kept as written; match them normalized.
            match pat.keys().position(|h| normalize_host(h) == key) {
                Some(i) => {
                    if let Some((_, base)) = pat.get_index_mut(i) {
                        *base = base.overlay(over);
                    }
                }
                None => {
                    pat.insert(key, over.clone());
                }
            }
        }
    }

    merged
}

/// Merge recipe parameters: template defaults < environment < resource.
pub fn merge_parameters(
    template_defaults: &Map<String, Value>,
    environment: &Map<String, Value>,
    resource: &Map<String, Value>,
) -> Map<String, Value> {
    let mut out = Value::Object(template_defaults.clone());
    deep_merge(&mut out, &Value::Object(environment.clone()));
    deep_merge(&mut out, &Value::Object(resource.clone()));
    match out {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

/// Deep merge `overlay` into `base`. Objects merge recursively; anything
/// else in `overlay` replaces what is in `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        b.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (b, o) => *b = o.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn base_config() -> Configuration {
        Configuration {
            runtime: EnvironmentCompute::Kubernetes {
                namespace: "dev".into(),
                resource_id: None,
            },
            providers: Providers::default(),
            recipe_config: RecipeConfig::default(),
        }
    }

    #[test]
    fn test_kl004_resource_overrides_environment() {
        let env = obj(json!({"throughput": 400, "region": "eastus"}));
        let res = obj(json!({"throughput": 800}));
        let merged = merge_parameters(&Map::new(), &env, &res);
        assert_eq!(
            Value::Object(merged),
            json!({"throughput": 800, "region": "eastus"})
        );
    }

    #[test]
    fn test_kl004_three_level_precedence() {
        let tmpl = obj(json!({"a": 1, "b": 1, "c": 1}));
        let env = obj(json!({"b": 2, "c": 2}));
        let res = obj(json!({"c": 3}));
        let merged = merge_parameters(&tmpl, &env, &res);
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn test_kl004_deep_merge_preserves_siblings() {
        let mut base = json!({"sku": {"name": "Standard", "capacity": 1}, "tags": {"team": "a"}});
        deep_merge(&mut base, &json!({"sku": {"capacity": 3}}));
        assert_eq!(
            base,
            json!({"sku": {"name": "Standard", "capacity": 3}, "tags": {"team": "a"}})
        );
    }

    #[test]
    fn test_kl004_deep_merge_replaces_non_objects() {
        let mut base = json!({"zones": [1, 2, 3], "sku": {"name": "x"}});
        deep_merge(&mut base, &json!({"zones": [1], "sku": "flat"}));
        assert_eq!(base, json!({"zones": [1], "sku": "flat"}));
    }

    #[test]
    fn test_kl004_merge_git_auth_field_by_field() {
        let mut env = base_config();
        env.recipe_config.git.pat.insert(
            "github.com".into(),
            GitAuth {
                token: Some(Secret::new("env-token")),
                proxy_url: Some("http://proxy:3128".into()),
                ..Default::default()
            },
        );
        let mut res_auth = IndexMap::new();
        res_auth.insert(
            "www.github.com".to_string(),
            GitAuth {
                token: Some(Secret::new("res-token")),
                ..Default::default()
            },
        );
        let merged = merge(
            &env,
            &ConfigOverlay {
                git_auth: Some(&res_auth),
                providers: None,
            },
        );
        let auth = &merged.recipe_config.git.pat["github.com"];
        assert_eq!(auth.token.as_ref().unwrap().as_str(), Some("res-token"));
        assert_eq!(auth.proxy_url.as_deref(), Some("http://proxy:3128"));
        assert_eq!(merged.recipe_config.git.pat.len(), 1);
    }

    #[test]
    fn test_kl004_merge_git_auth_www_environment_key() {
        let mut env = base_config();
        env.recipe_config.git.pat.insert(
            "www.GitHub.com".into(),
            GitAuth {
                token: Some(Secret::new("env-token")),
                proxy_url: Some("http://proxy:3128".into()),
                ..Default::default()
            },
        );
        let mut res_auth = IndexMap::new();
        res_auth.insert(
            "github.com".to_string(),
            GitAuth {
                token: Some(Secret::new("res-token")),
                ..Default::default()
            },
        );
        let merged = merge(
            &env,
            &ConfigOverlay {
                git_auth: Some(&res_auth),
                providers: None,
            },
        );
        assert_eq!(merged.recipe_config.git.pat.len(), 1);
        let auth = crate::core::gitsource::auth_for(&merged, "github.com").unwrap();
        assert_eq!(auth.token.as_ref().unwrap().as_str(), Some("res-token"));
        assert_eq!(auth.proxy_url.as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn test_kl004_merge_providers_overlay() {
        let mut env = base_config();
        env.providers.aws = Some(AwsProvider {
            scope: "/planes/aws/aws/accounts/1/regions/us-west-2".into(),
        });
        let over = Providers {
            azure: Some(AzureProvider {
                scope: "/subscriptions/s/resourceGroups/g".into(),
            }),
            aws: None,
        };
        let merged = merge(
            &env,
            &ConfigOverlay {
                git_auth: None,
                providers: Some(&over),
            },
        );
        assert!(merged.providers.azure.is_some());
        assert!(merged.providers.aws.is_some());
    }

    #[test]
    fn test_kl004_merge_empty_overlay_is_identity() {
        let env = base_config();
        assert_eq!(merge(&env, &ConfigOverlay::default()), env);
    }
}
