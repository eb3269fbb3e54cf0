//! KL-017: Recipe drivers — trait, registry, recipe context, output normalization.
//!
//! Drivers run one recipe under the caller's cancellation token and
//! deadline. Raw tool output is expected under a single `result` key holding
//! `values`, `secrets` and `resources`.

pub mod bicep;
pub mod process;
pub mod terraform;

use crate::core::configuration::Configuration;
use crate::core::error::DriverExecutionError;
use crate::core::resource_id::ResourceId;
use crate::core::types::{
    ComputedValueReference, DriverKind, EnvironmentCompute, OutputResource, OutputResourceType,
    Provider, Recipe, RecipeOutput, RecipeStatus, RendererOutput, ResourceIdentity, Secret,
    SecretValueReference,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline for one recipe execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
        }
    }
}

/// The resource a recipe runs for.
#[derive(Debug, Clone, Default)]
pub struct ResourceMetadata {
    pub name: String,
    pub id: String,
    pub resource_type: String,
    pub environment: String,
    pub application: Option<String>,
    /// Resource-level recipe parameters
    pub parameters: serde_json::Map<String, Value>,
    /// Resource ids produced by the last successful execution (used by delete)
    pub deployed_resources: Vec<String>,
}

/// One recipe execution strategy.
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        recipe: &Recipe,
        metadata: &ResourceMetadata,
        config: &Configuration,
    ) -> Result<RecipeOutput, DriverExecutionError>;

    async fn delete(
        &self,
        ctx: &ExecutionContext,
        recipe: &Recipe,
        metadata: &ResourceMetadata,
        config: &Configuration,
    ) -> Result<(), DriverExecutionError>;
}

/// Drivers keyed by kind.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: FxHashMap<DriverKind, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver, replacing any previous one of the same kind.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: DriverKind) -> Option<Arc<dyn Driver>> {
        self.drivers.get(&kind).cloned()
    }
}

// ============================================================================
// Recipe context
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextRef {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextResource {
    pub name: String,
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesContext {
    pub namespace: String,
    pub environment_namespace: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RuntimeContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureContext {
    pub resource_group: ContextRef,
    pub subscription: ContextRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AwsContext {
    pub region: String,
    pub account: String,
}

/// Metadata passed to templates that declare a `context` parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeContext {
    pub resource: ContextResource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<ContextRef>,
    pub environment: ContextRef,
    pub runtime: RuntimeContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsContext>,
}

impl RecipeContext {
    pub fn new(metadata: &ResourceMetadata, config: &Configuration) -> Self {
        let env_id = format!(
            "/planes/radius/local/resourceGroups/{}/providers/Applications.Core/environments/{}",
            metadata.environment, metadata.environment
        );
        let application = metadata.application.as_ref().map(|app| ContextRef {
            name: app.clone(),
            id: format!(
                "/planes/radius/local/resourceGroups/{}/providers/Applications.Core/applications/{}",
                metadata.environment, app
            ),
        });
        let runtime = match &config.runtime {
            EnvironmentCompute::Kubernetes { namespace, .. } => RuntimeContext {
                kubernetes: Some(KubernetesContext {
                    namespace: match &metadata.application {
                        Some(app) => format!("{}-{}", namespace, app),
                        None => namespace.clone(),
                    },
                    environment_namespace: namespace.clone(),
                }),
            },
            EnvironmentCompute::Aci { .. } => RuntimeContext::default(),
        };
        let azure = config.providers.azure.as_ref().and_then(|a| {
            let scope = ResourceId::parse(&a.scope).ok()?;
            let sub = scope.scope_value("subscriptions")?.to_string();
            let rg = scope.scope_value("resourceGroups")?.to_string();
            Some(AzureContext {
                resource_group: ContextRef {
                    id: scope.root_scope(),
                    name: rg,
                },
                subscription: ContextRef {
                    id: format!("/subscriptions/{}", sub),
                    name: sub,
                },
            })
        });
        let aws = config.providers.aws.as_ref().and_then(|a| {
            let scope = ResourceId::parse(&a.scope).ok()?;
            Some(AwsContext {
                account: scope.scope_value("accounts")?.to_string(),
                region: scope.scope_value("regions")?.to_string(),
            })
        });
        Self {
            resource: ContextResource {
                name: metadata.name.clone(),
                id: metadata.id.clone(),
                resource_type: metadata.resource_type.clone(),
            },
            application,
            environment: ContextRef {
                name: metadata.environment.clone(),
                id: env_id,
            },
            runtime,
            azure,
            aws,
        }
    }
}

// ============================================================================
// Output normalization
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResult {
    #[serde(default)]
    values: Option<IndexMap<String, Value>>,
    #[serde(default)]
    secrets: Option<IndexMap<String, Secret>>,
    #[serde(default)]
    resources: Option<Vec<String>>,
}

/// Parsed `result` object. Absent maps come back empty.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedResult {
    pub values: IndexMap<String, Value>,
    pub secrets: IndexMap<String, Secret>,
    pub resources: Vec<String>,
}

/// Parse the value of a recipe's `result` output. Only `values`,
/// `secrets` and `resources` are accepted.
pub fn parse_result(result: Option<&Value>) -> Result<ParsedResult, String> {
    let raw: RawResult = match result {
        None | Some(Value::Null) => RawResult::default(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| format!("invalid recipe result: {}", e))?,
    };
    Ok(ParsedResult {
        values: raw.values.unwrap_or_default(),
        secrets: raw.secrets.unwrap_or_default(),
        resources: raw.resources.unwrap_or_default(),
    })
}

/// Concatenate id lists, dropping case-insensitive duplicates. First
/// appearance wins.
pub fn union_resources(lists: &[&[String]]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for id in *list {
            if seen.insert(id.to_ascii_lowercase()) {
                out.push(id.clone());
            }
        }
    }
    out
}

/// Status block for a recipe's output.
pub fn recipe_status(recipe: &Recipe) -> RecipeStatus {
    RecipeStatus {
        template_kind: recipe.driver,
        template_path: recipe.template_path.clone(),
        template_version: recipe.template_version.clone(),
    }
}

/// Express a recipe output in the renderer vocabulary. Every value is a
/// literal; recipe resources become graph nodes already provisioned.
pub fn to_renderer_output(output: &RecipeOutput) -> RendererOutput {
    let mut out = RendererOutput::default();
    for (i, id) in output.resources.iter().enumerate() {
        let provider = Provider::from_resource_id(id);
        let kind = ResourceId::parse(id)
            .map(|r| r.fully_qualified_type())
            .ok()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let identity = match provider {
            Provider::Azure => ResourceIdentity::Arm { id: id.clone() },
            _ => ResourceIdentity::Ucp { id: id.clone() },
        };
        out.resources.push(OutputResource {
            local_id: format!("recipe-resource-{}", i),
            resource_type: OutputResourceType { kind, provider },
            identity,
            radius_managed: true,
            dependencies: Vec::new(),
            resource: Value::Null,
        });
    }
    for (k, v) in &output.values {
        out.computed_values
            .insert(k.clone(), ComputedValueReference::literal(v.clone()));
    }
    for (k, v) in &output.secrets {
        out.secret_values
            .insert(k.clone(), SecretValueReference::literal(v.clone()));
    }
    out
}

// ============================================================================
// Errors and redaction
// ============================================================================

/// Secret strings held in a configuration (tokens, client keys).
pub fn config_secrets(config: &Configuration) -> Vec<String> {
    let mut out = Vec::new();
    for auth in config.recipe_config.git.pat.values() {
        for secret in [&auth.token, &auth.client_key].into_iter().flatten() {
            if let Some(s) = secret.as_str() {
                if !s.is_empty() {
                    out.push(s.to_string());
                }
            }
        }
    }
    out
}

/// Replace every occurrence of each secret with `***`.
pub fn redact(message: &str, secrets: &[String]) -> String {
    let mut out = message.to_string();
    for s in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(s.as_str(), "***");
    }
    out
}

/// Build a driver error with secrets scrubbed from the message.
pub fn driver_error(
    recipe: &Recipe,
    config: &Configuration,
    message: impl AsRef<str>,
) -> DriverExecutionError {
    DriverExecutionError {
        recipe: recipe.name.clone(),
        template: recipe.template_path.clone(),
        message: redact(message.as_ref(), &config_secrets(config)),
    }
}
