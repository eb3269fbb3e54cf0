//! KL-001: Core types — resources, output resources, deferred values, recipes.

use super::configuration::{GitAuth, Providers, RecipeConfig};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

// ============================================================================
// Manifest
// ============================================================================

/// Top-level kiln.yaml schema: one environment and the resources deployed into it.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct Manifest {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Environment name; scopes recipes and state
    pub environment: String,

    /// Owning application, if any
    #[serde(default)]
    pub application: Option<String>,

    /// Compute platform the environment targets
    pub runtime: EnvironmentCompute,

    /// Cloud provider scopes
    #[serde(default)]
    pub providers: Providers,

    /// Recipe execution settings (terraform providers, env, git auth)
    #[serde(default)]
    pub recipe_config: RecipeConfig,

    /// Environment-scoped recipe catalog
    #[serde(default)]
    pub recipes: Vec<Recipe>,

    /// User-declared resources
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Compute description of an environment. Tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EnvironmentCompute {
    Kubernetes {
        namespace: String,
        #[serde(default)]
        resource_id: Option<String>,
    },
    Aci {
        resource_group: String,
    },
}

impl EnvironmentCompute {
    /// Namespace (or resource group) workloads land in.
    pub fn namespace(&self) -> &str {
        match self {
            EnvironmentCompute::Kubernetes { namespace, .. } => namespace,
            EnvironmentCompute::Aci { resource_group } => resource_group,
        }
    }
}

// ============================================================================
// Resources
// ============================================================================

/// How a resource's backing infrastructure comes into being.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningMode {
    /// Delegated to a registered recipe
    #[default]
    Recipe,
    /// User supplies the backing resource or explicit values; a renderer builds the graph
    Manual,
}

impl fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningMode::Recipe => write!(f, "recipe"),
            ProvisioningMode::Manual => write!(f, "manual"),
        }
    }
}

/// Recipe selection for a recipe-mode resource.
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct RecipeRef {
    #[serde(default = "default_recipe_name")]
    pub name: String,

    /// Resource-level parameters; highest precedence in the merge
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

fn default_recipe_name() -> String {
    "default".to_string()
}

/// A user-declared resource.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct Resource {
    pub name: String,

    /// Resource type, e.g. `Applications.Datastores/redisCaches`
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default)]
    pub provisioning: ProvisioningMode,

    #[serde(default)]
    pub recipe: Option<RecipeRef>,

    /// Manual-mode properties (backing resource id, queue name, host, port, ...)
    #[serde(default)]
    pub properties: IndexMap<String, Value>,

    /// Manual-mode secret values
    #[serde(default)]
    pub secrets: IndexMap<String, Secret>,

    /// Per-git-host auth that overrides the environment's for this resource
    #[serde(default)]
    pub git_auth: IndexMap<String, GitAuth>,
}

impl Resource {
    /// Fully qualified id of this resource within an environment.
    pub fn id(&self, environment: &str) -> String {
        format!(
            "/planes/radius/local/resourceGroups/{}/providers/{}/{}",
            environment, self.resource_type, self.name
        )
    }

    /// String property lookup; empty strings count as absent.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

// ============================================================================
// Secrets and deferred values
// ============================================================================

/// Secret-bearing value. `Debug` never shows the contents.
#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Secret(Value);

impl Secret {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    /// Raw secret material. Callers must not log the result.
    pub fn expose(&self) -> &Value {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<redacted>)")
    }
}

/// A value known at render time, or a pointer into a not-yet-deployed object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueRef {
    Literal { value: Value },
    Reference { local_id: String, pointer: String },
}

impl ValueRef {
    /// Build a reference; rejects an empty LocalID or a malformed JSON pointer.
    pub fn reference(local_id: &str, pointer: &str) -> Result<Self, String> {
        if local_id.is_empty() {
            return Err("reference LocalID must not be empty".to_string());
        }
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(format!(
                "property pointer '{}' must be empty or start with '/'",
                pointer
            ));
        }
        Ok(ValueRef::Reference {
            local_id: local_id.to_string(),
            pointer: pointer.to_string(),
        })
    }

    /// Prefix a reference's LocalID (literals are untouched).
    pub fn rebase(&mut self, prefix: &str) {
        if let ValueRef::Reference { local_id, .. } = self {
            *local_id = format!("{}/{}", prefix, local_id);
        }
    }
}

/// Named non-secret output value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ComputedValueReference(ValueRef);

impl ComputedValueReference {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self(ValueRef::Literal {
            value: value.into(),
        })
    }

    pub fn reference(local_id: &str, pointer: &str) -> Result<Self, String> {
        ValueRef::reference(local_id, pointer).map(Self)
    }

    pub fn source(&self) -> &ValueRef {
        &self.0
    }

    pub fn rebase(&mut self, prefix: &str) {
        self.0.rebase(prefix);
    }
}

/// Named secret output value. Literal contents are never printed or serialized.
#[derive(Clone, PartialEq)]
pub struct SecretValueReference(ValueRef);

impl SecretValueReference {
    pub fn literal(secret: Secret) -> Self {
        Self(ValueRef::Literal { value: secret.0 })
    }

    pub fn reference(local_id: &str, pointer: &str) -> Result<Self, String> {
        ValueRef::reference(local_id, pointer).map(Self)
    }

    pub fn source(&self) -> &ValueRef {
        &self.0
    }

    pub fn rebase(&mut self, prefix: &str) {
        self.0.rebase(prefix);
    }
}

impl fmt::Debug for SecretValueReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ValueRef::Literal { .. } => write!(f, "SecretValueReference(<redacted>)"),
            ValueRef::Reference { local_id, pointer } => {
                write!(f, "SecretValueReference({}{})", local_id, pointer)
            }
        }
    }
}

impl Serialize for SecretValueReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.0 {
            ValueRef::Literal { .. } => {
                let mut s = serializer.serialize_struct("SecretValueReference", 2)?;
                s.serialize_field("kind", "literal")?;
                s.serialize_field("value", "<redacted>")?;
                s.end()
            }
            reference => reference.serialize(serializer),
        }
    }
}

// ============================================================================
// Output resources
// ============================================================================

/// Platform that owns an output resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Azure,
    Aws,
    Kubernetes,
    Radius,
}

impl Provider {
    /// Infer the owning platform from a resource id.
    pub fn from_resource_id(id: &str) -> Self {
        let lower = id.to_ascii_lowercase();
        if lower.starts_with("/subscriptions/") {
            Provider::Azure
        } else if lower.starts_with("/planes/aws/") {
            Provider::Aws
        } else if lower.starts_with("/planes/kubernetes/") {
            Provider::Kubernetes
        } else {
            Provider::Radius
        }
    }
}

/// Kind + provider of an output resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputResourceType {
    pub kind: String,
    pub provider: Provider,
}

/// Provider-specific identity of a backing object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceIdentity {
    Arm {
        id: String,
    },
    Kubernetes {
        api_version: String,
        kind: String,
        namespace: String,
        name: String,
    },
    Ucp {
        id: String,
    },
}

/// One node of the deployment graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputResource {
    /// Unique within one render's output
    pub local_id: String,
    pub resource_type: OutputResourceType,
    pub identity: ResourceIdentity,
    /// Whether this engine owns the object's lifecycle
    pub radius_managed: bool,
    /// LocalIDs that must be deployed first, in declaration order
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Desired body handed to the deployer
    #[serde(default)]
    pub resource: Value,
}

impl OutputResource {
    /// Prefix the LocalID and every dependency.
    pub fn rebase(&mut self, prefix: &str) {
        self.local_id = format!("{}/{}", prefix, self.local_id);
        for dep in &mut self.dependencies {
            *dep = format!("{}/{}", prefix, dep);
        }
    }
}

/// Uniform result of both provisioning strategies.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RendererOutput {
    pub resources: Vec<OutputResource>,
    pub computed_values: IndexMap<String, ComputedValueReference>,
    pub secret_values: IndexMap<String, SecretValueReference>,
}

impl RendererOutput {
    /// Namespace every LocalID (and references to them) under `prefix`.
    pub fn rebase(&mut self, prefix: &str) {
        for r in &mut self.resources {
            r.rebase(prefix);
        }
        for v in self.computed_values.values_mut() {
            v.rebase(prefix);
        }
        for v in self.secret_values.values_mut() {
            v.rebase(prefix);
        }
    }
}

// ============================================================================
// Recipes
// ============================================================================

/// Recipe execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Bicep,
    Terraform,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Bicep => write!(f, "bicep"),
            DriverKind::Terraform => write!(f, "terraform"),
        }
    }
}

/// Environment-scoped infrastructure-as-code template registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Recipe {
    pub name: String,
    pub resource_type: String,
    pub driver: DriverKind,

    /// Registry reference, module path, or `git::<url>`
    pub template_path: String,

    #[serde(default)]
    pub template_version: Option<String>,

    /// Environment-level default parameters
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,

    /// Pull the template over plain HTTP (bicep registries only)
    #[serde(default)]
    pub plain_http: bool,
}

/// Which template produced a recipe output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeStatus {
    pub template_kind: DriverKind,
    pub template_path: String,
    pub template_version: Option<String>,
}

/// Normalized result of one recipe execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeOutput {
    pub resources: Vec<String>,
    pub secrets: IndexMap<String, Secret>,
    pub values: IndexMap<String, Value>,
    pub status: RecipeStatus,
}

// ============================================================================
// Deployment state machine
// ============================================================================

/// Per-resource deployment progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Rendered,
    Graphed,
    Deploying,
    Executing,
    Resolved,
    Failed,
}

impl DeploymentState {
    /// Whether `self -> next` is a legal step.
    pub fn can_transition(self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        match (self, next) {
            (Resolved | Failed, _) => false,
            (_, Failed) => true,
            (Rendered, Graphed) | (Rendered, Executing) => true,
            (Graphed, Deploying) | (Graphed, Resolved) => true,
            (Deploying, Resolved) | (Executing, Resolved) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentState::Resolved | DeploymentState::Failed)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentState::Rendered => "rendered",
            DeploymentState::Graphed => "graphed",
            DeploymentState::Deploying => "deploying",
            DeploymentState::Executing => "executing",
            DeploymentState::Resolved => "resolved",
            DeploymentState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event written to the environment's JSONL log. Carries no secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    DeployStarted {
        environment: String,
        run_id: String,
        kiln_version: String,
    },
    ResourceStarted {
        environment: String,
        resource: String,
        mode: ProvisioningMode,
    },
    ResourceResolved {
        environment: String,
        resource: String,
        duration_seconds: f64,
        hash: String,
    },
    ResourceFailed {
        environment: String,
        resource: String,
        state: DeploymentState,
        error: String,
    },
    DeployCompleted {
        environment: String,
        run_id: String,
        resources_resolved: u32,
        resources_failed: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Tests
// ============================================================================
