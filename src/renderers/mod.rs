//! KL-010: Renderers — manual-mode resources to output graphs.
//!
//! Each renderer is a pure function of the resource and options. All
//! validation happens before any output resource is constructed.

pub mod mongo;
pub mod queue;
pub mod redis;
pub mod sql;

use crate::core::error::ValidationError;
use crate::core::resource_id::ResourceId;
use crate::core::types::{
    ComputedValueReference, EnvironmentCompute, OutputResource, OutputResourceType, Provider,
    ProvisioningMode, Resource, ResourceIdentity, RendererOutput, SecretValueReference,
};
use rustc_hash::FxHashMap;
use serde_json::Value;

/// Inputs shared by every render in one deployment.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions<'a> {
    pub environment: &'a str,
    pub application: Option<&'a str>,
    pub runtime: &'a EnvironmentCompute,
}

/// Per-kind strategy turning a manual-mode resource into output resources.
pub trait Renderer: Send + Sync {
    /// Resource type handled, e.g. `Applications.Datastores/redisCaches`.
    fn kind(&self) -> &'static str;

    fn render(
        &self,
        resource: &Resource,
        options: &RenderOptions<'_>,
    ) -> Result<RendererOutput, ValidationError>;
}

/// Kind-keyed renderer table, built once at startup.
pub struct RendererRegistry {
    renderers: FxHashMap<String, Box<dyn Renderer>>,
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RendererRegistry {
    pub fn empty() -> Self {
        Self {
            renderers: FxHashMap::default(),
        }
    }

    /// Registry with every built-in renderer.
    pub fn builtin() -> Self {
        let mut reg = Self::empty();
        let builtins: Vec<Box<dyn Renderer>> = vec![
            Box::new(queue::QueueRenderer),
            Box::new(mongo::MongoRenderer),
            Box::new(redis::RedisRenderer),
            Box::new(sql::SqlRenderer),
        ];
        for r in builtins {
            reg.renderers.insert(r.kind().to_ascii_lowercase(), r);
        }
        reg
    }

    /// Add a renderer. A kind may only be registered once.
    pub fn register(&mut self, renderer: Box<dyn Renderer>) -> Result<(), String> {
        let key = renderer.kind().to_ascii_lowercase();
        if self.renderers.contains_key(&key) {
            return Err(format!(
                "renderer for '{}' is already registered",
                renderer.kind()
            ));
        }
        self.renderers.insert(key, renderer);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&dyn Renderer> {
        self.renderers
            .get(&kind.to_ascii_lowercase())
            .map(|b| b.as_ref())
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.renderers.values().map(|r| r.kind()).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Dispatch a manual-mode resource to its renderer.
    pub fn render(
        &self,
        resource: &Resource,
        options: &RenderOptions<'_>,
    ) -> Result<RendererOutput, ValidationError> {
        if resource.provisioning != ProvisioningMode::Manual {
            return Err(ValidationError::new(
                &resource.name,
                "only resources with resourceProvisioning set to manual can be rendered",
            ));
        }
        let renderer = self.get(&resource.resource_type).ok_or_else(|| {
            ValidationError::new(
                &resource.name,
                format!(
                    "no renderer registered for resource type '{}'",
                    resource.resource_type
                ),
            )
        })?;
        renderer.render(resource, options)
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Required string property.
pub(crate) fn require_str<'a>(
    resource: &'a Resource,
    key: &str,
    message: &str,
) -> Result<&'a str, ValidationError> {
    resource
        .property_str(key)
        .ok_or_else(|| ValidationError::new(&resource.name, message))
}

/// Optional `resource` property that must parse as an id of `expected_type`.
pub(crate) fn typed_resource_id(
    resource: &Resource,
    expected_type: &str,
    message: &str,
) -> Result<Option<ResourceId>, ValidationError> {
    let Some(raw) = resource.property_str("resource") else {
        return Ok(None);
    };
    match ResourceId::parse(raw) {
        Ok(id) if id.is_type(expected_type) => Ok(Some(id)),
        _ => Err(ValidationError::new(&resource.name, message)),
    }
}

/// Computed-value reference; an invalid pointer is a validation failure.
pub(crate) fn computed_ref(
    resource: &Resource,
    local_id: &str,
    pointer: &str,
) -> Result<ComputedValueReference, ValidationError> {
    ComputedValueReference::reference(local_id, pointer)
        .map_err(|e| ValidationError::new(&resource.name, e))
}

pub(crate) fn secret_ref(
    resource: &Resource,
    local_id: &str,
    pointer: &str,
) -> Result<SecretValueReference, ValidationError> {
    SecretValueReference::reference(local_id, pointer)
        .map_err(|e| ValidationError::new(&resource.name, e))
}

/// Azure output resource identified by an ARM id.
pub(crate) fn azure_resource(
    local_id: &str,
    id: &ResourceId,
    radius_managed: bool,
    dependencies: &[&str],
    body: Value,
) -> OutputResource {
    OutputResource {
        local_id: local_id.to_string(),
        resource_type: OutputResourceType {
            kind: id.fully_qualified_type(),
            provider: Provider::Azure,
        },
        identity: ResourceIdentity::Arm {
            id: id.as_str().to_string(),
        },
        radius_managed,
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        resource: body,
    }
}

/// Copy user-supplied secrets in as literals, overriding any reference.
pub(crate) fn apply_literal_secrets(resource: &Resource, out: &mut RendererOutput) {
    for (name, secret) in &resource.secrets {
        out.secret_values
            .insert(name.clone(), SecretValueReference::literal(secret.clone()));
    }
}

/// Values-only rendering: explicit connection values, no output resources.
pub(crate) fn render_values(
    resource: &Resource,
    required: &[&str],
    message: &str,
) -> Result<RendererOutput, ValidationError> {
    for key in required {
        if !resource.properties.contains_key(*key) {
            return Err(ValidationError::new(&resource.name, message));
        }
    }
    let mut out = RendererOutput::default();
    for (k, v) in &resource.properties {
        out.computed_values
            .insert(k.clone(), ComputedValueReference::literal(v.clone()));
    }
    apply_literal_secrets(resource, &mut out);
    Ok(out)
}
