//! KL-013: Redis cache renderer.

use super::{
    apply_literal_secrets, azure_resource, computed_ref, render_values, secret_ref,
    typed_resource_id, RenderOptions, Renderer,
};
use crate::core::error::ValidationError;
use crate::core::types::{ComputedValueReference, RendererOutput, Resource};

pub const REDIS_LOCAL_ID: &str = "redis-cache";

pub struct RedisRenderer;

impl Renderer for RedisRenderer {
    fn kind(&self) -> &'static str {
        "Applications.Datastores/redisCaches"
    }

    fn render(
        &self,
        resource: &Resource,
        _options: &RenderOptions<'_>,
    ) -> Result<RendererOutput, ValidationError> {
        let Some(cache) = typed_resource_id(
            resource,
            "Microsoft.Cache/redis",
            "the 'resource' field must refer to an Azure Redis Cache",
        )?
        else {
            return render_values(
                resource,
                &["host", "port"],
                "host and port must be specified when resourceProvisioning is set to manual",
            );
        };

        let host = computed_ref(resource, REDIS_LOCAL_ID, "/properties/hostName")?;
        let port = computed_ref(resource, REDIS_LOCAL_ID, "/properties/sslPort")?;
        let password = secret_ref(resource, REDIS_LOCAL_ID, "/primaryKey")?;
        let connection = secret_ref(resource, REDIS_LOCAL_ID, "/primaryConnectionString")?;

        let mut out = RendererOutput::default();
        out.resources.push(azure_resource(
            REDIS_LOCAL_ID,
            &cache,
            false,
            &[],
            serde_json::Value::Null,
        ));
        out.computed_values.insert("host".into(), host);
        out.computed_values.insert("port".into(), port);
        out.computed_values
            .insert("username".into(), ComputedValueReference::literal(""));
        out.secret_values.insert("password".into(), password);
        out.secret_values.insert("connectionString".into(), connection);
        apply_literal_secrets(resource, &mut out);
        Ok(out)
    }
}
