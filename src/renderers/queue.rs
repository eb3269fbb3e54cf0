//! KL-011: Service Bus queue renderer.

use super::{
    apply_literal_secrets, azure_resource, computed_ref, require_str, secret_ref,
    typed_resource_id, RenderOptions, Renderer,
};
use crate::core::error::ValidationError;
use crate::core::resource_id::ResourceId;
use crate::core::types::{ComputedValueReference, RendererOutput, Resource};
use serde_json::json;

pub const NAMESPACE_LOCAL_ID: &str = "servicebus-namespace";
pub const QUEUE_LOCAL_ID: &str = "servicebus-queue";

const NAMESPACE_TYPE: &str = "Microsoft.ServiceBus/namespaces";

pub struct QueueRenderer;

impl Renderer for QueueRenderer {
    fn kind(&self) -> &'static str {
        "Applications.Messaging/serviceBusQueues"
    }

    fn render(
        &self,
        resource: &Resource,
        _options: &RenderOptions<'_>,
    ) -> Result<RendererOutput, ValidationError> {
        let queue = require_str(resource, "queue", "queue name must be specified")?;
        let namespace = typed_resource_id(
            resource,
            NAMESPACE_TYPE,
            "the 'resource' field must refer to a ServiceBus Namespace",
        )?
        .ok_or_else(|| {
            ValidationError::new(
                &resource.name,
                "resource must be specified when resourceProvisioning is set to manual",
            )
        })?;
        let queue_id = ResourceId::parse(&format!("{}/queues/{}", namespace, queue))
            .map_err(|e| ValidationError::new(&resource.name, e))?;

        let endpoint = computed_ref(resource, NAMESPACE_LOCAL_ID, "/properties/serviceBusEndpoint")?;
        let connection = secret_ref(resource, NAMESPACE_LOCAL_ID, "/primaryConnectionString")?;

        let mut out = RendererOutput::default();
        out.resources.push(azure_resource(
            NAMESPACE_LOCAL_ID,
            &namespace,
            false,
            &[],
            serde_json::Value::Null,
        ));
        out.resources.push(azure_resource(
            QUEUE_LOCAL_ID,
            &queue_id,
            true,
            &[NAMESPACE_LOCAL_ID],
            json!({ "name": queue, "properties": {} }),
        ));
        out.computed_values.insert(
            "namespace".into(),
            ComputedValueReference::literal(namespace.name()),
        );
        out.computed_values
            .insert("queue".into(), ComputedValueReference::literal(queue));
        out.computed_values.insert("namespaceEndpoint".into(), endpoint);
        out.secret_values.insert("connectionString".into(), connection);
        apply_literal_secrets(resource, &mut out);
        Ok(out)
    }
}
