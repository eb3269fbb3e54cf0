//! KL-014: SQL database renderer.

use super::{
    apply_literal_secrets, azure_resource, computed_ref, render_values, typed_resource_id,
    RenderOptions, Renderer,
};
use crate::core::error::ValidationError;
use crate::core::types::{ComputedValueReference, RendererOutput, Resource};

pub const SERVER_LOCAL_ID: &str = "sql-server";
pub const DATABASE_LOCAL_ID: &str = "sql-database";

pub struct SqlRenderer;

impl Renderer for SqlRenderer {
    fn kind(&self) -> &'static str {
        "Applications.Datastores/sqlDatabases"
    }

    fn render(
        &self,
        resource: &Resource,
        _options: &RenderOptions<'_>,
    ) -> Result<RendererOutput, ValidationError> {
        let Some(database) = typed_resource_id(
            resource,
            "Microsoft.Sql/servers/databases",
            "the 'resource' field must refer to an Azure SQL Database",
        )?
        else {
            return render_values(
                resource,
                &["server", "database"],
                "server and database must be specified when resourceProvisioning is set to manual",
            );
        };
        let server = database.parent().ok_or_else(|| {
            ValidationError::new(&resource.name, "cannot derive the SQL server id")
        })?;
        let fqdn = computed_ref(resource, SERVER_LOCAL_ID, "/properties/fullyQualifiedDomainName")?;

        let mut out = RendererOutput::default();
        out.resources.push(azure_resource(
            SERVER_LOCAL_ID,
            &server,
            false,
            &[],
            serde_json::Value::Null,
        ));
        out.resources.push(azure_resource(
            DATABASE_LOCAL_ID,
            &database,
            false,
            &[SERVER_LOCAL_ID],
            serde_json::Value::Null,
        ));
        out.computed_values.insert("server".into(), fqdn);
        out.computed_values.insert(
            "database".into(),
            ComputedValueReference::literal(database.name()),
        );
        apply_literal_secrets(resource, &mut out);
        Ok(out)
    }
}
