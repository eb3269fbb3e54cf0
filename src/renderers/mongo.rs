//! KL-012: Mongo database renderer (Cosmos DB backed, or explicit values).

use super::{
    apply_literal_secrets, azure_resource, render_values, secret_ref, typed_resource_id,
    RenderOptions, Renderer,
};
use crate::core::error::ValidationError;
use crate::core::types::{ComputedValueReference, RendererOutput, Resource};

pub const ACCOUNT_LOCAL_ID: &str = "cosmos-account";
pub const DATABASE_LOCAL_ID: &str = "cosmos-mongo-database";

const DATABASE_TYPE: &str = "Microsoft.DocumentDB/databaseAccounts/mongodbDatabases";

pub struct MongoRenderer;

impl Renderer for MongoRenderer {
    fn kind(&self) -> &'static str {
        "Applications.Datastores/mongoDatabases"
    }

    fn render(
        &self,
        resource: &Resource,
        _options: &RenderOptions<'_>,
    ) -> Result<RendererOutput, ValidationError> {
        let Some(database) = typed_resource_id(
            resource,
            DATABASE_TYPE,
            "the 'resource' field must refer to an Azure CosmosDB Mongo Database resource",
        )?
        else {
            return render_values(
                resource,
                &["host", "port"],
                "host and port must be specified when resourceProvisioning is set to manual",
            );
        };
        let account = database.parent().ok_or_else(|| {
            ValidationError::new(&resource.name, "cannot derive the CosmosDB account id")
        })?;
        let connection = secret_ref(resource, ACCOUNT_LOCAL_ID, "/connectionStrings/0/connectionString")?;

        let mut out = RendererOutput::default();
        out.resources.push(azure_resource(
            ACCOUNT_LOCAL_ID,
            &account,
            false,
            &[],
            serde_json::Value::Null,
        ));
        out.resources.push(azure_resource(
            DATABASE_LOCAL_ID,
            &database,
            false,
            &[ACCOUNT_LOCAL_ID],
            serde_json::Value::Null,
        ));
        out.computed_values.insert(
            "database".into(),
            ComputedValueReference::literal(database.name()),
        );
        out.secret_values.insert("connectionString".into(), connection);
        apply_literal_secrets(resource, &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::core::types::ValueRef;

    const DB: &str = "/subscriptions/s/resourceGroups/g/providers/Microsoft.DocumentDB/databaseAccounts/acct/mongodbDatabases/orders";

    fn render(yaml: &str) -> Result<RendererOutput, ValidationError> {
        let (env, runtime) = options();
        let opts = RenderOptions {
            environment: &env,
            application: None,
            runtime: &runtime,
        };
        MongoRenderer.render(&manual(yaml), &opts)
    }

    #[test]
    fn test_kl012_render_cosmos() {
        let out = render(&format!("name: m\ntype: t\nproperties:\n  resource: {}", DB)).unwrap();
        assert_eq!(out.resources.len(), 2);
        assert_eq!(
            out.resources[0].identity,
            crate::core::types::ResourceIdentity::Arm {
                id: "/subscriptions/s/resourceGroups/g/providers/Microsoft.DocumentDB/databaseAccounts/acct".into()
            }
        );
        assert_eq!(out.resources[1].dependencies, vec![ACCOUNT_LOCAL_ID]);
        assert_eq!(
            out.computed_values["database"].source(),
            &ValueRef::Literal {
                value: "orders".into()
            }
        );
        assert_eq!(
            out.secret_values["connectionString"].source(),
            &ValueRef::Reference {
                local_id: ACCOUNT_LOCAL_ID.into(),
                pointer: "/connectionStrings/0/connectionString".into()
            }
        );
    }

    #[test]
    fn test_kl012_wrong_type() {
        let err = render(
            "name: m\ntype: t\nproperties:\n  resource: /subscriptions/s/resourceGroups/g/providers/Microsoft.DocumentDB/databaseAccounts/acct",
        )
        .unwrap_err();
        assert_eq!(
            err.message,
            "the 'resource' field must refer to an Azure CosmosDB Mongo Database resource"
        );
    }

    #[test]
    fn test_kl012_values_mode() {
        let out = render(
            "name: m\ntype: t\nproperties:\n  host: mongo.local\n  port: 27017\n  database: orders\nsecrets:\n  connectionString: mongodb://u:p@mongo.local",
        )
        .unwrap();
        assert!(out.resources.is_empty());
        assert_eq!(out.computed_values.len(), 3);
        assert_eq!(
            out.computed_values["port"].source(),
            &ValueRef::Literal {
                value: 27017.into()
            }
        );
        assert!(matches!(
            out.secret_values["connectionString"].source(),
            ValueRef::Literal { .. }
        ));
    }

    #[test]
    fn test_kl012_values_mode_requires_host_and_port() {
        let err = render("name: m\ntype: t\nproperties:\n  host: mongo.local").unwrap_err();
        assert!(err.message.starts_with("host and port must be specified"));
    }
}
