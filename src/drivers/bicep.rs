//! KL-019: Bicep driver — registry-hosted templates deployed through a
//! deployment client.

use super::process::bounded;
use super::{
    driver_error, parse_result, recipe_status, Driver, ExecutionContext, RecipeContext,
    ResourceMetadata,
};
use crate::core::configuration::{merge_parameters, Configuration};
use crate::core::error::DriverExecutionError;
use crate::core::types::{DriverKind, Recipe, RecipeOutput};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// One template deployment at a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRequest {
    pub name: String,
    pub scope: String,
    pub template: Value,
    /// Parameters already wrapped as `{"value": ...}`
    pub parameters: Map<String, Value>,
}

/// Transport to the platform's deployment engine.
#[async_trait]
pub trait DeploymentClient: Send + Sync {
    /// Fetch a compiled template from its registry reference.
    async fn fetch_template(&self, template_path: &str, plain_http: bool) -> Result<Value, String>;

    /// Deploy and return the deployment's `outputs` object.
    async fn deploy(&self, request: &DeploymentRequest) -> Result<Value, String>;

    async fn delete_resource(&self, id: &str) -> Result<(), String>;
}

pub struct BicepDriver {
    client: Arc<dyn DeploymentClient>,
}

impl BicepDriver {
    pub fn new(client: Arc<dyn DeploymentClient>) -> Self {
        Self { client }
    }
}

/// Parameter defaults declared by a template.
fn template_defaults(template: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(params) = template.get("parameters").and_then(Value::as_object) {
        for (name, decl) in params {
            if let Some(default) = decl.get("defaultValue") {
                out.insert(name.clone(), default.clone());
            }
        }
    }
    out
}

/// Merge parameters, wrap each as `{"value": v}`, and add `context` when
/// the template declares it.
pub fn build_parameters(
    template: &Value,
    recipe: &Recipe,
    metadata: &ResourceMetadata,
    context: &RecipeContext,
) -> Result<Map<String, Value>, String> {
    let merged = merge_parameters(
        &template_defaults(template),
        &recipe.parameters,
        &metadata.parameters,
    );
    let mut out: Map<String, Value> = merged
        .into_iter()
        .map(|(k, v)| (k, json!({ "value": v })))
        .collect();
    let declares_context = template
        .get("parameters")
        .and_then(|p| p.get("context"))
        .is_some();
    if declares_context {
        let ctx = serde_json::to_value(context)
            .map_err(|e| format!("cannot serialize recipe context: {}", e))?;
        out.insert("context".to_string(), json!({ "value": ctx }));
    }
    Ok(out)
}

/// Deterministic deployment name for a resource.
fn deployment_name(metadata: &ResourceMetadata) -> String {
    let hash = blake3::hash(metadata.id.to_ascii_lowercase().as_bytes()).to_hex();
    format!("recipe-{}", &hash[..16])
}

fn deployment_scope(metadata: &ResourceMetadata, config: &Configuration) -> String {
    match &config.providers.azure {
        Some(azure) => azure.scope.clone(),
        None => format!("/planes/radius/local/resourceGroups/{}", metadata.environment),
    }
}

#[async_trait]
impl Driver for BicepDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Bicep
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        recipe: &Recipe,
        metadata: &ResourceMetadata,
        config: &Configuration,
    ) -> Result<RecipeOutput, DriverExecutionError> {
        let fail = |msg: String| driver_error(recipe, config, msg);
        tracing::info!(recipe = %recipe.name, template = %recipe.template_path, resource = %metadata.name, "executing bicep recipe");

        let template = bounded(
            ctx,
            self.client
                .fetch_template(&recipe.template_path, recipe.plain_http),
        )
        .await
        .map_err(|e| fail(e.to_string()))?
        .map_err(|e| fail(format!("failed to fetch template: {}", e)))?;

        let context = RecipeContext::new(metadata, config);
        let request = DeploymentRequest {
            name: deployment_name(metadata),
            scope: deployment_scope(metadata, config),
            parameters: build_parameters(&template, recipe, metadata, &context).map_err(fail)?,
            template,
        };

        let outputs = bounded(ctx, self.client.deploy(&request))
            .await
            .map_err(|e| fail(e.to_string()))?
            .map_err(|e| fail(format!("deployment failed: {}", e)))?;

        let result = outputs.get("result").and_then(|r| r.get("value"));
        let parsed = parse_result(result).map_err(fail)?;
        tracing::debug!(resource = %metadata.name, resources = parsed.resources.len(), values = parsed.values.len(), secrets = parsed.secrets.len(), "bicep recipe output");

        Ok(RecipeOutput {
            resources: parsed.resources,
            secrets: parsed.secrets,
            values: parsed.values,
            status: recipe_status(recipe),
        })
    }

    async fn delete(
        &self,
        ctx: &ExecutionContext,
        recipe: &Recipe,
        metadata: &ResourceMetadata,
        config: &Configuration,
    ) -> Result<(), DriverExecutionError> {
        for id in metadata.deployed_resources.iter().rev() {
            tracing::info!(resource = %metadata.name, %id, "deleting recipe resource");
            bounded(ctx, self.client.delete_resource(id))
                .await
                .map_err(|e| driver_error(recipe, config, e.to_string()))?
                .map_err(|e| driver_error(recipe, config, format!("failed to delete {}: {}", id, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeClient {
        template: Value,
        outputs: Value,
        fail_deploy: Option<String>,
        hang: bool,
        requests: Mutex<Vec<DeploymentRequest>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeploymentClient for FakeClient {
        async fn fetch_template(&self, _path: &str, _plain_http: bool) -> Result<Value, String> {
            Ok(self.template.clone())
        }

        async fn deploy(&self, request: &DeploymentRequest) -> Result<Value, String> {
            self.requests.lock().unwrap().push(request.clone());
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            match &self.fail_deploy {
                Some(msg) => Err(msg.clone()),
                None => Ok(self.outputs.clone()),
            }
        }

        async fn delete_resource(&self, id: &str) -> Result<(), String> {
            self.deleted.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(CancellationToken::new(), Duration::from_secs(5))
    }

    fn template_with_context() -> Value {
        json!({"parameters": {
            "context": {"type": "object"},
            "sku": {"type": "string", "defaultValue": "Basic"},
            "tags": {"type": "object", "defaultValue": {"team": "core", "tier": "dev"}}
        }})
    }

    #[tokio::test]
    async fn test_kl019_execute_parses_result() {
        let client = Arc::new(FakeClient {
            template: template_with_context(),
            outputs: json!({"result": {"value": {
                "values": {"host": "cache.redis.net", "port": 6380},
                "secrets": {"password": "pw"},
                "resources": ["/subscriptions/s/resourceGroups/g/providers/Microsoft.Cache/redis/c"]
            }}}),
            ..Default::default()
        });
        let driver = BicepDriver::new(client.clone());
        let mut r = recipe(DriverKind::Bicep, "ghcr.io/recipes/redis:1.0");
        r.parameters.insert("tags".into(), json!({"tier": "prod"}));
        let mut md = metadata();
        md.parameters.insert("sku".into(), json!("Premium"));

        let out = driver.execute(&ctx(), &r, &md, &config()).await.unwrap();
        assert_eq!(out.values["port"], json!(6380));
        assert_eq!(out.secrets["password"].as_str(), Some("pw"));
        assert_eq!(out.resources.len(), 1);
        assert_eq!(out.status.template_kind, DriverKind::Bicep);

        let reqs = client.requests.lock().unwrap();
        let params = &reqs[0].parameters;
        assert_eq!(params["sku"], json!({"value": "Premium"}));
        assert_eq!(
            params["tags"],
            json!({"value": {"team": "core", "tier": "prod"}})
        );
        assert_eq!(
            params["context"]["value"]["resource"]["name"],
            json!("cache")
        );
        assert_eq!(reqs[0].scope, "/planes/radius/local/resourceGroups/dev");
        assert!(reqs[0].name.starts_with("recipe-"));
    }

    #[tokio::test]
    async fn test_kl019_no_context_when_undeclared() {
        let client = Arc::new(FakeClient {
            template: json!({"parameters": {"sku": {"type": "string"}}}),
            outputs: json!({}),
            ..Default::default()
        });
        let driver = BicepDriver::new(client.clone());
        let out = driver
            .execute(&ctx(), &recipe(DriverKind::Bicep, "r:1"), &metadata(), &config())
            .await
            .unwrap();
        assert!(out.values.is_empty());
        assert!(out.secrets.is_empty());
        let reqs = client.requests.lock().unwrap();
        assert!(!reqs[0].parameters.contains_key("context"));
    }

    #[tokio::test]
    async fn test_kl019_unknown_result_field_fails() {
        let client = Arc::new(FakeClient {
            template: json!({}),
            outputs: json!({"result": {"value": {"values": {}, "extra": 1}}}),
            ..Default::default()
        });
        let err = BicepDriver::new(client)
            .execute(&ctx(), &recipe(DriverKind::Bicep, "r:1"), &metadata(), &config())
            .await
            .unwrap_err();
        assert_eq!(err.recipe, "default");
        assert!(err.message.contains("extra"));
    }

    #[tokio::test]
    async fn test_kl019_deploy_failure_wrapped() {
        let client = Arc::new(FakeClient {
            template: json!({}),
            fail_deploy: Some("InvalidTemplate".into()),
            ..Default::default()
        });
        let err = BicepDriver::new(client)
            .execute(&ctx(), &recipe(DriverKind::Bicep, "r:1"), &metadata(), &config())
            .await
            .unwrap_err();
        assert_eq!(err.template, "r:1");
        assert!(err.message.contains("InvalidTemplate"));
    }

    #[tokio::test]
    async fn test_kl019_cancellation_fails_execution() {
        let client = Arc::new(FakeClient {
            template: json!({}),
            hang: true,
            ..Default::default()
        });
        let c = ctx();
        let token = c.cancel.clone();
        let driver = BicepDriver::new(client);
        let r = recipe(DriverKind::Bicep, "r:1");
        let md = metadata();
        let cfg = config();
        let (res, _) = tokio::join!(driver.execute(&c, &r, &md, &cfg), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let err = res.unwrap_err();
        assert!(err.message.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_kl019_delete_reverse_order() {
        let client = Arc::new(FakeClient::default());
        let driver = BicepDriver::new(client.clone());
        let mut md = metadata();
        md.deployed_resources = vec!["/a".into(), "/b".into()];
        driver
            .delete(&ctx(), &recipe(DriverKind::Bicep, "r:1"), &md, &config())
            .await
            .unwrap();
        assert_eq!(*client.deleted.lock().unwrap(), vec!["/b", "/a"]);
    }

    #[test]
    fn test_kl019_build_parameters_with_context() {
        let cfg = config();
        let md = metadata();
        let ctx = RecipeContext::new(&md, &cfg);
        let params = build_parameters(
            &template_with_context(),
            &recipe(DriverKind::Bicep, "r:1"),
            &md,
            &ctx,
        )
        .unwrap();
        assert_eq!(params["sku"], json!({"value": "Basic"}));
        assert_eq!(
            params["context"]["value"],
            serde_json::to_value(&ctx).unwrap()
        );
    }

    #[test]
    fn test_kl019_deployment_name_deterministic() {
        let a = deployment_name(&metadata());
        let b = deployment_name(&metadata());
        assert_eq!(a, b);
        assert_eq!(a.len(), "recipe-".len() + 16);
    }
}
