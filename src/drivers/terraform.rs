//! KL-021: Terraform driver — generated root module, private git sources,
//! isolated working directories.
//!
//! Each execution gets a fresh directory under the driver root, named with
//! the resource's workdir prefix, and removed when the execution ends.
//! State outlives the directory: the root module uses a `local` backend at
//! `<root>/state/<prefix>.tfstate`, so re-applies and destroys see what the
//! last apply left.

use super::process::{run, ExecOutput};
use super::{
    driver_error, parse_result, recipe_status, union_resources, Driver, ExecutionContext,
    RecipeContext, ResourceMetadata,
};
use crate::core::configuration::{merge_parameters, Configuration};
use crate::core::error::DriverExecutionError;
use crate::core::gitsource;
use crate::core::types::{DriverKind, Recipe, RecipeOutput};
use crate::installer::{ExecutableLocator, ToolKind};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::process::Command;

pub const MAIN_CONFIG: &str = "main.tf.json";
const RESULT_OUTPUT: &str = "result";
const STATE_DIR: &str = "state";

pub struct TerraformDriver {
    locator: Arc<dyn ExecutableLocator>,
    root: PathBuf,
    version: Option<String>,
}

impl TerraformDriver {
    pub fn new(locator: Arc<dyn ExecutableLocator>, root: impl Into<PathBuf>) -> Self {
        // Terraform runs inside the workdir, so the backend path must be absolute.
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self {
            locator,
            root,
            version: None,
        }
    }

    /// Backend state file for a resource. Stable across executions.
    pub fn state_path(&self, metadata: &ResourceMetadata) -> PathBuf {
        let prefix = gitsource::workdir_prefix(
            &metadata.environment,
            metadata.application.as_deref(),
            &metadata.name,
        );
        self.root
            .join(STATE_DIR)
            .join(format!("{}.tfstate", prefix.trim_end_matches('-')))
    }

    /// Pin the terraform version requested from the locator.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Terraform identifier for a recipe's module block.
pub fn module_name(recipe_name: &str) -> String {
    let mut name: String = recipe_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        name.insert_str(0, "m_");
    }
    name
}

/// What a downloaded module declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleInspection {
    pub declares_context: bool,
    pub declares_result: bool,
}

fn context_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?m)^\s*variable\s+"context"\s*\{"#).expect("static regex"))
}

fn result_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?m)^\s*output\s+"result"\s*\{"#).expect("static regex"))
}

/// Scan a module directory's `.tf` and `.tf.json` files.
pub fn inspect_module(dir: &Path) -> std::io::Result<ModuleInspection> {
    let mut found = ModuleInspection::default();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.ends_with(".tf") {
            let text = std::fs::read_to_string(&path)?;
            found.declares_context |= context_re().is_match(&text);
            found.declares_result |= result_re().is_match(&text);
        } else if name.ends_with(".tf.json") {
            let text = std::fs::read_to_string(&path)?;
            if let Ok(v) = serde_json::from_str::<Value>(&text) {
                found.declares_context |= v.pointer("/variable/context").is_some();
                found.declares_result |= v.pointer("/output/result").is_some();
            }
        }
    }
    Ok(found)
}

/// Locate a module's download directory via `.terraform/modules/modules.json`.
pub fn module_dir(workdir: &Path, module: &str) -> Option<PathBuf> {
    let manifest = workdir.join(".terraform/modules/modules.json");
    let text = std::fs::read_to_string(manifest).ok()?;
    let v: Value = serde_json::from_str(&text).ok()?;
    v.get("Modules")?
        .as_array()?
        .iter()
        .find(|m| m.get("Key").and_then(Value::as_str) == Some(module))
        .and_then(|m| m.get("Dir").and_then(Value::as_str))
        .map(|d| workdir.join(d))
}

/// Provider blocks: configured ones verbatim, plus `azurerm` derived from
/// the Azure scope when not configured explicitly.
fn provider_blocks(config: &Configuration) -> Map<String, Value> {
    let mut providers = Map::new();
    for (name, blocks) in &config.recipe_config.terraform.providers {
        providers.insert(name.clone(), Value::Array(blocks.clone()));
    }
    if let Some(azure) = &config.providers.azure {
        if !providers.contains_key("azurerm") {
            let sub = crate::core::resource_id::ResourceId::parse(&azure.scope)
                .ok()
                .and_then(|id| id.scope_value("subscriptions").map(str::to_string));
            let mut block = json!({ "features": {} });
            if let Some(sub) = sub {
                block["subscription_id"] = json!(sub);
            }
            providers.insert("azurerm".into(), json!([block]));
        }
    }
    providers
}

/// Generate the root module as JSON. `context` is the serialized
/// [`RecipeContext`], passed only when the module declares it.
pub fn generate_config(
    recipe: &Recipe,
    params: &Map<String, Value>,
    context: Option<&Value>,
    with_result: bool,
    state_path: &Path,
    config: &Configuration,
) -> Value {
    let name = module_name(&recipe.name);
    let mut module = Map::new();
    module.insert("source".into(), json!(recipe.template_path));
    if let Some(v) = &recipe.template_version {
        module.insert("version".into(), json!(v));
    }
    for (k, v) in params {
        module.insert(k.clone(), v.clone());
    }
    if let Some(ctx) = context {
        module.insert("context".into(), ctx.clone());
    }

    let mut root = json!({
        "terraform": {
            "backend": { "local": { "path": state_path.to_string_lossy() } }
        },
        "module": { name.clone(): Value::Object(module) }
    });
    let providers = provider_blocks(config);
    if !providers.is_empty() {
        root["provider"] = Value::Object(providers);
    }
    if with_result {
        root["output"] = json!({
            RESULT_OUTPUT: {
                "value": format!("${{module.{}.result}}", name),
                "sensitive": true
            }
        });
    }
    root
}

/// Write the root module with owner-only permissions.
pub fn write_config(dir: &Path, config: &Value) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(config).map_err(std::io::Error::other)?;
    write_private(&dir.join(MAIN_CONFIG), &body)
}

fn write_private(path: &Path, body: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path)?;
    f.write_all(body)
}

/// Collect resource ids recorded in `terraform show -json` state.
pub fn state_resource_ids(state: &Value) -> Vec<String> {
    fn walk(module: &Value, out: &mut Vec<String>) {
        if let Some(resources) = module.get("resources").and_then(Value::as_array) {
            for r in resources {
                if let Some(id) = r.pointer("/values/id").and_then(Value::as_str) {
                    if id.starts_with('/') {
                        out.push(id.to_string());
                    }
                }
            }
        }
        if let Some(children) = module.get("child_modules").and_then(Value::as_array) {
            for c in children {
                walk(c, out);
            }
        }
    }
    let mut out = Vec::new();
    if let Some(root) = state.pointer("/values/root_module") {
        walk(root, &mut out);
    }
    out
}

/// Build a recipe output from `terraform show -json` state.
pub fn parse_state(recipe: &Recipe, state: &Value) -> Result<RecipeOutput, String> {
    let result = state.pointer("/values/outputs/result/value");
    let parsed = parse_result(result)?;
    let from_state = state_resource_ids(state);
    Ok(RecipeOutput {
        resources: union_resources(&[&parsed.resources, &from_state]),
        secrets: parsed.secrets,
        values: parsed.values,
        status: recipe_status(recipe),
    })
}

/// Files and environment for private git sources. Returns env vars to set.
pub fn prepare_git_auth(
    dir: &Path,
    recipe: &Recipe,
    config: &Configuration,
) -> Result<Vec<(String, String)>, String> {
    let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
    if !gitsource::is_git_source(&recipe.template_path) {
        return Ok(env);
    }
    let source = gitsource::resolve(&recipe.template_path)?;
    let Some(auth) = gitsource::auth_for(config, &source.hostname) else {
        return Ok(env);
    };
    let io = |e: std::io::Error| format!("cannot write git auth files: {}", e);

    if let Some(token) = auth.token.as_ref().and_then(|t| t.as_str()) {
        let gitconfig = dir.join(".gitconfig");
        write_private(
            &gitconfig,
            gitsource::gitconfig_contents(&source.hostname, token).as_bytes(),
        )
        .map_err(io)?;
        let rc = dir.join(".terraformrc");
        write_private(
            &rc,
            gitsource::terraformrc_contents(&[(&source.hostname, token)]).as_bytes(),
        )
        .map_err(io)?;
        env.push((
            "GIT_CONFIG_GLOBAL".into(),
            gitconfig.to_string_lossy().to_string(),
        ));
        env.push(("TF_CLI_CONFIG_FILE".into(), rc.to_string_lossy().to_string()));
        env.push((gitsource::tf_token_env_var(&source.hostname), token.to_string()));
    }
    if let Some(ca) = &auth.ca_bundle {
        env.push(("GIT_SSL_CAINFO".into(), ca.clone()));
    }
    if let (Some(cert), Some(key)) = (&auth.client_cert, auth.client_key.as_ref().and_then(|k| k.as_str())) {
        env.push(("GIT_SSL_CERT".into(), cert.clone()));
        env.push(("GIT_SSL_KEY".into(), key.to_string()));
    }
    if let Some(proxy) = &auth.proxy_url {
        env.push(("HTTPS_PROXY".into(), proxy.clone()));
        env.push(("HTTP_PROXY".into(), proxy.clone()));
    }
    Ok(env)
}

/// Prepared working directory for one execution.
struct Workspace {
    dir: tempfile::TempDir,
    exec: PathBuf,
    env: Vec<(String, String)>,
}

impl TerraformDriver {
    fn prepare(
        &self,
        recipe: &Recipe,
        metadata: &ResourceMetadata,
        config: &Configuration,
    ) -> Result<Workspace, DriverExecutionError> {
        let fail = |msg: String| driver_error(recipe, config, msg);
        let exec = self
            .locator
            .get_executable_path(ToolKind::Terraform, self.version.as_deref())
            .map_err(|e| fail(format!("terraform executable unavailable: {}", e)))?;

        let state_dir = self.root.join(STATE_DIR);
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| fail(format!("cannot create {}: {}", state_dir.display(), e)))?;
        let prefix = gitsource::workdir_prefix(
            &metadata.environment,
            metadata.application.as_deref(),
            &metadata.name,
        );
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.root)
            .map_err(|e| fail(format!("cannot create working directory: {}", e)))?;

        let mut env: Vec<(String, String)> = config
            .recipe_config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("TF_IN_AUTOMATION".into(), "1".into()));
        env.push(("HOME".into(), dir.path().to_string_lossy().to_string()));
        env.extend(prepare_git_auth(dir.path(), recipe, config).map_err(fail)?);

        tracing::debug!(resource = %metadata.name, workdir = %dir.path().display(), "prepared terraform workdir");
        Ok(Workspace { dir, exec, env })
    }

    async fn terraform(
        &self,
        ctx: &ExecutionContext,
        ws: &Workspace,
        args: &[&str],
        recipe: &Recipe,
        config: &Configuration,
    ) -> Result<ExecOutput, DriverExecutionError> {
        let mut cmd = Command::new(&ws.exec);
        cmd.args(args)
            .current_dir(ws.dir.path())
            .envs(ws.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let out = run(ctx, cmd)
            .await
            .map_err(|e| driver_error(recipe, config, format!("terraform {}: {}", args[0], e)))?;
        if !out.success() {
            return Err(driver_error(
                recipe,
                config,
                format!(
                    "terraform {} exited with {}: {}",
                    args[0],
                    out.exit_code,
                    out.stderr.trim()
                ),
            ));
        }
        Ok(out)
    }

    /// Write the root module, fetch the module, then rewrite it with the
    /// inputs and outputs the module actually declares.
    async fn configure(
        &self,
        ctx: &ExecutionContext,
        ws: &Workspace,
        recipe: &Recipe,
        metadata: &ResourceMetadata,
        config: &Configuration,
    ) -> Result<(), DriverExecutionError> {
        let fail = |msg: String| driver_error(recipe, config, msg);
        let params = merge_parameters(&Map::new(), &recipe.parameters, &metadata.parameters);

        let state_path = self.state_path(metadata);

        let initial = generate_config(recipe, &params, None, false, &state_path, config);
        write_config(ws.dir.path(), &initial).map_err(|e| fail(format!("cannot write {}: {}", MAIN_CONFIG, e)))?;
        self.terraform(ctx, ws, &["get", "-no-color"], recipe, config)
            .await?;

        let inspection = match module_dir(ws.dir.path(), &module_name(&recipe.name)) {
            Some(dir) => inspect_module(&dir)
                .map_err(|e| fail(format!("cannot inspect module: {}", e)))?,
            None => ModuleInspection::default(),
        };
        let context = if inspection.declares_context {
            let ctx = serde_json::to_value(RecipeContext::new(metadata, config))
                .map_err(|e| fail(format!("cannot serialize recipe context: {}", e)))?;
            Some(ctx)
        } else {
            None
        };
        let full = generate_config(
            recipe,
            &params,
            context.as_ref(),
            inspection.declares_result,
            &state_path,
            config,
        );
        write_config(ws.dir.path(), &full).map_err(|e| fail(format!("cannot write {}: {}", MAIN_CONFIG, e)))?;
        self.terraform(ctx, ws, &["init", "-input=false", "-no-color"], recipe, config)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for TerraformDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Terraform
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        recipe: &Recipe,
        metadata: &ResourceMetadata,
        config: &Configuration,
    ) -> Result<RecipeOutput, DriverExecutionError> {
        tracing::info!(recipe = %recipe.name, template = %recipe.template_path, resource = %metadata.name, "executing terraform recipe");
        let ws = self.prepare(recipe, metadata, config)?;
        self.configure(ctx, &ws, recipe, metadata, config).await?;
        self.terraform(
            ctx,
            &ws,
            &["apply", "-auto-approve", "-input=false", "-no-color"],
            recipe,
            config,
        )
        .await?;
        let shown = self
            .terraform(ctx, &ws, &["show", "-json", "-no-color"], recipe, config)
            .await?;
        let state: Value = serde_json::from_str(&shown.stdout)
            .map_err(|e| driver_error(recipe, config, format!("invalid terraform state: {}", e)))?;
        parse_state(recipe, &state).map_err(|e| driver_error(recipe, config, e))
    }

    async fn delete(
        &self,
        ctx: &ExecutionContext,
        recipe: &Recipe,
        metadata: &ResourceMetadata,
        config: &Configuration,
    ) -> Result<(), DriverExecutionError> {
        let state_path = self.state_path(metadata);
        if !state_path.exists() {
            tracing::info!(recipe = %recipe.name, resource = %metadata.name, state = %state_path.display(), "no terraform state; nothing to destroy");
            return Ok(());
        }
        tracing::info!(recipe = %recipe.name, resource = %metadata.name, "destroying terraform recipe");
        let ws = self.prepare(recipe, metadata, config)?;
        self.configure(ctx, &ws, recipe, metadata, config).await?;
        self.terraform(
            ctx,
            &ws,
            &["destroy", "-auto-approve", "-input=false", "-no-color"],
            recipe,
            config,
        )
        .await?;
        for path in [state_path.clone(), state_path.with_extension("tfstate.backup")] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(driver_error(
                        recipe,
                        config,
                        format!("cannot remove {}: {}", path.display(), e),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::core::configuration::{AzureProvider, GitAuth};
    use crate::core::types::Secret;
    use crate::installer::FixedLocator;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_kl021_module_name() {
        assert_eq!(module_name("default"), "default");
        assert_eq!(module_name("redis.large"), "redis_large");
        assert_eq!(module_name("1st"), "m_1st");
    }

    #[test]
    fn test_kl021_generate_config() {
        let mut r = recipe(DriverKind::Terraform, "Azure/redis/azurerm");
        r.template_version = Some("1.2.0".into());
        let mut params = Map::new();
        params.insert("sku".into(), json!("Basic"));
        let mut cfg = config();
        cfg.providers.azure = Some(AzureProvider {
            scope: "/subscriptions/sub1/resourceGroups/rg".into(),
        });
        let ctx = serde_json::to_value(RecipeContext::new(&metadata(), &cfg)).unwrap();
        let state = Path::new("/var/lib/kiln/state/dev-cache-abc.tfstate");
        let v = generate_config(&r, &params, Some(&ctx), true, state, &cfg);

        assert_eq!(v["module"]["default"]["source"], "Azure/redis/azurerm");
        assert_eq!(v["module"]["default"]["version"], "1.2.0");
        assert_eq!(v["module"]["default"]["sku"], "Basic");
        assert_eq!(v["module"]["default"]["context"]["resource"]["name"], "cache");
        assert_eq!(v["output"]["result"]["value"], "${module.default.result}");
        assert_eq!(v["output"]["result"]["sensitive"], true);
        assert_eq!(v["provider"]["azurerm"][0]["subscription_id"], "sub1");
        assert_eq!(
            v.pointer("/terraform/backend/local/path"),
            Some(&json!("/var/lib/kiln/state/dev-cache-abc.tfstate"))
        );
    }

    #[test]
    fn test_kl021_generate_config_minimal() {
        let r = recipe(DriverKind::Terraform, "git::https://github.com/o/r");
        let v = generate_config(&r, &Map::new(), None, false, Path::new("s.tfstate"), &config());
        assert!(v.get("output").is_none());
        assert!(v.get("provider").is_none());
        assert!(v["module"]["default"].get("version").is_none());
        assert!(v["module"]["default"].get("context").is_none());
    }

    #[test]
    fn test_kl021_configured_provider_wins() {
        let mut cfg = config();
        cfg.providers.azure = Some(AzureProvider {
            scope: "/subscriptions/sub1/resourceGroups/rg".into(),
        });
        cfg.recipe_config
            .terraform
            .providers
            .insert("azurerm".into(), vec![json!({"features": {}, "alias": "x"})]);
        let v = generate_config(
            &recipe(DriverKind::Terraform, "m"),
            &Map::new(),
            None,
            false,
            Path::new("s.tfstate"),
            &cfg,
        );
        assert_eq!(v["provider"]["azurerm"][0]["alias"], "x");
    }

    #[cfg(unix)]
    #[test]
    fn test_kl021_write_config_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), &json!({"module": {}})).unwrap();
        let meta = std::fs::metadata(dir.path().join(MAIN_CONFIG)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_kl021_inspect_module() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("variables.tf"),
            "variable \"context\" {\n  type = any\n}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("outputs.tf"),
            "output \"result\" {\n  value = {}\n}\n",
        )
        .unwrap();
        let found = inspect_module(dir.path()).unwrap();
        assert!(found.declares_context);
        assert!(found.declares_result);

        let plain = tempfile::tempdir().unwrap();
        std::fs::write(
            plain.path().join("main.tf"),
            "# variable \"context\" {}\nvariable \"sku\" {}\n",
        )
        .unwrap();
        assert_eq!(inspect_module(plain.path()).unwrap(), ModuleInspection::default());
    }

    #[test]
    fn test_kl021_module_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".terraform/modules")).unwrap();
        std::fs::write(
            dir.path().join(".terraform/modules/modules.json"),
            r#"{"Modules":[{"Key":"","Source":"","Dir":"."},{"Key":"default","Source":"x","Dir":".terraform/modules/default"}]}"#,
        )
        .unwrap();
        assert_eq!(
            module_dir(dir.path(), "default"),
            Some(dir.path().join(".terraform/modules/default"))
        );
        assert_eq!(module_dir(dir.path(), "other"), None);
    }

    #[test]
    fn test_kl021_parse_state_unions_resources() {
        let state = json!({
            "values": {
                "outputs": {"result": {"sensitive": true, "value": {
                    "values": {"host": "h"},
                    "secrets": {"password": "pw"},
                    "resources": ["/subscriptions/s/resourceGroups/g/providers/Microsoft.Cache/redis/c"]
                }}},
                "root_module": {"child_modules": [{
                    "resources": [
                        {"values": {"id": "/SUBSCRIPTIONS/s/resourceGroups/g/providers/Microsoft.Cache/redis/c"}},
                        {"values": {"id": "/subscriptions/s/resourceGroups/g/providers/Microsoft.Network/privateEndpoints/pe"}},
                        {"values": {"id": "default/redis-secret"}}
                    ]
                }]}
            }
        });
        let r = recipe(DriverKind::Terraform, "Azure/redis/azurerm");
        let out = parse_state(&r, &state).unwrap();
        assert_eq!(out.resources.len(), 2);
        assert!(out.resources[1].ends_with("privateEndpoints/pe"));
        assert_eq!(out.values["host"], json!("h"));
        assert_eq!(out.secrets["password"].as_str(), Some("pw"));
        assert_eq!(out.status.template_kind, DriverKind::Terraform);
    }

    #[test]
    fn test_kl021_parse_state_without_result() {
        let r = recipe(DriverKind::Terraform, "m");
        let out = parse_state(&r, &json!({"values": {}})).unwrap();
        assert!(out.values.is_empty());
        assert!(out.resources.is_empty());
    }

    #[test]
    fn test_kl021_git_auth_files() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(
            DriverKind::Terraform,
            "git::https://www.github.com/org/modules//redis?ref=v1",
        );
        let mut cfg = config();
        cfg.recipe_config.git.pat.insert(
            "github.com".into(),
            GitAuth {
                token: Some(Secret::new("tok")),
                proxy_url: Some("http://proxy:3128".into()),
                ..Default::default()
            },
        );
        let env = prepare_git_auth(dir.path(), &r, &cfg).unwrap();
        let get = |k: &str| {
            env.iter()
                .find(|(n, _)| n == k)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("GIT_TERMINAL_PROMPT").as_deref(), Some("0"));
        assert_eq!(get("TF_TOKEN_github_com").as_deref(), Some("tok"));
        assert_eq!(get("HTTPS_PROXY").as_deref(), Some("http://proxy:3128"));
        let gitconfig = std::fs::read_to_string(dir.path().join(".gitconfig")).unwrap();
        assert!(gitconfig.contains("extraHeader = Authorization: Basic"));
        assert!(dir.path().join(".terraformrc").exists());
    }

    #[test]
    fn test_kl021_no_auth_for_registry_module() {
        let dir = tempfile::tempdir().unwrap();
        let r = recipe(DriverKind::Terraform, "Azure/redis/azurerm");
        let env = prepare_git_auth(dir.path(), &r, &config()).unwrap();
        assert_eq!(env.len(), 1);
        assert!(!dir.path().join(".gitconfig").exists());
    }

    #[tokio::test]
    async fn test_kl021_missing_executable_is_precondition_failure() {
        let dir = tempfile::tempdir().unwrap();
        let driver = TerraformDriver::new(
            Arc::new(FixedLocator {
                path: dir.path().join("no-terraform"),
            }),
            dir.path().join("work"),
        );
        let ctx = ExecutionContext::new(CancellationToken::new(), Duration::from_secs(5));
        let err = driver
            .execute(&ctx, &recipe(DriverKind::Terraform, "m"), &metadata(), &config())
            .await
            .unwrap_err();
        assert!(err.message.contains("terraform executable unavailable"));
    }

    /// Drives the full execute path against a stub `terraform` script.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_kl021_execute_with_stub_binary() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("terraform");
        std::fs::write(
            &stub,
            r#"#!/bin/sh
case "$1" in
  get)
    mkdir -p .terraform/modules/default
    printf 'output "result" {\n  value = {}\n}\n' > .terraform/modules/default/outputs.tf
    printf '{"Modules":[{"Key":"default","Dir":".terraform/modules/default"}]}' > .terraform/modules/modules.json
    ;;
  init) ;;
  apply)
    path=$(sed -n 's/.*"path": "\(.*\)".*/\1/p' main.tf.json)
    echo '{"version":4}' > "$path"
    ;;
  destroy)
    path=$(sed -n 's/.*"path": "\(.*\)".*/\1/p' main.tf.json)
    [ -f "$path" ] || { echo "no state: nothing to destroy" >&2; exit 7; }
    ;;
  show)
    grep -q '"output"' main.tf.json || exit 3
    printf '{"values":{"outputs":{"result":{"value":{"values":{"host":"h"}}}},"root_module":{}}}'
    ;;
  *) exit 1 ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let root = dir.path().join("work");
        let driver = TerraformDriver::new(Arc::new(FixedLocator { path: stub }), &root);
        let ctx = ExecutionContext::new(CancellationToken::new(), Duration::from_secs(30));
        let r = recipe(DriverKind::Terraform, "m");
        let out = driver
            .execute(&ctx, &r, &metadata(), &config())
            .await
            .unwrap();
        assert_eq!(out.values["host"], json!("h"));
        // Per-execution workdir is removed; only the state directory remains.
        let entries: Vec<_> = std::fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state")]);

        let state = driver.state_path(&metadata());
        assert!(state.exists());
        assert_eq!(state, driver.state_path(&metadata()));

        driver
            .delete(&ctx, &r, &metadata(), &config())
            .await
            .unwrap();
        assert!(!state.exists());
        // Nothing left to destroy: skipped without running terraform.
        driver
            .delete(&ctx, &r, &metadata(), &config())
            .await
            .unwrap();
    }
}
