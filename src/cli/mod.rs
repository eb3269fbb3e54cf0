//! KL-024: CLI subcommands — init, validate, render, graph, plan, deploy,
//! delete, status, resolve-source, install, uninstall, schema, completions.

use crate::core::executor::{DeployOptions, DeployReport, Engine, RecordedDeployer};
use crate::core::types::{Manifest, ValueRef};
use crate::core::{gitsource, parser, planner};
use crate::drivers::terraform::TerraformDriver;
use crate::drivers::DriverRegistry;
use crate::installer::{Installer, ToolKind};
use crate::renderers::RendererRegistry;
use crate::tripwire::eventlog::EventLog;
use clap::Subcommand;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new kiln project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate kiln.yaml without rendering or deploying
    Validate {
        /// Path to kiln.yaml
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,
    },

    /// Render manual resources into output resources and values
    Render {
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,

        /// Emit JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Show the output graph's deployment order and waves
    Graph {
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,
    },

    /// Show execution plan (diff rendered graph vs last deploy)
    Plan {
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Deploy every resource and resolve its values
    Deploy {
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,

        /// YAML mapping of namespaced LocalID to as-deployed properties
        #[arg(short, long)]
        properties: PathBuf,

        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Directory holding installed tools
        #[arg(long, default_value = ".kiln/tools")]
        tools_dir: PathBuf,

        /// Terraform version to run (default: latest installed)
        #[arg(long)]
        terraform_version: Option<String>,

        /// Deadline for the whole deploy, in seconds
        #[arg(long, default_value_t = 1800)]
        timeout: u64,
    },

    /// Tear down recipe-provisioned resources recorded by the last deploy
    Delete {
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,

        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        #[arg(long, default_value = ".kiln/tools")]
        tools_dir: PathBuf,

        #[arg(long)]
        terraform_version: Option<String>,

        #[arg(long, default_value_t = 1800)]
        timeout: u64,
    },

    /// Show the last deployment record for an environment
    Status {
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Environment name
        #[arg(short, long)]
        environment: String,
    },

    /// Resolve a git:: template locator
    ResolveSource {
        /// Template locator, e.g. git::https://github.com/org/modules//redis
        locator: String,

        #[arg(long, default_value = "default")]
        environment: String,

        #[arg(long)]
        application: Option<String>,

        #[arg(long, default_value = "resource")]
        resource: String,
    },

    /// Install a tool binary from a local file
    Install {
        #[arg(value_enum)]
        tool: ToolKind,

        version: String,

        /// Binary to install
        source: PathBuf,

        #[arg(long, default_value = ".kiln/tools")]
        tools_dir: PathBuf,
    },

    /// Remove an installed tool version
    Uninstall {
        #[arg(value_enum)]
        tool: ToolKind,

        version: String,

        #[arg(long, default_value = ".kiln/tools")]
        tools_dir: PathBuf,
    },

    /// Print the kiln.yaml JSON schema
    Schema,

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Render { file, json } => cmd_render(&file, json),
        Commands::Graph { file } => cmd_graph(&file),
        Commands::Plan { file, state_dir } => cmd_plan(&file, &state_dir),
        Commands::Deploy {
            file,
            properties,
            state_dir,
            tools_dir,
            terraform_version,
            timeout,
        } => cmd_deploy(
            &file,
            &properties,
            &state_dir,
            &tools_dir,
            terraform_version,
            timeout,
        ),
        Commands::Delete {
            file,
            state_dir,
            tools_dir,
            terraform_version,
            timeout,
        } => cmd_delete(&file, &state_dir, &tools_dir, terraform_version, timeout),
        Commands::Status {
            state_dir,
            environment,
        } => cmd_status(&state_dir, &environment),
        Commands::ResolveSource {
            locator,
            environment,
            application,
            resource,
        } => cmd_resolve_source(&locator, &environment, application.as_deref(), &resource),
        Commands::Install {
            tool,
            version,
            source,
            tools_dir,
        } => cmd_install(tool, &version, &source, &tools_dir),
        Commands::Uninstall {
            tool,
            version,
            tools_dir,
        } => cmd_uninstall(tool, &version, &tools_dir),
        Commands::Schema => {
            println!("{}", schema_json()?);
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut command = Commands::augment_subcommands(clap::Command::new("kiln"));
            clap_complete::generate(shell, &mut command, "kiln", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let manifest_path = path.join("kiln.yaml");
    if manifest_path.exists() {
        return Err(format!("{} already exists", manifest_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    let template = r#"version: "1.0"
environment: dev
runtime:
  kind: kubernetes
  namespace: default

# providers:
#   azure:
#     scope: /subscriptions/<sub>/resourceGroups/<group>

recipes: []

resources: []
"#;
    std::fs::write(&manifest_path, template)
        .map_err(|e| format!("cannot write {}: {}", manifest_path.display(), e))?;

    println!("Initialized kiln project at {}", path.display());
    println!("  Created: {}", manifest_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let manifest = parser::parse_manifest_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_manifest(&manifest);

    if errors.is_empty() {
        println!(
            "OK: {} ({} recipes, {} resources)",
            manifest.environment,
            manifest.recipes.len(),
            manifest.resources.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

/// Parse and validate a manifest, printing every error.
fn parse_and_validate(file: &Path) -> Result<Manifest, String> {
    let manifest = parser::parse_manifest_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_manifest(&manifest);
    if errors.is_empty() {
        return Ok(manifest);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

fn engine(manifest: Manifest, drivers: DriverRegistry) -> Result<Engine, String> {
    Engine::new(manifest, RendererRegistry::builtin(), drivers).map_err(|e| e.to_string())
}

/// Drivers available from the command line. Bicep needs a deployment
/// client and is not registered here.
fn cli_drivers(state_dir: &Path, tools_dir: &Path, terraform_version: Option<String>) -> DriverRegistry {
    let installer = Arc::new(Installer::new(tools_dir));
    let mut terraform = TerraformDriver::new(installer, state_dir.join("workdirs"));
    if let Some(v) = terraform_version {
        terraform = terraform.with_version(v);
    }
    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(terraform));
    drivers
}

fn describe_ref(source: &ValueRef) -> String {
    match source {
        ValueRef::Literal { value } => format!("= {}", value),
        ValueRef::Reference { local_id, pointer } => format!("<- {} {}", local_id, pointer),
    }
}

fn cmd_render(file: &Path, json: bool) -> Result<(), String> {
    let engine = engine(parse_and_validate(file)?, DriverRegistry::new())?;
    let rendered = engine.render_manual().map_err(|e| e.to_string())?;

    if json {
        let map: IndexMap<String, _> = rendered.into_iter().collect();
        let out = serde_json::to_string_pretty(&map).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }

    for (name, out) in &rendered {
        println!("{}:", name);
        for r in &out.resources {
            let ownership = if r.radius_managed { "managed" } else { "existing" };
            let deps = if r.dependencies.is_empty() {
                String::new()
            } else {
                format!(" after {}", r.dependencies.join(", "))
            };
            println!(
                "  + {} ({}) [{}]{}",
                r.local_id, r.resource_type.kind, ownership, deps
            );
        }
        for (k, v) in &out.computed_values {
            println!("  value  {} {}", k, describe_ref(v.source()));
        }
        for (k, v) in &out.secret_values {
            let shown = match v.source() {
                ValueRef::Literal { .. } => "= <literal>".to_string(),
                reference => describe_ref(reference),
            };
            println!("  secret {} {}", k, shown);
        }
    }
    Ok(())
}

fn cmd_graph(file: &Path) -> Result<(), String> {
    let engine = engine(parse_and_validate(file)?, DriverRegistry::new())?;
    let graph = engine.graph_manual().map_err(|e| e.to_string())?;

    println!("Output graph: {} node(s)", graph.len());
    for (n, id) in graph.order_ids().iter().enumerate() {
        println!("  {}. {}", n + 1, id);
    }
    println!();
    for (w, wave) in graph.waves().iter().enumerate() {
        let ids: Vec<&str> = wave
            .iter()
            .map(|&i| graph.node(i).local_id.as_str())
            .collect();
        println!("  wave {}: {}", w, ids.join(", "));
    }
    Ok(())
}

fn cmd_plan(file: &Path, state_dir: &Path) -> Result<(), String> {
    let engine = engine(parse_and_validate(file)?, DriverRegistry::new())?;
    let plan = engine.plan(state_dir).map_err(|e| e.to_string())?;

    println!(
        "Planning: {} ({} output resources)",
        plan.environment,
        plan.changes.len()
    );
    println!();
    for change in &plan.changes {
        let symbol = match change.action {
            planner::PlanAction::Create => "+",
            planner::PlanAction::Update => "~",
            planner::PlanAction::Delete => "-",
            planner::PlanAction::NoOp => " ",
        };
        println!("  {} {} ({}): {}", symbol, change.local_id, change.kind, change.action);
    }
    println!();
    println!(
        "Plan: {} to add, {} to change, {} to delete, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_delete, plan.unchanged
    );
    Ok(())
}

fn print_report(report: &DeployReport) {
    for r in &report.resources {
        println!("{} [{}]: {}", r.name, r.mode, r.state);
        for (k, v) in &r.values {
            println!("    {} = {}", k, v);
        }
        let secrets: Vec<&str> = r.secrets.names().collect();
        if !secrets.is_empty() {
            println!("    secrets: {}", secrets.join(", "));
        }
        if let Some(e) = &r.error {
            println!("    error: {}", e);
        }
    }
    println!();
}

fn cmd_deploy(
    file: &Path,
    properties: &Path,
    state_dir: &Path,
    tools_dir: &Path,
    terraform_version: Option<String>,
    timeout: u64,
) -> Result<(), String> {
    let manifest = parse_and_validate(file)?;
    let engine = engine(manifest, cli_drivers(state_dir, tools_dir, terraform_version))?;
    let deployer = Arc::new(RecordedDeployer::from_file(properties).map_err(|e| e.to_string())?);
    let opts = DeployOptions {
        cancel: CancellationToken::new(),
        timeout: Duration::from_secs(timeout),
        state_dir: state_dir.to_path_buf(),
    };

    let report = runtime()?
        .block_on(async {
            let cancel = opts.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
            engine.deploy(deployer, &opts).await
        })
        .map_err(|e| e.to_string())?;

    print_report(&report);
    if report.failed() > 0 {
        println!(
            "Deploy completed with errors: {} resolved, {} FAILED ({:.1}s)",
            report.resolved(),
            report.failed(),
            report.duration.as_secs_f64()
        );
        return Err(format!("{} resource(s) failed", report.failed()));
    }
    println!(
        "Deploy complete: {} resolved ({:.1}s).",
        report.resolved(),
        report.duration.as_secs_f64()
    );
    Ok(())
}

fn cmd_delete(
    file: &Path,
    state_dir: &Path,
    tools_dir: &Path,
    terraform_version: Option<String>,
    timeout: u64,
) -> Result<(), String> {
    let manifest = parse_and_validate(file)?;
    let engine = engine(manifest, cli_drivers(state_dir, tools_dir, terraform_version))?;
    let opts = DeployOptions {
        cancel: CancellationToken::new(),
        timeout: Duration::from_secs(timeout),
        state_dir: state_dir.to_path_buf(),
    };
    let results = runtime()?
        .block_on(engine.delete_recipes(&opts))
        .map_err(|e| e.to_string())?;

    let mut failed = 0;
    for (name, result) in &results {
        match result {
            Ok(()) => println!("  deleted: {}", name),
            Err(e) => {
                failed += 1;
                println!("  FAILED:  {}: {}", name, e);
            }
        }
    }
    if failed > 0 {
        return Err(format!("{} resource(s) could not be deleted", failed));
    }
    println!("Delete complete: {} resource(s).", results.len());
    Ok(())
}

fn cmd_status(state_dir: &Path, environment: &str) -> Result<(), String> {
    let Some(record) = planner::load_record(state_dir, environment).map_err(|e| e.to_string())?
    else {
        println!("No state found for {}. Run `kiln deploy` first.", environment);
        return Ok(());
    };
    println!("Environment: {}", record.environment);
    println!("  Generated: {}", record.generated_at);
    println!("  Generator: {}", record.generator);
    println!("  Output resources: {}", record.resources.len());
    for (id, r) in &record.resources {
        let deployed = r
            .deployed_id
            .as_deref()
            .map(|d| format!(" -> {}", d))
            .unwrap_or_default();
        println!("    {}: [{}]{}", id, r.kind, deployed);
    }
    let events = EventLog::new(state_dir, environment)
        .read_all()
        .map_err(|e| e.to_string())?;
    println!("  Events: {}", events.len());
    Ok(())
}

fn cmd_resolve_source(
    locator: &str,
    environment: &str,
    application: Option<&str>,
    resource: &str,
) -> Result<(), String> {
    let source = gitsource::resolve(locator)?;
    println!("url:      {}", source.url);
    println!("hostname: {}", source.hostname);
    println!("token:    {}", gitsource::tf_token_env_var(&source.hostname));
    println!(
        "workdir:  {}",
        gitsource::workdir_prefix(environment, application, resource)
    );
    Ok(())
}

fn cmd_install(tool: ToolKind, version: &str, source: &Path, tools_dir: &Path) -> Result<(), String> {
    let installer = Installer::new(tools_dir);
    let (path, hash) = runtime()?
        .block_on(installer.install(tool, version, source))
        .map_err(|e| e.to_string())?;
    println!("Installed {} {} at {} ({})", tool, version, path.display(), hash);
    Ok(())
}

fn cmd_uninstall(tool: ToolKind, version: &str, tools_dir: &Path) -> Result<(), String> {
    let installer = Installer::new(tools_dir);
    runtime()?
        .block_on(installer.uninstall(tool, version))
        .map_err(|e| e.to_string())?;
    println!("Uninstalled {} {}", tool, version);
    Ok(())
}

fn schema_json() -> Result<String, String> {
    let schema = schemars::schema_for!(Manifest);
    serde_json::to_string_pretty(&schema).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
version: "1.0"
environment: dev
runtime:
  kind: kubernetes
  namespace: dev
resources:
  - name: cache
    type: Applications.Datastores/redisCaches
    provisioning: manual
    properties:
      resource: /subscriptions/s/resourceGroups/g/providers/Microsoft.Cache/redis/c1
"#;

    fn write_manifest(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("kiln.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_kl024_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("project");
        std::fs::create_dir_all(&sub).unwrap();
        cmd_init(&sub).unwrap();
        assert!(sub.join("state").is_dir());
        cmd_validate(&sub.join("kiln.yaml")).unwrap();
    }

    #[test]
    fn test_kl024_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kiln.yaml"), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_kl024_validate_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_manifest(
            dir.path(),
            "version: \"2.0\"\nenvironment: \"\"\nruntime:\n  kind: kubernetes\n  namespace: d\n",
        );
        let err = cmd_validate(&file).unwrap_err();
        assert!(err.contains("2 validation error(s)"));
    }

    #[test]
    fn test_kl024_render_graph_plan() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_manifest(dir.path(), MANIFEST);
        cmd_render(&file, false).unwrap();
        cmd_render(&file, true).unwrap();
        cmd_graph(&file).unwrap();
        cmd_plan(&file, &dir.path().join("state")).unwrap();
    }

    #[test]
    fn test_kl024_deploy_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_manifest(dir.path(), MANIFEST);
        let props = dir.path().join("props.yaml");
        std::fs::write(
            &props,
            "cache/redis-cache:\n  properties:\n    hostName: c1\n    sslPort: 6380\n  primaryKey: pk\n  primaryConnectionString: cs\n",
        )
        .unwrap();
        let state = dir.path().join("state");
        cmd_deploy(&file, &props, &state, &dir.path().join("tools"), None, 30).unwrap();
        assert!(planner::load_record(&state, "dev").unwrap().is_some());
        cmd_status(&state, "dev").unwrap();
    }

    #[test]
    fn test_kl024_deploy_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_manifest(dir.path(), MANIFEST);
        let props = dir.path().join("props.yaml");
        std::fs::write(&props, "{}\n").unwrap();
        let err = cmd_deploy(
            &file,
            &props,
            &dir.path().join("state"),
            &dir.path().join("tools"),
            None,
            30,
        )
        .unwrap_err();
        assert!(err.contains("1 resource(s) failed"));
    }

    #[test]
    fn test_kl024_status_empty() {
        let dir = tempfile::tempdir().unwrap();
        cmd_status(dir.path(), "dev").unwrap();
    }

    #[test]
    fn test_kl024_resolve_source() {
        cmd_resolve_source("git::https://www.github.com/org/repo", "dev", None, "cache").unwrap();
        assert!(cmd_resolve_source("https://github.com/org/repo", "dev", None, "cache").is_err());
    }

    #[test]
    fn test_kl024_schema() {
        let schema = schema_json().unwrap();
        assert!(schema.contains("\"Manifest\""));
        assert!(schema.contains("resources"));
    }

    #[test]
    fn test_kl024_install_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tf");
        std::fs::write(&src, "#!/bin/sh\n").unwrap();
        let tools = dir.path().join("tools");
        cmd_install(ToolKind::Terraform, "1.9.0", &src, &tools).unwrap();
        assert!(tools.join("terraform/1.9.0/terraform").exists());
        cmd_uninstall(ToolKind::Terraform, "1.9.0", &tools).unwrap();
        assert!(cmd_uninstall(ToolKind::Terraform, "1.9.0", &tools).is_err());
    }
}
