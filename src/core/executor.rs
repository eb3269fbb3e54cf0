//! KL-023: Executor — orchestration loop for deploy.
//!
//! validate → render (manual) / execute (recipe) → namespace → graph →
//! deploy in waves → resolve → record → events

use super::configuration::{self, ConfigOverlay, Configuration};
use super::deferred::{self, DeployedProperties, ResolvedSecrets};
use super::error::{DriverExecutionError, KilnError, ValidationError};
use super::graph::OutputGraph;
use super::parser;
use super::planner::{self, DeploymentRecord, ExecutionPlan, RecordedResource};
use super::recipe::RecipeRegistry;
use super::types::*;
use crate::drivers::process::bounded;
use crate::drivers::{self, Driver, DriverRegistry, ExecutionContext, ResourceMetadata};
use crate::renderers::{RenderOptions, RendererRegistry};
use crate::tripwire::eventlog::{self, EventLog};
use crate::tripwire::hasher;
use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Creates or updates one output resource and returns its as-deployed
/// property bag.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, resource: &OutputResource) -> Result<Value, String>;
}

/// Deployer answering from property bags recorded ahead of time, keyed by
/// namespaced LocalID (`<resource>/<local_id>`).
#[derive(Debug, Clone, Default)]
pub struct RecordedDeployer {
    bags: IndexMap<String, Value>,
}

impl RecordedDeployer {
    pub fn new(bags: IndexMap<String, Value>) -> Self {
        Self { bags }
    }

    /// Load property bags from a YAML mapping of LocalID to object.
    pub fn from_file(path: &Path) -> Result<Self, KilnError> {
        let content = std::fs::read_to_string(path).map_err(|e| KilnError::io(path, e))?;
        let bags = serde_yaml_ng::from_str(&content).map_err(|e| {
            KilnError::Parse(format!("invalid properties file {}: {}", path.display(), e))
        })?;
        Ok(Self { bags })
    }
}

#[async_trait]
impl Deployer for RecordedDeployer {
    async fn deploy(&self, resource: &OutputResource) -> Result<Value, String> {
        self.bags
            .get(&resource.local_id)
            .cloned()
            .ok_or_else(|| format!("no recorded properties for '{}'", resource.local_id))
    }
}

/// Settings for one deploy run.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub cancel: CancellationToken,
    /// Deadline for the whole run, recipes included
    pub timeout: Duration,
    pub state_dir: PathBuf,
}

/// Outcome for one declared resource.
#[derive(Debug)]
pub struct ResourceReport {
    pub name: String,
    pub mode: ProvisioningMode,
    pub state: DeploymentState,
    pub values: IndexMap<String, Value>,
    pub secrets: ResolvedSecrets,
    pub error: Option<String>,
    failed_in: Option<DeploymentState>,
    started: Instant,
}

impl ResourceReport {
    fn new(name: &str, mode: ProvisioningMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            state: DeploymentState::Rendered,
            values: IndexMap::new(),
            secrets: ResolvedSecrets::default(),
            error: None,
            failed_in: None,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: DeploymentState) {
        if self.state.can_transition(next) {
            tracing::debug!(resource = %self.name, from = %self.state, to = %next, "state transition");
            self.state = next;
        } else {
            tracing::warn!(resource = %self.name, from = %self.state, to = %next, "illegal state transition ignored");
        }
    }

    /// First failure wins; later ones are dropped.
    fn fail(&mut self, error: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        let error = error.into();
        tracing::warn!(resource = %self.name, state = %self.state, %error, "resource failed");
        self.failed_in = Some(self.state);
        self.state = DeploymentState::Failed;
        self.error = Some(error);
    }
}

/// Outcome of a deploy run.
#[derive(Debug)]
pub struct DeployReport {
    pub run_id: String,
    pub resources: Vec<ResourceReport>,
    /// Namespaced LocalIDs in deployment order
    pub order: Vec<String>,
    pub duration: Duration,
}

impl DeployReport {
    pub fn get(&self, name: &str) -> Option<&ResourceReport> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn resolved(&self) -> usize {
        self.count(DeploymentState::Resolved)
    }

    pub fn failed(&self) -> usize {
        self.count(DeploymentState::Failed)
    }

    fn count(&self, state: DeploymentState) -> usize {
        self.resources.iter().filter(|r| r.state == state).count()
    }
}

/// Owning resource of a namespaced LocalID.
fn owner_of(local_id: &str) -> &str {
    local_id.split('/').next().unwrap_or(local_id)
}

fn identity_id(identity: &ResourceIdentity) -> Option<String> {
    match identity {
        ResourceIdentity::Arm { id } | ResourceIdentity::Ucp { id } => Some(id.clone()),
        ResourceIdentity::Kubernetes { .. } => None,
    }
}

fn emit(log: &EventLog, event: ProvenanceEvent) {
    if let Err(e) = log.append(event) {
        tracing::warn!(path = %log.path().display(), error = %e, "cannot append provenance event");
    }
}

/// Deployment engine for one environment.
pub struct Engine {
    manifest: Manifest,
    configuration: Configuration,
    recipes: RecipeRegistry,
    renderers: RendererRegistry,
    drivers: DriverRegistry,
}

impl Engine {
    /// Validate the manifest and build the engine. The first validation
    /// failure is returned; `parser::validate_manifest` lists them all.
    pub fn new(
        manifest: Manifest,
        renderers: RendererRegistry,
        drivers: DriverRegistry,
    ) -> Result<Self, KilnError> {
        if let Some(err) = parser::validate_manifest(&manifest).into_iter().next() {
            return Err(err.into());
        }
        let recipes = RecipeRegistry::new(&manifest.environment, &manifest.recipes).map_err(
            |errs| match errs.into_iter().next() {
                Some(e) => KilnError::from(e),
                None => KilnError::Precondition("invalid recipe catalog".into()),
            },
        )?;
        Ok(Self {
            configuration: Configuration::from_manifest(&manifest),
            manifest,
            recipes,
            renderers,
            drivers,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn options(&self) -> RenderOptions<'_> {
        RenderOptions {
            environment: &self.manifest.environment,
            application: self.manifest.application.as_deref(),
            runtime: &self.manifest.runtime,
        }
    }

    /// Environment configuration with the resource's own git auth layered on.
    pub fn resource_configuration(&self, resource: &Resource) -> Configuration {
        let overlay = ConfigOverlay {
            git_auth: (!resource.git_auth.is_empty()).then_some(&resource.git_auth),
            providers: None,
        };
        configuration::merge(&self.configuration, &overlay)
    }

    fn metadata(&self, resource: &Resource) -> ResourceMetadata {
        ResourceMetadata {
            name: resource.name.clone(),
            id: resource.id(&self.manifest.environment),
            resource_type: resource.resource_type.clone(),
            environment: self.manifest.environment.clone(),
            application: self.manifest.application.clone(),
            parameters: resource
                .recipe
                .as_ref()
                .map(|r| r.parameters.clone())
                .unwrap_or_default(),
            deployed_resources: Vec::new(),
        }
    }

    fn recipe_for(
        &self,
        resource: &Resource,
    ) -> Result<(Recipe, Arc<dyn Driver>), DriverExecutionError> {
        let name = resource
            .recipe
            .as_ref()
            .map(|r| r.name.as_str())
            .unwrap_or("default");
        let recipe = self
            .recipes
            .get(&resource.resource_type, name)
            .map_err(|e| DriverExecutionError {
                recipe: name.to_string(),
                template: String::new(),
                message: e.message,
            })?;
        let driver = self.drivers.get(recipe.driver).ok_or_else(|| DriverExecutionError {
            recipe: recipe.name.clone(),
            template: recipe.template_path.clone(),
            message: format!("no driver registered for '{}'", recipe.driver),
        })?;
        Ok((recipe.clone(), driver))
    }

    /// Render every manual resource concurrently, namespaced by resource
    /// name, in manifest order. Any validation failure fails the batch.
    pub fn render_manual(&self) -> Result<Vec<(String, RendererOutput)>, ValidationError> {
        let opts = self.options();
        let manual: Vec<&Resource> = self
            .manifest
            .resources
            .iter()
            .filter(|r| r.provisioning == ProvisioningMode::Manual)
            .collect();

        let results: Vec<Result<RendererOutput, ValidationError>> = std::thread::scope(|s| {
            let handles: Vec<_> = manual
                .iter()
                .map(|r| s.spawn(move || self.renderers.render(r, &opts)))
                .collect();
            handles
                .into_iter()
                .zip(&manual)
                .map(|(h, r)| {
                    h.join().unwrap_or_else(|_| {
                        Err(ValidationError::new(&r.name, "renderer panicked"))
                    })
                })
                .collect()
        });

        let mut out = Vec::with_capacity(results.len());
        for (resource, result) in manual.iter().zip(results) {
            let mut rendered = result?;
            rendered.rebase(&resource.name);
            tracing::debug!(resource = %resource.name, outputs = rendered.resources.len(), "rendered");
            out.push((resource.name.clone(), rendered));
        }
        Ok(out)
    }

    /// Graph of every manual resource's output resources.
    pub fn graph_manual(&self) -> Result<OutputGraph, KilnError> {
        let nodes = self
            .render_manual()?
            .into_iter()
            .flat_map(|(_, o)| o.resources)
            .collect();
        Ok(OutputGraph::build(nodes)?)
    }

    /// Diff manual resources against the last deploy. Entries owned by
    /// recipe resources are left out: their outputs are only known after
    /// execution.
    pub fn plan(&self, state_dir: &Path) -> Result<ExecutionPlan, KilnError> {
        let graph = self.graph_manual()?;
        let mut previous = planner::load_record(state_dir, &self.manifest.environment)?;
        if let Some(prev) = previous.as_mut() {
            let recipe_owned: FxHashSet<&str> = self
                .manifest
                .resources
                .iter()
                .filter(|r| r.provisioning == ProvisioningMode::Recipe)
                .map(|r| r.name.as_str())
                .collect();
            prev.resources
                .retain(|k, _| !recipe_owned.contains(owner_of(k)));
        }
        Ok(planner::plan(
            &self.manifest.environment,
            &graph,
            previous.as_ref(),
        ))
    }

    /// Execute every recipe resource concurrently. Results are keyed by
    /// resource name.
    async fn execute_recipes(
        &self,
        ctx: &ExecutionContext,
    ) -> FxHashMap<String, Result<RecipeOutput, DriverExecutionError>> {
        let mut out = FxHashMap::default();
        let mut set = JoinSet::new();
        for resource in &self.manifest.resources {
            if resource.provisioning != ProvisioningMode::Recipe {
                continue;
            }
            let (recipe, driver) = match self.recipe_for(resource) {
                Ok(pair) => pair,
                Err(e) => {
                    out.insert(resource.name.clone(), Err(e));
                    continue;
                }
            };
            let config = self.resource_configuration(resource);
            let metadata = self.metadata(resource);
            let ctx = ctx.clone();
            tracing::info!(resource = %resource.name, recipe = %recipe.name, driver = %recipe.driver, "executing recipe");
            set.spawn(async move {
                let result = driver.execute(&ctx, &recipe, &metadata, &config).await;
                (metadata.name, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, result)) => {
                    out.insert(name, result);
                }
                Err(e) => tracing::error!(error = %e, "recipe task aborted"),
            }
        }
        out
    }

    /// Deploy every resource in the manifest.
    ///
    /// Validation and graph errors abort the run before anything is
    /// deployed. Driver, deploy and resolution failures fail only the
    /// owning resource and anything depending on it.
    pub async fn deploy(
        &self,
        deployer: Arc<dyn Deployer>,
        opts: &DeployOptions,
    ) -> Result<DeployReport, KilnError> {
        let start = Instant::now();
        let env = self.manifest.environment.as_str();
        let run_id = eventlog::generate_run_id();
        let log = EventLog::new(&opts.state_dir, env);
        let ctx = ExecutionContext::new(opts.cancel.clone(), opts.timeout);
        let previous = planner::load_record(&opts.state_dir, env)?;

        tracing::info!(environment = %env, %run_id, resources = self.manifest.resources.len(), "deploy started");
        emit(
            &log,
            ProvenanceEvent::DeployStarted {
                environment: env.to_string(),
                run_id: run_id.clone(),
                kiln_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );

        let mut reports: IndexMap<String, ResourceReport> = IndexMap::new();
        for r in &self.manifest.resources {
            reports.insert(r.name.clone(), ResourceReport::new(&r.name, r.provisioning));
            emit(
                &log,
                ProvenanceEvent::ResourceStarted {
                    environment: env.to_string(),
                    resource: r.name.clone(),
                    mode: r.provisioning,
                },
            );
        }

        let mut produced: FxHashMap<String, RendererOutput> =
            self.render_manual()?.into_iter().collect();

        // Check the manual graph before any recipe provisions anything.
        let manual_nodes = produced
            .values()
            .flat_map(|o| o.resources.iter().cloned())
            .collect();
        if let Err(e) = OutputGraph::build(manual_nodes) {
            tracing::error!(environment = %env, error = %e, "output graph rejected; no recipe executed");
            return Err(e.into());
        }

        for report in reports.values_mut() {
            if report.mode == ProvisioningMode::Recipe {
                report.advance(DeploymentState::Executing);
            }
        }
        let mut executed = self.execute_recipes(&ctx).await;
        for (name, report) in reports.iter_mut() {
            if report.mode != ProvisioningMode::Recipe {
                continue;
            }
            match executed.remove(name) {
                Some(Ok(output)) => {
                    let mut rendered = drivers::to_renderer_output(&output);
                    rendered.rebase(name);
                    produced.insert(name.clone(), rendered);
                }
                Some(Err(e)) => report.fail(e.to_string()),
                None => report.fail("recipe execution aborted"),
            }
        }

        // Graph nodes in manifest order, so ties keep declaration order.
        let mut nodes = Vec::new();
        let mut recipe_nodes = FxHashSet::default();
        for r in &self.manifest.resources {
            if let Some(out) = produced.get(&r.name) {
                for node in &out.resources {
                    if r.provisioning == ProvisioningMode::Recipe {
                        recipe_nodes.insert(node.local_id.clone());
                    }
                    nodes.push(node.clone());
                }
            }
        }
        let graph = match OutputGraph::build(nodes) {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(environment = %env, error = %e, "output graph rejected; nothing deployed");
                return Err(e.into());
            }
        };
        for report in reports.values_mut() {
            if report.mode == ProvisioningMode::Manual {
                report.advance(DeploymentState::Graphed);
            }
        }

        let deployed = self
            .deploy_waves(&graph, &recipe_nodes, deployer, &ctx, &mut reports)
            .await;

        for (name, report) in reports.iter_mut() {
            if report.state.is_terminal() {
                continue;
            }
            let Some(out) = produced.get(name) else {
                report.fail("no output produced");
                continue;
            };
            let resolved = deferred::resolve_computed(&deployed, &out.computed_values).and_then(
                |values| Ok((values, deferred::resolve_secrets(&deployed, &out.secret_values)?)),
            );
            match resolved {
                Ok((values, secrets)) => {
                    report.values = values;
                    report.secrets = secrets;
                    report.advance(DeploymentState::Resolved);
                }
                Err(e) => report.fail(e.to_string()),
            }
        }

        let record = self.build_record(&graph, &deployed, &recipe_nodes, &reports, previous);
        planner::save_record(&opts.state_dir, &record)?;

        for report in reports.values() {
            let event = match report.state {
                DeploymentState::Resolved => {
                    let prefix = format!("{}/", report.name);
                    let hashes: Vec<&str> = record
                        .resources
                        .iter()
                        .filter(|(k, _)| k.starts_with(&prefix))
                        .map(|(_, r)| r.hash.as_str())
                        .collect();
                    tracing::info!(resource = %report.name, values = report.values.len(), secrets = report.secrets.len(), "resolved");
                    ProvenanceEvent::ResourceResolved {
                        environment: env.to_string(),
                        resource: report.name.clone(),
                        duration_seconds: report.started.elapsed().as_secs_f64(),
                        hash: hasher::composite_hash(&hashes),
                    }
                }
                _ => ProvenanceEvent::ResourceFailed {
                    environment: env.to_string(),
                    resource: report.name.clone(),
                    state: report.failed_in.unwrap_or(report.state),
                    error: report.error.clone().unwrap_or_default(),
                },
            };
            emit(&log, event);
        }

        let report = DeployReport {
            run_id: run_id.clone(),
            order: graph.order_ids().into_iter().map(str::to_string).collect(),
            resources: reports.into_values().collect(),
            duration: start.elapsed(),
        };
        tracing::info!(environment = %env, %run_id, resolved = report.resolved(), failed = report.failed(), "deploy completed");
        emit(
            &log,
            ProvenanceEvent::DeployCompleted {
                environment: env.to_string(),
                run_id,
                resources_resolved: report.resolved() as u32,
                resources_failed: report.failed() as u32,
                total_seconds: report.duration.as_secs_f64(),
            },
        );
        Ok(report)
    }

    /// Deploy graph nodes wave by wave. Recipe nodes are already
    /// provisioned and are skipped; nodes whose dependencies failed are
    /// not started.
    async fn deploy_waves(
        &self,
        graph: &OutputGraph,
        recipe_nodes: &FxHashSet<String>,
        deployer: Arc<dyn Deployer>,
        ctx: &ExecutionContext,
        reports: &mut IndexMap<String, ResourceReport>,
    ) -> DeployedProperties {
        let mut deployed = DeployedProperties::new();
        let mut blocked: FxHashSet<usize> = FxHashSet::default();

        for wave in graph.waves() {
            let mut set = JoinSet::new();
            let mut pending = FxHashSet::default();
            for i in wave {
                let node = graph.node(i);
                let owner = owner_of(&node.local_id);
                if recipe_nodes.contains(&node.local_id) {
                    continue;
                }
                let fail = |reports: &mut IndexMap<String, ResourceReport>, msg: String| {
                    if let Some(report) = reports.get_mut(owner) {
                        report.fail(msg);
                    }
                };
                if let Some(&dep) = graph
                    .dependency_indices(i)
                    .iter()
                    .find(|d| blocked.contains(*d))
                {
                    blocked.insert(i);
                    fail(
                        reports,
                        format!(
                            "'{}' not deployed: dependency '{}' failed",
                            node.local_id,
                            graph.node(dep).local_id
                        ),
                    );
                    continue;
                }
                if ctx.cancel.is_cancelled() {
                    blocked.insert(i);
                    fail(reports, "deployment cancelled".to_string());
                    continue;
                }
                if let Some(report) = reports.get_mut(owner) {
                    if report.state == DeploymentState::Graphed {
                        report.advance(DeploymentState::Deploying);
                    }
                }

                tracing::debug!(local_id = %node.local_id, kind = %node.resource_type.kind, "deploying");
                let deployer = deployer.clone();
                let node = node.clone();
                let ctx = ctx.clone();
                pending.insert(i);
                set.spawn(async move {
                    let result = match bounded(&ctx, deployer.deploy(&node)).await {
                        Ok(r) => r,
                        Err(e) => Err(e.to_string()),
                    };
                    (i, result)
                });
            }

            while let Some(joined) = set.join_next().await {
                let (i, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!(error = %e, "deploy task aborted");
                        continue;
                    }
                };
                pending.remove(&i);
                let node = graph.node(i);
                match result {
                    Ok(bag) => {
                        deployed.insert(node.local_id.clone(), bag);
                    }
                    Err(e) => {
                        blocked.insert(i);
                        if let Some(report) = reports.get_mut(owner_of(&node.local_id)) {
                            report.fail(format!("deploy '{}' failed: {}", node.local_id, e));
                        }
                    }
                }
            }
            for i in pending {
                blocked.insert(i);
                let local_id = &graph.node(i).local_id;
                if let Some(report) = reports.get_mut(owner_of(local_id)) {
                    report.fail(format!("deploy '{}' aborted", local_id));
                }
            }
        }
        deployed
    }

    /// Record content hashes of everything now live. Entries of resources
    /// that failed this run are carried over from the previous record.
    fn build_record(
        &self,
        graph: &OutputGraph,
        deployed: &DeployedProperties,
        recipe_nodes: &FxHashSet<String>,
        reports: &IndexMap<String, ResourceReport>,
        previous: Option<DeploymentRecord>,
    ) -> DeploymentRecord {
        let mut record = DeploymentRecord::new(&self.manifest.environment);
        for node in graph.ordered() {
            let live = deployed.contains_key(&node.local_id)
                || (recipe_nodes.contains(&node.local_id)
                    && reports
                        .get(owner_of(&node.local_id))
                        .is_some_and(|r| r.state == DeploymentState::Resolved));
            if live {
                record.resources.insert(
                    node.local_id.clone(),
                    RecordedResource {
                        kind: node.resource_type.kind.clone(),
                        hash: hasher::hash_output_resource(node),
                        deployed_id: identity_id(&node.identity),
                    },
                );
            }
        }
        if let Some(prev) = previous {
            for (local_id, entry) in prev.resources {
                let owner_failed = reports
                    .get(owner_of(&local_id))
                    .is_some_and(|r| r.state == DeploymentState::Failed);
                if owner_failed && !record.resources.contains_key(&local_id) {
                    record.resources.insert(local_id, entry);
                }
            }
        }
        record
    }

    /// Tear down recipe resources in reverse manifest order using the ids
    /// the last deploy recorded. Successful deletes are dropped from the
    /// record.
    pub async fn delete_recipes(
        &self,
        opts: &DeployOptions,
    ) -> Result<Vec<(String, Result<(), DriverExecutionError>)>, KilnError> {
        let env = &self.manifest.environment;
        let mut record = planner::load_record(&opts.state_dir, env)?
            .unwrap_or_else(|| DeploymentRecord::new(env));
        let ctx = ExecutionContext::new(opts.cancel.clone(), opts.timeout);
        let mut results = Vec::new();

        for resource in self.manifest.resources.iter().rev() {
            if resource.provisioning != ProvisioningMode::Recipe {
                continue;
            }
            let prefix = format!("{}/", resource.name);
            let result = match self.recipe_for(resource) {
                Ok((recipe, driver)) => {
                    let mut metadata = self.metadata(resource);
                    metadata.deployed_resources = record
                        .resources
                        .iter()
                        .filter(|(k, _)| k.starts_with(&prefix))
                        .filter_map(|(_, r)| r.deployed_id.clone())
                        .collect();
                    let config = self.resource_configuration(resource);
                    tracing::info!(resource = %resource.name, recipe = %recipe.name, "deleting recipe resource");
                    driver.delete(&ctx, &recipe, &metadata, &config).await
                }
                Err(e) => Err(e),
            };
            if result.is_ok() {
                record.resources.retain(|k, _| !k.starts_with(&prefix));
            }
            results.push((resource.name.clone(), result));
        }
        planner::save_record(&opts.state_dir, &record)?;
        Ok(results)
    }
}
