//! KL-022: Deployment records and plan generation — diff the rendered output
//! graph against what the last deploy recorded.

use super::error::KilnError;
use super::graph::OutputGraph;
use crate::tripwire::hasher;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// What the last deploy of an environment produced, keyed by namespaced LocalID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub schema: String,
    pub environment: String,
    pub generated_at: String,
    pub generator: String,
    #[serde(default)]
    pub resources: IndexMap<String, RecordedResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedResource {
    #[serde(rename = "type")]
    pub kind: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_id: Option<String>,
}

impl DeploymentRecord {
    pub fn new(environment: &str) -> Self {
        Self {
            schema: "1.0".to_string(),
            environment: environment.to_string(),
            generated_at: crate::tripwire::eventlog::now_iso8601(),
            generator: format!("kiln {}", env!("CARGO_PKG_VERSION")),
            resources: IndexMap::new(),
        }
    }
}

/// `{state_dir}/{environment}/record.yaml`
pub fn record_path(state_dir: &Path, environment: &str) -> PathBuf {
    state_dir.join(environment).join("record.yaml")
}

/// Load an environment's record. Returns None if it was never deployed.
pub fn load_record(state_dir: &Path, environment: &str) -> Result<Option<DeploymentRecord>, KilnError> {
    let path = record_path(state_dir, environment);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| KilnError::io(&path, e))?;
    let record = serde_yaml_ng::from_str(&content)
        .map_err(|e| KilnError::Parse(format!("invalid record {}: {}", path.display(), e)))?;
    Ok(Some(record))
}

/// Save a record atomically (write to temp, then rename).
pub fn save_record(state_dir: &Path, record: &DeploymentRecord) -> Result<(), KilnError> {
    let path = record_path(state_dir, &record.environment);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KilnError::io(parent, e))?;
    }
    let yaml = serde_yaml_ng::to_string(record)
        .map_err(|e| KilnError::Parse(format!("serialize error: {}", e)))?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| KilnError::io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| KilnError::io(&path, e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    Create,
    Update,
    Delete,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanAction::Create => "create",
            PlanAction::Update => "update",
            PlanAction::Delete => "delete",
            PlanAction::NoOp => "no-op",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedChange {
    pub local_id: String,
    pub kind: String,
    pub action: PlanAction,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionPlan {
    pub environment: String,
    pub changes: Vec<PlannedChange>,
    pub to_create: u32,
    pub to_update: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

impl ExecutionPlan {
    pub fn has_changes(&self) -> bool {
        self.to_create + self.to_update + self.to_delete > 0
    }

    fn count(&mut self, action: PlanAction) {
        match action {
            PlanAction::Create => self.to_create += 1,
            PlanAction::Update => self.to_update += 1,
            PlanAction::Delete => self.to_delete += 1,
            PlanAction::NoOp => self.unchanged += 1,
        }
    }
}

/// Diff the graph (in deployment order) against the previous record.
/// Recorded LocalIDs absent from the graph are planned for deletion, in
/// reverse record order.
pub fn plan(
    environment: &str,
    graph: &OutputGraph,
    previous: Option<&DeploymentRecord>,
) -> ExecutionPlan {
    let mut out = ExecutionPlan {
        environment: environment.to_string(),
        ..Default::default()
    };
    for node in graph.ordered() {
        let hash = hasher::hash_output_resource(node);
        let action = match previous.and_then(|r| r.resources.get(&node.local_id)) {
            None => PlanAction::Create,
            Some(rec) if rec.hash == hash => PlanAction::NoOp,
            Some(_) => PlanAction::Update,
        };
        out.count(action);
        out.changes.push(PlannedChange {
            local_id: node.local_id.clone(),
            kind: node.resource_type.kind.clone(),
            action,
        });
    }
    if let Some(prev) = previous {
        for (local_id, rec) in prev.resources.iter().rev() {
            if graph.index_of(local_id).is_none() {
                out.count(PlanAction::Delete);
                out.changes.push(PlannedChange {
                    local_id: local_id.clone(),
                    kind: rec.kind.clone(),
                    action: PlanAction::Delete,
                });
            }
        }
    }
    out
}
