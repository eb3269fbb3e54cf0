//! KL-005: Deferred value resolution against deployed property bags.

use super::error::ResolutionError;
use super::types::{ComputedValueReference, Secret, SecretValueReference, ValueRef};
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;

/// Property bags returned by the deployer, keyed by LocalID.
pub type DeployedProperties = IndexMap<String, Value>;

/// Resolved secrets. Kept apart from computed values; `Debug` lists names only.
#[derive(Clone, Default, PartialEq)]
pub struct ResolvedSecrets(IndexMap<String, Secret>);

impl ResolvedSecrets {
    pub fn get(&self, name: &str) -> Option<&Secret> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, name: String, secret: Secret) {
        self.0.insert(name, secret);
    }
}

impl fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

fn resolve_one(
    name: &str,
    source: &ValueRef,
    deployed: &DeployedProperties,
) -> Result<Value, ResolutionError> {
    let (local_id, pointer) = match source {
        ValueRef::Literal { value } => return Ok(value.clone()),
        ValueRef::Reference { local_id, pointer } => (local_id, pointer),
    };
    let fail = |reason: &str| ResolutionError {
        name: name.to_string(),
        local_id: local_id.clone(),
        pointer: pointer.clone(),
        reason: reason.to_string(),
    };
    if !pointer.is_empty() && !pointer.starts_with('/') {
        return Err(fail("malformed property pointer"));
    }
    let bag = deployed
        .get(local_id)
        .ok_or_else(|| fail("output resource was not deployed"))?;
    bag.pointer(pointer)
        .cloned()
        .ok_or_else(|| fail("property not found in deployed object"))
}

/// Resolve computed values. Literals pass through unchanged.
pub fn resolve_computed(
    deployed: &DeployedProperties,
    values: &IndexMap<String, ComputedValueReference>,
) -> Result<IndexMap<String, Value>, ResolutionError> {
    let mut out = IndexMap::with_capacity(values.len());
    for (name, v) in values {
        out.insert(name.clone(), resolve_one(name, v.source(), deployed)?);
    }
    Ok(out)
}

/// Resolve secret values into their own map.
pub fn resolve_secrets(
    deployed: &DeployedProperties,
    values: &IndexMap<String, SecretValueReference>,
) -> Result<ResolvedSecrets, ResolutionError> {
    let mut out = ResolvedSecrets::default();
    for (name, v) in values {
        let value = resolve_one(name, v.source(), deployed)?;
        out.insert(name.clone(), Secret::new(value));
    }
    Ok(out)
}
