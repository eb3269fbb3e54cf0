//! KL-009: Manifest parsing and validation.
//!
//! Parses kiln.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Resource names are unique and usable as LocalID namespaces
//! - Exactly one provisioning mode per resource
//! - Recipe-mode resources reference a registered recipe
//! - Git auth material is internally consistent

use super::error::{KilnError, ValidationError};
use super::gitsource;
use super::recipe::RecipeRegistry;
use super::types::{Manifest, ProvisioningMode, Resource};
use std::collections::HashSet;
use std::path::Path;

/// Parse a kiln.yaml file from disk.
pub fn parse_manifest_file(path: &Path) -> Result<Manifest, KilnError> {
    let content = std::fs::read_to_string(path).map_err(|e| KilnError::io(path, e))?;
    parse_manifest(&content)
}

/// Parse a kiln.yaml from a string.
pub fn parse_manifest(yaml: &str) -> Result<Manifest, KilnError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| KilnError::Parse(format!("YAML parse error: {}", e)))
}

/// Provisioning-mode exclusivity and per-resource auth checks.
pub fn validate_resource(resource: &Resource) -> Result<(), ValidationError> {
    match resource.provisioning {
        ProvisioningMode::Manual => {
            if resource.recipe.is_some() {
                return Err(ValidationError::new(
                    &resource.name,
                    "recipe details cannot be specified when resourceProvisioning is set to manual",
                ));
            }
        }
        ProvisioningMode::Recipe => {
            if !resource.properties.is_empty() || !resource.secrets.is_empty() {
                return Err(ValidationError::new(
                    &resource.name,
                    "manual provisioning fields cannot be specified when resourceProvisioning is set to recipe",
                ));
            }
        }
    }
    for (host, auth) in &resource.git_auth {
        gitsource::validate_auth(&resource.name, host, auth)?;
    }
    Ok(())
}

/// Validate a parsed manifest. Returns a list of errors (empty = valid).
pub fn validate_manifest(manifest: &Manifest) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if manifest.version != "1.0" {
        errors.push(ValidationError::new(
            "manifest",
            format!("version must be \"1.0\", got \"{}\"", manifest.version),
        ));
    }
    if manifest.environment.is_empty() {
        errors.push(ValidationError::new(
            "manifest",
            "environment must not be empty",
        ));
    }

    for (host, auth) in &manifest.recipe_config.git.pat {
        if let Err(e) = gitsource::validate_auth("environment", host, auth) {
            errors.push(e);
        }
    }

    let registry = match RecipeRegistry::new(&manifest.environment, &manifest.recipes) {
        Ok(r) => Some(r),
        Err(errs) => {
            errors.extend(errs);
            None
        }
    };

    let mut seen = HashSet::new();
    for resource in &manifest.resources {
        if resource.name.is_empty() || resource.name.contains('/') {
            errors.push(ValidationError::new(
                &resource.name,
                "resource name must be non-empty and must not contain '/'",
            ));
        }
        if !seen.insert(resource.name.as_str()) {
            errors.push(ValidationError::new(
                &resource.name,
                "duplicate resource name",
            ));
        }
        if let Err(e) = validate_resource(resource) {
            errors.push(e);
            continue;
        }
        if resource.provisioning == ProvisioningMode::Recipe {
            let name = resource
                .recipe
                .as_ref()
                .map(|r| r.name.as_str())
                .unwrap_or("default");
            if let Some(reg) = &registry {
                if let Err(mut e) = reg.get(&resource.resource_type, name) {
                    e.resource = resource.name.clone();
                    errors.push(e);
                }
            }
        }
    }

    errors
}
