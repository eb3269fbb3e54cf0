//! KL-008: Environment-scoped recipe registry.
//!
//! Recipes are keyed by `(resource type, name)`. A resource that does not
//! name a recipe gets the one registered as `default` for its type.

use super::error::ValidationError;
use super::gitsource;
use super::types::{DriverKind, Recipe};
use indexmap::IndexMap;

/// Recipe catalog for one environment.
#[derive(Debug, Clone, Default)]
pub struct RecipeRegistry {
    environment: String,
    recipes: IndexMap<(String, String), Recipe>,
}

impl RecipeRegistry {
    /// Build the registry, validating every recipe and rejecting duplicates.
    pub fn new(environment: &str, recipes: &[Recipe]) -> Result<Self, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut map = IndexMap::new();
        for r in recipes {
            if let Err(e) = validate_recipe(r) {
                errors.push(e);
                continue;
            }
            let key = (r.resource_type.to_ascii_lowercase(), r.name.clone());
            if map.insert(key, r.clone()).is_some() {
                errors.push(ValidationError::new(
                    format!("recipe/{}", r.name),
                    format!(
                        "recipe '{}' is registered twice for resource type '{}'",
                        r.name, r.resource_type
                    ),
                ));
            }
        }
        if errors.is_empty() {
            Ok(Self {
                environment: environment.to_string(),
                recipes: map,
            })
        } else {
            Err(errors)
        }
    }

    /// Look up a recipe. Resource types compare case-insensitively.
    pub fn get(&self, resource_type: &str, name: &str) -> Result<&Recipe, ValidationError> {
        self.recipes
            .get(&(resource_type.to_ascii_lowercase(), name.to_string()))
            .ok_or_else(|| {
                ValidationError::new(
                    format!("recipe/{}", name),
                    format!(
                        "recipe '{}' not found for resource type '{}' in environment '{}'",
                        name, resource_type, self.environment
                    ),
                )
            })
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
        self.recipes.values()
    }
}

/// Structural checks on one recipe registration.
pub fn validate_recipe(r: &Recipe) -> Result<(), ValidationError> {
    let owner = format!("recipe/{}", r.name);
    let err = |msg: String| Err(ValidationError::new(owner.clone(), msg));

    if r.name.is_empty() {
        return err("recipe name must not be empty".to_string());
    }
    if r.resource_type.is_empty() {
        return err("resource_type must be specified".to_string());
    }
    if r.template_path.is_empty() {
        return err("template_path must be specified".to_string());
    }

    let git = gitsource::is_git_source(&r.template_path);
    match r.driver {
        DriverKind::Bicep => {
            if git {
                return err("bicep recipes cannot reference git sources".to_string());
            }
            if r.template_version.is_some() {
                return err(
                    "template_version is only supported for terraform recipes".to_string(),
                );
            }
        }
        DriverKind::Terraform => {
            if r.plain_http {
                return err("plain_http is only supported for bicep recipes".to_string());
            }
            if git {
                if r.template_version.is_some() {
                    return err(
                        "template_version cannot be combined with a git source; pin with ?ref= instead"
                            .to_string(),
                    );
                }
                if let Err(e) = gitsource::resolve(&r.template_path) {
                    return err(e);
                }
            }
        }
    }
    Ok(())
}
