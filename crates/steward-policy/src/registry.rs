//! The action registry: the catalog of operation types the loop may run.

use crate::error::{RegistryError, ValidationError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use steward_core::{ActionSpec, Reversibility};

/// Catalog of registered actions with their compiled parameter schemas.
///
/// Populated once at startup, then shared read-only.
#[derive(Default)]
pub struct ActionRegistry {
    specs: BTreeMap<String, ActionSpec>,
    validators: BTreeMap<String, jsonschema::Validator>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.specs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every spec, then check that compensation references resolve.
    pub fn from_specs(specs: impl IntoIterator<Item = ActionSpec>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        registry.verify()?;
        Ok(registry)
    }

    /// Add an action. Fails with `DuplicateAction` if the name is taken.
    pub fn register(&mut self, spec: ActionSpec) -> Result<(), RegistryError> {
        if self.specs.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateAction(spec.name));
        }
        match (spec.reversibility, &spec.compensation) {
            (Reversibility::Compensable, None) => {
                return Err(RegistryError::MissingCompensation(spec.name));
            }
            (Reversibility::Irreversible, Some(_)) => {
                return Err(RegistryError::IrreversibleCompensation(spec.name));
            }
            _ => {}
        }

        let validator = jsonschema::validator_for(&spec.params_schema).map_err(|e| {
            RegistryError::InvalidSchema {
                action: spec.name.clone(),
                message: e.to_string(),
            }
        })?;

        tracing::debug!(
            action = %spec.name,
            category = %spec.category,
            risk = %spec.risk,
            reversibility = %spec.reversibility,
            "registered action"
        );
        self.validators.insert(spec.name.clone(), validator);
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Check cross-references between registered actions.
    pub fn verify(&self) -> Result<(), RegistryError> {
        for spec in self.specs.values() {
            if let Some(comp) = &spec.compensation {
                if !self.specs.contains_key(&comp.action) {
                    return Err(RegistryError::UnknownCompensation {
                        action: spec.name.clone(),
                        compensation: comp.action.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&ActionSpec, RegistryError> {
        self.specs
            .get(name)
            .ok_or_else(|| RegistryError::UnknownAction(name.to_string()))
    }

    /// Check `params` against the action's declared schema.
    pub fn validate_parameters(
        &self,
        spec: &ActionSpec,
        params: &Value,
    ) -> Result<(), ValidationError> {
        if !params.is_object() {
            return Err(ValidationError::not_an_object(&spec.name));
        }
        let validator = self
            .validators
            .get(&spec.name)
            .ok_or_else(|| ValidationError::schema_unavailable(&spec.name))?;

        let violations: Vec<String> = validator
            .iter_errors(params)
            .map(|e| {
                let path = e.instance_path().to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::schema_violation(&spec.name, &violations))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionSpec> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
