use std::collections::HashMap;
use std::path::Path;

use gatehouse_contracts::{schema_body, ActionSpec, ACTION_REGISTRY_SCHEMA};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("read action registry failed: {0}")]
    Read(String),
    #[error("parse action registry failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("duplicate action id: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    actions: Vec<ActionSpec>,
}

/// Catalog of action specs. Built once; there is no way to add, replace or
/// remove a spec afterwards, so shared references are safe to read from any
/// thread.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    by_id: HashMap<String, ActionSpec>,
}

impl ActionRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| RegistryError::Read(e.to_string()))?;
        let registry = Self::from_yaml_str(&text)?;
        info!(
            path = %path.display(),
            actions = registry.len(),
            "action registry loaded"
        );
        Ok(registry)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| RegistryError::Parse(e.to_string()))?;
        let instance =
            serde_json::to_value(value).map_err(|e| RegistryError::Parse(e.to_string()))?;
        validate_against_schema(&instance)?;

        let doc: RegistryDocument =
            serde_json::from_value(instance).map_err(|e| RegistryError::Parse(e.to_string()))?;
        Self::from_specs(doc.actions)
    }

    pub fn from_specs(specs: impl IntoIterator<Item = ActionSpec>) -> Result<Self, RegistryError> {
        let mut by_id = HashMap::new();
        for spec in specs {
            if by_id.contains_key(&spec.id) {
                return Err(RegistryError::DuplicateId(spec.id));
            }
            by_id.insert(spec.id.clone(), spec);
        }
        Ok(Self { by_id })
    }

    pub fn get(&self, action_id: &str) -> Option<&ActionSpec> {
        self.by_id.get(action_id)
    }

    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Specs in `list_ids` order.
    pub fn specs(&self) -> impl Iterator<Item = &ActionSpec> + '_ {
        self.list_ids()
            .into_iter()
            .filter_map(move |id| self.by_id.get(&id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), RegistryError> {
    let schema_text = schema_body(ACTION_REGISTRY_SCHEMA).ok_or_else(|| {
        RegistryError::SchemaLoad(format!("{ACTION_REGISTRY_SCHEMA} is not embedded"))
    })?;
    let schema: serde_json::Value =
        serde_json::from_str(schema_text).map_err(|e| RegistryError::SchemaLoad(e.to_string()))?;
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| RegistryError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(RegistryError::SchemaValidation(first.to_string()));
    }
    Ok(())
}
