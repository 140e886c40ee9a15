//! Deployed definitions, versions and document checksums.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

use crate::compiler::CompiledProcess;
use crate::document::ProcessDocument;
use crate::types::ProcessDefinition;

/// A cached definition plus its activation flag.
#[derive(Clone, Debug)]
pub struct DeployedProcess {
    pub compiled: CompiledProcess,
    pub suspended: bool,
}

impl DeployedProcess {
    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.compiled.definition
    }
}

/// Executable definitions by id. Non-executable processes never enter the cache.
#[derive(Default)]
pub struct DeploymentCache {
    definitions: RwLock<HashMap<String, DeployedProcess>>,
}

impl DeploymentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, compiled: CompiledProcess) -> Result<()> {
        let mut defs = self.definitions.write().map_err(|e| anyhow!("Lock: {}", e))?;
        defs.insert(
            compiled.definition.id.clone(),
            DeployedProcess {
                compiled,
                suspended: false,
            },
        );
        Ok(())
    }

    pub fn get(&self, process_definition_id: &str) -> Result<Option<DeployedProcess>> {
        let defs = self.definitions.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(defs.get(process_definition_id).cloned())
    }

    /// Highest version deployed for `key`.
    pub fn latest(&self, key: &str) -> Result<Option<DeployedProcess>> {
        let defs = self.definitions.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(defs
            .values()
            .filter(|d| d.compiled.definition.key == key)
            .max_by_key(|d| d.compiled.definition.version)
            .cloned())
    }

    pub fn next_version(&self, key: &str) -> Result<u32> {
        Ok(self
            .latest(key)?
            .map_or(1, |d| d.compiled.definition.version + 1))
    }

    /// Returns `false` if the definition is unknown.
    pub fn set_suspended(&self, process_definition_id: &str, suspended: bool) -> Result<bool> {
        let mut defs = self.definitions.write().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(match defs.get_mut(process_definition_id) {
            Some(deployed) => {
                deployed.suspended = suspended;
                true
            }
            None => false,
        })
    }

    /// Process key whose latest version starts on `message_name`.
    pub fn message_owner(&self, message_name: &str) -> Result<Option<String>> {
        let keys: Vec<String> = {
            let defs = self.definitions.read().map_err(|e| anyhow!("Lock: {}", e))?;
            let mut keys: Vec<String> = defs
                .values()
                .map(|d| d.compiled.definition.key.clone())
                .collect();
            keys.sort();
            keys.dedup();
            keys
        };
        for key in keys {
            if let Some(latest) = self.latest(&key)? {
                let starts_on_it = latest
                    .compiled
                    .definition
                    .message_starts()
                    .iter()
                    .any(|(_, name)| *name == message_name);
                if starts_on_it {
                    return Ok(Some(key));
                }
            }
        }
        Ok(None)
    }

    pub fn for_deployment(&self, deployment_id: &str) -> Result<Vec<DeployedProcess>> {
        let defs = self.definitions.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut found: Vec<DeployedProcess> = defs
            .values()
            .filter(|d| d.compiled.definition.deployment_id == deployment_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.compiled.definition.id.cmp(&b.compiled.definition.id));
        Ok(found)
    }

    pub fn remove_deployment(&self, deployment_id: &str) -> Result<Vec<DeployedProcess>> {
        let mut defs = self.definitions.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let ids: Vec<String> = defs
            .values()
            .filter(|d| d.compiled.definition.deployment_id == deployment_id)
            .map(|d| d.compiled.definition.id.clone())
            .collect();
        Ok(ids.iter().filter_map(|id| defs.remove(id)).collect())
    }

    /// Every cached definition, by key then version.
    pub fn all(&self) -> Result<Vec<Arc<ProcessDefinition>>> {
        let defs = self.definitions.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut all: Vec<Arc<ProcessDefinition>> = defs
            .values()
            .map(|d| Arc::clone(&d.compiled.definition))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(all)
    }
}

/// Hex SHA-256 over the document's canonical JSON form.
pub fn document_checksum(document: &ProcessDocument) -> Result<String> {
    let canonical = serde_json::to_vec(document)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}
