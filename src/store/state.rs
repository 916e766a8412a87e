use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::{CurrentState, DeploymentKey};
use super::{ObjectStore, STATE_FILENAME};

/// One entry of the persisted state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct StateEntry {
    deployment: DeploymentKey,
    current_state: CurrentState,
}

/// The persisted state document: the set of deployments that currently
/// exist, keyed by deployment triple.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct StateDocument {
    deployments: Vec<StateEntry>,
}

/// In-memory view of the persisted package state. Mutations happen only on
/// the supervisor side of a run; `save` persists a new version of the whole
/// document when the content changed since the last save.
#[derive(Debug, Default)]
pub struct StateStore {
    deployments: HashMap<DeploymentKey, CurrentState>,
    saved: HashMap<DeploymentKey, CurrentState>,
}

impl StateStore {
    /// Load the state document from the object store. A missing document
    /// yields an empty store (first run).
    pub async fn load(store: &dyn ObjectStore) -> Result<Self> {
        let deployments = match store.get(STATE_FILENAME).await? {
            Some(body) => {
                let doc: StateDocument = serde_json::from_slice(&body)
                    .context("The package state document is malformed")?;
                doc.deployments
                    .into_iter()
                    .map(|entry| (entry.deployment, entry.current_state))
                    .collect()
            }
            None => {
                debug!("No package state document found, starting empty");
                HashMap::new()
            }
        };
        Ok(Self {
            saved: deployments.clone(),
            deployments,
        })
    }

    /// Persist the state document if it changed since the last save.
    /// Returns true if a new version was written.
    pub async fn save(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        if self.deployments == self.saved {
            return Ok(false);
        }
        debug!(deployments = self.deployments.len(), "Saving the package state");
        let mut entries: Vec<StateEntry> = self
            .deployments
            .iter()
            .map(|(key, state)| StateEntry {
                deployment: key.clone(),
                current_state: state.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.deployment.cmp(&b.deployment));
        let doc = StateDocument {
            deployments: entries,
        };
        let body = serde_json::to_vec_pretty(&doc)?;
        store.put(STATE_FILENAME, &body).await?;
        self.saved = self.deployments.clone();
        Ok(true)
    }

    pub fn get(&self, key: &DeploymentKey) -> Option<&CurrentState> {
        self.deployments.get(key)
    }

    pub fn insert(&mut self, key: DeploymentKey, state: CurrentState) {
        self.deployments.insert(key, state);
    }

    pub fn remove(&mut self, key: &DeploymentKey) -> Option<CurrentState> {
        self.deployments.remove(key)
    }

    pub fn contains(&self, key: &DeploymentKey) -> bool {
        self.deployments.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DeploymentKey> {
        self.deployments.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeploymentKey, &CurrentState)> {
        self.deployments.iter()
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }
}
