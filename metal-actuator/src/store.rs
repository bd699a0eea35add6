//! Write-back of Machine changes to the orchestration runtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use metal_apis::Machine;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MachineClientError {
    #[error("machine {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid machine document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Patch access to stored Machines.
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Write metadata and spec of `machine`. `original` is the object as it
    /// was read at the start of the call.
    async fn patch_machine(
        &self,
        original: &Machine,
        machine: &Machine,
    ) -> Result<(), MachineClientError>;

    /// Write the status of `machine`.
    async fn patch_machine_status(&self, machine: &Machine) -> Result<(), MachineClientError>;
}

fn key(machine: &Machine) -> (String, String) {
    (machine.namespace().to_string(), machine.name().to_string())
}

fn not_found(machine: &Machine) -> MachineClientError {
    MachineClientError::NotFound {
        namespace: machine.namespace().to_string(),
        name: machine.name().to_string(),
    }
}

/// In-memory Machine store.
#[derive(Default)]
pub struct MemoryMachineClient {
    machines: RwLock<HashMap<(String, String), Machine>>,
}

impl MemoryMachineClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, machine: Machine) {
        self.machines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key(&machine), machine);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Machine> {
        self.machines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl MachineClient for MemoryMachineClient {
    async fn patch_machine(
        &self,
        _original: &Machine,
        machine: &Machine,
    ) -> Result<(), MachineClientError> {
        let mut machines = self
            .machines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stored = machines.get_mut(&key(machine)).ok_or_else(|| not_found(machine))?;
        stored.metadata = machine.metadata.clone();
        stored.spec = machine.spec.clone();
        Ok(())
    }

    async fn patch_machine_status(&self, machine: &Machine) -> Result<(), MachineClientError> {
        let mut machines = self
            .machines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let stored = machines.get_mut(&key(machine)).ok_or_else(|| not_found(machine))?;
        stored.status = machine.status.clone();
        Ok(())
    }
}

/// A single Machine kept as a JSON document on disk.
pub struct FileMachineClient {
    path: PathBuf,
}

impl FileMachineClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the Machine document.
    pub async fn load(&self) -> Result<Machine, MachineClientError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| MachineClientError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Replace the document, going through a temp file so readers never see
    /// a partial write.
    async fn store(&self, machine: &Machine) -> Result<(), MachineClientError> {
        let io_err = |source: std::io::Error| MachineClientError::Io {
            path: self.path.clone(),
            source,
        };
        let mut bytes = serde_json::to_vec_pretty(machine)?;
        bytes.push(b'\n');

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!("Wrote machine {} to {}", machine.name(), self.path.display());
        Ok(())
    }

    async fn load_matching(&self, machine: &Machine) -> Result<Machine, MachineClientError> {
        let stored = self.load().await?;
        if key(&stored) != key(machine) {
            return Err(not_found(machine));
        }
        Ok(stored)
    }
}

#[async_trait]
impl MachineClient for FileMachineClient {
    async fn patch_machine(
        &self,
        _original: &Machine,
        machine: &Machine,
    ) -> Result<(), MachineClientError> {
        let mut stored = self.load_matching(machine).await?;
        stored.metadata = machine.metadata.clone();
        stored.spec = machine.spec.clone();
        self.store(&stored).await
    }

    async fn patch_machine_status(&self, machine: &Machine) -> Result<(), MachineClientError> {
        let mut stored = self.load_matching(machine).await?;
        stored.status = machine.status.clone();
        self.store(&stored).await
    }
}
