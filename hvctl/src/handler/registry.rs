//! Thread-safe name → machine handle registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use hvctl_shared::{HvctlError, HvctlResult};

use crate::hypervisor::{Machine, MachineId};

/// Machines known to the handler, keyed by name.
///
/// Filled from the hypervisor's enumeration at construction and updated by the
/// handler's own create and remove. Changes made by other clients are only
/// picked up by [`replace_all`](Self::replace_all).
#[derive(Clone, Default)]
pub struct MachineRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Machine>>>>,
}

impl std::fmt::Debug for MachineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineRegistry").finish()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> HvctlError {
    HvctlError::Internal(format!("registry lock poisoned: {}", e))
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a machine under its own name.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is taken.
    pub fn register(&self, machine: Arc<dyn Machine>) -> HvctlResult<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;

        let name = machine.name().to_string();
        if inner.contains_key(&name) {
            return Err(HvctlError::AlreadyExists(format!("machine '{}'", name)));
        }

        tracing::debug!(machine = %name, machine_id = %machine.id(), "Registering machine");
        inner.insert(name, machine);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> HvctlResult<bool> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.contains_key(name))
    }

    /// Look up a machine by name.
    pub fn get(&self, name: &str) -> HvctlResult<Arc<dyn Machine>> {
        let inner = self.inner.read().map_err(poisoned)?;
        inner
            .get(name)
            .cloned()
            .ok_or_else(|| HvctlError::NotFound(format!("machine '{}'", name)))
    }

    pub fn remove(&self, name: &str) -> HvctlResult<Arc<dyn Machine>> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        tracing::debug!(machine = %name, "Removing machine from registry");
        inner
            .remove(name)
            .ok_or_else(|| HvctlError::NotFound(format!("machine '{}'", name)))
    }

    /// Names and ids, sorted by name.
    pub fn list(&self) -> HvctlResult<Vec<(String, MachineId)>> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut entries: Vec<(String, MachineId)> = inner
            .iter()
            .map(|(name, machine)| (name.clone(), machine.id()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Replace the contents with a fresh enumeration.
    ///
    /// When several machines share a name the first one wins; the others are
    /// logged and left out.
    pub fn replace_all(&self, machines: Vec<Arc<dyn Machine>>) -> HvctlResult<usize> {
        let mut fresh: HashMap<String, Arc<dyn Machine>> = HashMap::with_capacity(machines.len());
        for machine in machines {
            let name = machine.name().to_string();
            if fresh.contains_key(&name) {
                tracing::warn!(
                    machine = %name,
                    machine_id = %machine.id(),
                    "Duplicate machine name, ignoring"
                );
                continue;
            }
            fresh.insert(name, machine);
        }

        let count = fresh.len();
        let mut inner = self.inner.write().map_err(poisoned)?;
        *inner = fresh;
        Ok(count)
    }
}
