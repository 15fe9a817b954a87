//! Machine handler: named operations over the hypervisor API.
//!
//! Every operation looks the machine up by name first, so an unknown name fails
//! with `NotFound` before the hypervisor is touched. Mutations go through a
//! [`SessionGuard`], which releases the session on every exit path.

mod lifecycle;
mod registry;
mod session;
mod settings;
mod storage;

pub use registry::MachineRegistry;
pub use session::SessionGuard;

use std::sync::Arc;

use hvctl_shared::{HvctlError, HvctlResult};
use serde::{Deserialize, Serialize};

use crate::hypervisor::{Hypervisor, Machine, MachineId, MachineProperty, MachineState, PropertyKey};
use crate::layout::SettingsLayout;
use crate::options::HandlerOptions;

/// Entry of [`MachineHandler::list_machines`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSummary {
    pub name: String,
    pub id: MachineId,
}

pub struct MachineHandler {
    hypervisor: Arc<dyn Hypervisor>,
    registry: MachineRegistry,
    layout: SettingsLayout,
    options: HandlerOptions,
}

impl std::fmt::Debug for MachineHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineHandler")
            .field("settings_dir", &self.layout.root())
            .field("options", &self.options)
            .finish()
    }
}

impl MachineHandler {
    /// Build a handler over `hypervisor` and load its machines.
    ///
    /// # Errors
    ///
    /// - `Config` if the settings directory is not absolute
    /// - `Storage` if the settings directory cannot be prepared
    /// - any error from enumerating the hypervisor's machines
    pub fn new(hypervisor: Arc<dyn Hypervisor>, options: HandlerOptions) -> HvctlResult<Self> {
        if !options.settings_dir.is_absolute() {
            return Err(HvctlError::Config(format!(
                "settings_dir must be absolute path, got: {}",
                options.settings_dir.display()
            )));
        }
        if options.disk_size_bytes == 0 {
            return Err(HvctlError::Config("disk_size_bytes must be greater than zero".into()));
        }

        let layout = SettingsLayout::new(options.settings_dir.clone());
        layout.prepare().map_err(|e| {
            HvctlError::Storage(format!(
                "Failed to initialize settings directory at {}: {}",
                layout.root().display(),
                e
            ))
        })?;

        let handler = Self {
            hypervisor,
            registry: MachineRegistry::new(),
            layout,
            options,
        };
        let count = handler.reload()?;
        tracing::debug!(
            settings_dir = %handler.layout.root().display(),
            machines = count,
            "Initialized machine handler"
        );
        Ok(handler)
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    pub fn layout(&self) -> &SettingsLayout {
        &self.layout
    }

    /// Registered machines, sorted by name.
    pub fn list_machines(&self) -> HvctlResult<Vec<MachineSummary>> {
        Ok(self
            .registry
            .list()?
            .into_iter()
            .map(|(name, id)| MachineSummary { name, id })
            .collect())
    }

    /// Re-enumerate the hypervisor, picking up changes made by other clients.
    ///
    /// Returns the number of machines now known.
    pub fn reload(&self) -> HvctlResult<usize> {
        let machines = self.hypervisor.machines()?;
        self.registry.replace_all(machines)
    }

    /// Read a property from the machine's saved settings. No session is taken.
    pub fn get_machine_property(&self, name: &str, key: PropertyKey) -> HvctlResult<MachineProperty> {
        let machine = self.machine(name)?;
        machine.property(key)
    }

    pub fn machine_state(&self, name: &str) -> HvctlResult<MachineState> {
        self.machine(name)?.state()
    }

    fn machine(&self, name: &str) -> HvctlResult<Arc<dyn Machine>> {
        self.registry.get(name)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::hypervisor::MemoryHypervisor;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub handler: MachineHandler,
        pub hypervisor: MemoryHypervisor,
        pub _home: TempDir,
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    pub(crate) fn fixture_with(configure: impl FnOnce(&mut HandlerOptions)) -> Fixture {
        let home = tempfile::tempdir().unwrap();
        let hypervisor = MemoryHypervisor::new();
        let mut options = HandlerOptions::with_settings_dir(home.path());
        configure(&mut options);
        let handler = MachineHandler::new(Arc::new(hypervisor.clone()), options).unwrap();
        Fixture {
            handler,
            hypervisor,
            _home: home,
        }
    }
}
