//! Session-scoped settings changes.

use hvctl_shared::HvctlResult;

use super::{MachineHandler, SessionGuard};
use crate::hypervisor::{LockType, Machine, MachineProperty, MutableMachine};
use crate::options::FaultPolicy;

impl MachineHandler {
    /// Apply `properties` in order and save them.
    pub fn set_machine_property(
        &self,
        name: &str,
        properties: impl IntoIterator<Item = MachineProperty>,
    ) -> HvctlResult<()> {
        self.with_machine_session(name, |machine| {
            for property in properties {
                tracing::debug!(%property, "Setting machine property");
                machine.set_property(property)?;
            }
            Ok(())
        })
    }

    /// Run `action` against the session-scoped machine, then save its settings.
    ///
    /// The session is released on every path. When `action` fails with a
    /// hypervisor fault the fault is logged and handled per
    /// [`FaultPolicy`](crate::options::FaultPolicy): by default whatever was
    /// applied before the fault is still saved. Any other error discards the
    /// pending changes. Either way the error is returned.
    pub fn with_machine_session<T, F>(&self, name: &str, action: F) -> HvctlResult<T>
    where
        F: FnOnce(&mut dyn MutableMachine) -> HvctlResult<T>,
    {
        let machine = self.machine(name)?;
        self.run_in_session(machine.as_ref(), action)
    }

    pub(super) fn run_in_session<T, F>(&self, machine: &dyn Machine, action: F) -> HvctlResult<T>
    where
        F: FnOnce(&mut dyn MutableMachine) -> HvctlResult<T>,
    {
        let name = machine.name();
        let mut guard =
            SessionGuard::acquire(self.hypervisor.as_ref(), machine, LockType::Shared)?;
        let mutable = guard.session_mut()?.machine()?;

        let error = match action(&mut *mutable) {
            Ok(value) => {
                mutable.save_settings()?;
                guard.release()?;
                return Ok(value);
            }
            Err(e) => e,
        };

        if error.is_hypervisor_fault() {
            tracing::warn!(
                machine = %name,
                error = %error,
                policy = ?self.options.fault_policy,
                "Hypervisor fault in machine session"
            );
            let outcome = match self.options.fault_policy {
                FaultPolicy::PersistApplied => mutable.save_settings(),
                FaultPolicy::Discard => mutable.discard_settings(),
            };
            if let Err(e) = outcome {
                tracing::warn!(machine = %name, error = %e, "Failed to settle partial changes");
            }
        } else if let Err(e) = mutable.discard_settings() {
            tracing::warn!(machine = %name, error = %e, "Failed to discard pending changes");
        }

        if let Err(e) = guard.release() {
            tracing::warn!(machine = %name, error = %e, "Failed to release session");
        }
        Err(error)
    }
}
