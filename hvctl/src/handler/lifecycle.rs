//! Create, start, stop and remove.

use hvctl_shared::{HvctlError, HvctlResult};

use super::{MachineHandler, SessionGuard};
use crate::hypervisor::{CleanupMode, LaunchMode, LockType, Machine, OsKind};
use crate::layout::validate_name;

impl MachineHandler {
    /// Create and register a machine.
    ///
    /// `kind` must be one of the allowlisted OS kinds (`Linux`, `MacOS`).
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a kind outside the allowlist or an unusable name
    /// - `AlreadyExists` if the name is already registered
    pub fn create_machine(&self, name: &str, kind: &str) -> HvctlResult<()> {
        let os: OsKind = kind.parse()?;
        validate_name("machine", name)?;
        if self.registry.contains(name)? {
            return Err(HvctlError::AlreadyExists(format!("machine '{}'", name)));
        }

        let settings_file = self.layout.machine_settings_file(name);
        tracing::debug!(
            machine = %name,
            os = %os,
            settings_file = %settings_file.display(),
            "Creating machine"
        );

        let machine = self.hypervisor.create_machine(&settings_file, name, os)?;
        if let Err(e) = machine
            .save_settings()
            .and_then(|()| self.hypervisor.register_machine(machine.as_ref()))
        {
            discard_unregistered(machine.as_ref());
            return Err(e);
        }

        let id = machine.id();
        self.registry.register(machine)?;
        tracing::info!(machine = %name, machine_id = %id, "Created machine");
        Ok(())
    }

    /// Launch the machine's VM process and wait until it is up.
    pub fn start_machine(&self, name: &str, mode: LaunchMode) -> HvctlResult<()> {
        let machine = self.machine(name)?;

        let mut guard = SessionGuard::unlocked(self.hypervisor.as_ref(), machine.as_ref())?;
        let mut progress = guard
            .session_mut()?
            .launch_vm_process(machine.id(), mode)?;
        progress.wait_for_completion(None)?;
        guard.release()?;

        tracing::info!(machine = %name, %mode, "Started machine");
        Ok(())
    }

    /// Power the machine off through its console and wait for completion.
    pub fn stop_machine(&self, name: &str) -> HvctlResult<()> {
        let machine = self.machine(name)?;

        // A running machine only admits shared locks; the console is what grants control.
        let mut guard =
            SessionGuard::acquire(self.hypervisor.as_ref(), machine.as_ref(), LockType::Shared)?;
        let mut progress = guard.session_mut()?.console()?.power_down()?;
        progress.wait_for_completion(None)?;
        guard.release()?;

        tracing::info!(machine = %name, "Stopped machine");
        Ok(())
    }

    /// Unregister the machine and delete its settings together with its disks.
    ///
    /// The name is dropped from the registry as soon as the hypervisor has
    /// unregistered the machine, so a failure while deleting files still
    /// leaves the name free.
    pub fn remove_machine(&self, name: &str) -> HvctlResult<()> {
        let machine = self.machine(name)?;

        let media = machine.unregister(CleanupMode::Full)?;
        self.registry.remove(name)?;
        tracing::debug!(machine = %name, media = media.len(), "Unregistered machine");

        let mut progress = machine.delete_config(media)?;
        progress.wait_for_completion(None)?;

        tracing::info!(machine = %name, "Removed machine");
        Ok(())
    }
}

/// Delete whatever a failed create left behind for an unregistered machine.
fn discard_unregistered(machine: &dyn Machine) {
    let outcome = machine
        .delete_config(Vec::new())
        .and_then(|mut progress| progress.wait_for_completion(None));
    if let Err(e) = outcome {
        tracing::warn!(machine = %machine.name(), error = %e, "Failed to clean up unregistered machine");
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::fixture;
    use super::*;
    use crate::hypervisor::{
        AccessMode, CompletedProgress, DeviceType, Hypervisor, MachineId, MachineProperty,
        MachineState, Medium, MemoryHypervisor, OsKind, Progress, PropertyKey, Session,
        SessionState,
    };
    use crate::options::HandlerOptions;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Memory hypervisor that can refuse registration and report failed
    /// config deletion.
    #[derive(Default)]
    struct Flaky {
        inner: MemoryHypervisor,
        refuse_register: AtomicBool,
        fail_delete: AtomicBool,
    }

    /// Deletes like the wrapped machine but reports the deletion as failed,
    /// as VBoxManage does when a disk cannot be removed.
    struct FailingDelete(Arc<dyn Machine>);

    impl Machine for FailingDelete {
        fn id(&self) -> MachineId {
            self.0.id()
        }

        fn name(&self) -> &str {
            self.0.name()
        }

        fn property(&self, key: PropertyKey) -> HvctlResult<MachineProperty> {
            self.0.property(key)
        }

        fn state(&self) -> HvctlResult<MachineState> {
            self.0.state()
        }

        fn session_state(&self) -> HvctlResult<SessionState> {
            self.0.session_state()
        }

        fn save_settings(&self) -> HvctlResult<()> {
            self.0.save_settings()
        }

        fn unregister(&self, cleanup: CleanupMode) -> HvctlResult<Vec<Arc<dyn Medium>>> {
            self.0.unregister(cleanup)
        }

        fn delete_config(&self, media: Vec<Arc<dyn Medium>>) -> HvctlResult<Box<dyn Progress>> {
            self.0.delete_config(media)?.wait_for_completion(None)?;
            Ok(Box::new(CompletedProgress::failed("delete config", "disk busy")))
        }
    }

    impl Hypervisor for Flaky {
        fn machines(&self) -> HvctlResult<Vec<Arc<dyn Machine>>> {
            let machines = self.inner.machines()?;
            if !self.fail_delete.load(Ordering::SeqCst) {
                return Ok(machines);
            }
            Ok(machines
                .into_iter()
                .map(|m| Arc::new(FailingDelete(m)) as Arc<dyn Machine>)
                .collect())
        }

        fn create_machine(
            &self,
            settings_file: &Path,
            name: &str,
            os: OsKind,
        ) -> HvctlResult<Arc<dyn Machine>> {
            self.inner.create_machine(settings_file, name, os)
        }

        fn register_machine(&self, machine: &dyn Machine) -> HvctlResult<()> {
            if self.refuse_register.swap(false, Ordering::SeqCst) {
                return Err(HvctlError::Hypervisor("registration refused".into()));
            }
            self.inner.register_machine(machine)
        }

        fn create_session(&self) -> HvctlResult<Box<dyn Session>> {
            self.inner.create_session()
        }

        fn find_medium(
            &self,
            location: &Path,
            device: DeviceType,
        ) -> HvctlResult<Option<Arc<dyn Medium>>> {
            self.inner.find_medium(location, device)
        }

        fn create_medium(
            &self,
            format: &str,
            location: &Path,
            access: AccessMode,
            device: DeviceType,
        ) -> HvctlResult<Arc<dyn Medium>> {
            self.inner.create_medium(format, location, access, device)
        }

        fn open_medium(
            &self,
            location: &Path,
            device: DeviceType,
            access: AccessMode,
        ) -> HvctlResult<Arc<dyn Medium>> {
            self.inner.open_medium(location, device, access)
        }
    }

    fn flaky_handler() -> (MachineHandler, Arc<Flaky>, TempDir) {
        let home = tempfile::tempdir().unwrap();
        let flaky = Arc::new(Flaky::default());
        let hypervisor: Arc<dyn Hypervisor> = flaky.clone();
        let handler =
            MachineHandler::new(hypervisor, HandlerOptions::with_settings_dir(home.path())).unwrap();
        (handler, flaky, home)
    }

    #[test]
    fn test_create_is_listed() {
        let f = fixture();
        f.handler.create_machine("t1", "Linux").unwrap();

        let machines = f.handler.list_machines().unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].name, "t1");

        // Registered with the hypervisor, not just the handler.
        let registered = f.hypervisor.machines().unwrap();
        assert_eq!(registered[0].id(), machines[0].id);
    }

    #[test]
    fn test_create_rejects_unlisted_kind() {
        let f = fixture();
        let err = f.handler.create_machine("t1", "Windows10_64").unwrap_err();
        assert!(matches!(err, HvctlError::InvalidArgument(_)));
        assert!(f.hypervisor.machines().unwrap().is_empty());
    }

    #[test]
    fn test_create_rejects_path_like_names() {
        let f = fixture();
        let err = f.handler.create_machine("../escape", "Linux").unwrap_err();
        assert!(matches!(err, HvctlError::InvalidArgument(_)));
    }

    #[test]
    fn test_duplicate_create_leaves_entry_untouched() {
        let f = fixture();
        f.handler.create_machine("t1", "Linux").unwrap();
        let before = f.handler.list_machines().unwrap();

        let err = f.handler.create_machine("t1", "MacOS").unwrap_err();
        assert!(matches!(err, HvctlError::AlreadyExists(_)));
        assert_eq!(f.handler.list_machines().unwrap(), before);
        assert_eq!(f.hypervisor.machines().unwrap().len(), 1);
    }

    #[test]
    fn test_start_and_stop() {
        let f = fixture();
        f.handler.create_machine("t1", "Linux").unwrap();

        f.handler.start_machine("t1", LaunchMode::Headless).unwrap();
        assert_eq!(f.handler.machine_state("t1").unwrap(), MachineState::Running);

        // Starting twice is a hypervisor fault.
        let err = f
            .handler
            .start_machine("t1", LaunchMode::Headless)
            .unwrap_err();
        assert!(err.is_hypervisor_fault());

        f.handler.stop_machine("t1").unwrap();
        assert_eq!(f.handler.machine_state("t1").unwrap(), MachineState::PoweredOff);

        let machines = f.hypervisor.machines().unwrap();
        let machine = &machines[0];
        assert_eq!(machine.session_state().unwrap(), SessionState::Unlocked);
    }

    #[test]
    fn test_stop_powered_off_machine_fails() {
        let f = fixture();
        f.handler.create_machine("t1", "Linux").unwrap();
        let err = f.handler.stop_machine("t1").unwrap_err();
        assert!(err.is_hypervisor_fault());

        let machines = f.hypervisor.machines().unwrap();
        let machine = &machines[0];
        assert_eq!(machine.session_state().unwrap(), SessionState::Unlocked);
    }

    #[test]
    fn test_remove() {
        let f = fixture();
        f.handler.create_machine("t1", "Linux").unwrap();
        f.handler.remove_machine("t1").unwrap();

        assert!(f.handler.list_machines().unwrap().is_empty());
        assert!(f.hypervisor.machines().unwrap().is_empty());

        // The name is free again.
        f.handler.create_machine("t1", "Linux").unwrap();
    }

    #[test]
    fn test_remove_running_machine_fails() {
        let f = fixture();
        f.handler.create_machine("t1", "Linux").unwrap();
        f.handler.start_machine("t1", LaunchMode::Headless).unwrap();

        assert!(f.handler.remove_machine("t1").unwrap_err().is_hypervisor_fault());
        assert_eq!(f.handler.list_machines().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_machine_has_no_side_effects() {
        let f = fixture();
        f.hypervisor.seed_machine("other", OsKind::Linux);

        assert!(
            f.handler
                .start_machine("ghost", LaunchMode::Headless)
                .unwrap_err()
                .is_not_found()
        );
        assert!(f.handler.stop_machine("ghost").unwrap_err().is_not_found());
        assert!(f.handler.remove_machine("ghost").unwrap_err().is_not_found());

        let machines = f.hypervisor.machines().unwrap();
        let other = &machines[0];
        assert_eq!(other.state().unwrap(), MachineState::PoweredOff);
        assert_eq!(other.session_state().unwrap(), SessionState::Unlocked);
    }

    #[test]
    fn test_failed_register_leaves_nothing_behind() {
        let (handler, flaky, _home) = flaky_handler();
        flaky.refuse_register.store(true, Ordering::SeqCst);

        let err = handler.create_machine("t1", "Linux").unwrap_err();
        assert!(err.is_hypervisor_fault());
        assert!(handler.list_machines().unwrap().is_empty());

        // The half-created machine was deleted, so the same settings file is free.
        handler.create_machine("t1", "Linux").unwrap();
        assert_eq!(flaky.inner.machines().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_config_delete_still_frees_name() {
        let (handler, flaky, _home) = flaky_handler();
        handler.create_machine("t1", "Linux").unwrap();
        flaky.fail_delete.store(true, Ordering::SeqCst);
        handler.reload().unwrap();

        let err = handler.remove_machine("t1").unwrap_err();
        assert!(err.is_hypervisor_fault());
        assert!(err.to_string().contains("disk busy"));

        assert!(flaky.inner.machines().unwrap().is_empty());
        assert!(handler.list_machines().unwrap().is_empty());
        assert!(handler.remove_machine("t1").unwrap_err().is_not_found());

        flaky.fail_delete.store(false, Ordering::SeqCst);
        handler.create_machine("t1", "Linux").unwrap();
        assert_eq!(handler.list_machines().unwrap()[0].name, "t1");
    }
}
