//! Sessions, session-scoped machines and consoles of the memory backend.

use hvctl_shared::{HvctlError, HvctlResult};

use super::{Attachment, MachineSettings, SharedState, StorageController};
use crate::hypervisor::progress::CompletedProgress;
use crate::hypervisor::{
    Console, DeviceType, LaunchMode, LockType, MachineId, MachineProperty, MachineState, Medium,
    MutableMachine, Progress, Session, SessionState, StorageBus,
};

pub(super) struct MemorySession {
    id: u64,
    state: SharedState,
    locked: Option<MachineId>,
    machine: Option<MemoryMutableMachine>,
    console: Option<MemoryConsole>,
}

impl MemorySession {
    pub(super) fn new(id: u64, state: SharedState) -> Self {
        Self {
            id,
            state,
            locked: None,
            machine: None,
            console: None,
        }
    }

    fn locked_machine(&self) -> HvctlResult<MachineId> {
        self.locked
            .ok_or_else(|| HvctlError::InvalidState(format!("session {} is not locked", self.id)))
    }
}

impl Session for MemorySession {
    fn state(&self) -> SessionState {
        if self.locked.is_some() {
            SessionState::Locked
        } else {
            SessionState::Unlocked
        }
    }

    fn lock_machine(&mut self, machine: MachineId, lock: LockType) -> HvctlResult<()> {
        if self.locked.is_some() {
            return Err(HvctlError::Hypervisor(format!(
                "session {} is already locked",
                self.id
            )));
        }

        let mut state = self.state.lock();
        let record = state.registered_machine(machine)?;

        let write_held = record.locks.iter().any(|(_, l)| *l == LockType::Write);
        match lock {
            LockType::Shared if write_held => {
                return Err(HvctlError::Hypervisor(format!(
                    "machine '{}' is locked for writing by another session",
                    record.name
                )));
            }
            LockType::Write if !record.locks.is_empty() || record.state.is_running() => {
                return Err(HvctlError::Hypervisor(format!(
                    "machine '{}' is already locked or running",
                    record.name
                )));
            }
            _ => {}
        }

        state.machine_mut(machine)?.locks.push((self.id, lock));
        self.locked = Some(machine);
        Ok(())
    }

    fn unlock_machine(&mut self) -> HvctlResult<()> {
        let machine = self.locked.take().ok_or_else(|| {
            HvctlError::Hypervisor(format!("session {} is not locked", self.id))
        })?;
        self.machine = None;
        self.console = None;

        let mut state = self.state.lock();
        // The machine may have been deleted by another client meanwhile.
        if let Some(record) = state.machines.get_mut(&machine) {
            record.locks.retain(|(session, _)| *session != self.id);
        }
        Ok(())
    }

    fn launch_vm_process(
        &mut self,
        machine: MachineId,
        mode: LaunchMode,
    ) -> HvctlResult<Box<dyn Progress>> {
        if self.locked.is_some() {
            return Err(HvctlError::Hypervisor(format!(
                "session {} must be unlocked to launch a VM process",
                self.id
            )));
        }

        let mut state = self.state.lock();
        let record = state.registered_machine(machine)?;
        if !record.state.can_launch() {
            return Err(HvctlError::Hypervisor(format!(
                "machine '{}' is already {:?}",
                record.name, record.state
            )));
        }
        if record.locks.iter().any(|(_, l)| *l == LockType::Write) {
            return Err(HvctlError::Hypervisor(format!(
                "machine '{}' is locked for writing by another session",
                record.name
            )));
        }
        let description = format!("launch '{}' ({})", record.name, mode);

        let record = state.machine_mut(machine)?;
        record.state = MachineState::Running;
        record.locks.push((self.id, LockType::Shared));
        self.locked = Some(machine);

        Ok(Box::new(CompletedProgress::succeeded(description)))
    }

    fn machine(&mut self) -> HvctlResult<&mut dyn MutableMachine> {
        let id = self.locked_machine()?;
        if self.machine.is_none() {
            let settings = self.state.lock().machine(id)?.settings.clone();
            self.machine = Some(MemoryMutableMachine {
                id,
                state: SharedState::clone(&self.state),
                settings,
            });
        }
        match self.machine.as_mut() {
            Some(machine) => Ok(machine),
            None => Err(HvctlError::Internal("session machine missing".into())),
        }
    }

    fn console(&mut self) -> HvctlResult<&mut dyn Console> {
        let id = self.locked_machine()?;
        {
            let state = self.state.lock();
            let record = state.machine(id)?;
            if !record.state.is_running() {
                return Err(HvctlError::Hypervisor(format!(
                    "machine '{}' is not running",
                    record.name
                )));
            }
        }
        let console = self.console.get_or_insert_with(|| MemoryConsole {
            id,
            state: SharedState::clone(&self.state),
        });
        Ok(console)
    }
}

/// Working copy of a locked machine's settings.
struct MemoryMutableMachine {
    id: MachineId,
    state: SharedState,
    settings: MachineSettings,
}

impl MutableMachine for MemoryMutableMachine {
    fn set_property(&mut self, property: MachineProperty) -> HvctlResult<()> {
        property.validate()?;
        match property {
            MachineProperty::CpuCount(n) => self.settings.cpu_count = n,
            MachineProperty::MemorySize(n) => self.settings.memory_mib = n,
            MachineProperty::VramSize(n) => self.settings.vram_mib = n,
            MachineProperty::Description(s) => self.settings.description = s,
        }
        Ok(())
    }

    fn add_storage_controller(&mut self, name: &str, bus: StorageBus) -> HvctlResult<()> {
        if self.settings.controllers.iter().any(|c| c.name == name) {
            return Err(HvctlError::Hypervisor(format!(
                "storage controller named '{}' already exists",
                name
            )));
        }
        self.settings.controllers.push(StorageController {
            name: name.to_string(),
            bus,
        });
        Ok(())
    }

    fn attach_device(
        &mut self,
        controller: &str,
        port: u32,
        device_slot: u32,
        device: DeviceType,
        medium: Option<&dyn Medium>,
    ) -> HvctlResult<()> {
        let bus = self
            .settings
            .controllers
            .iter()
            .find(|c| c.name == controller)
            .map(|c| c.bus)
            .ok_or_else(|| {
                HvctlError::Hypervisor(format!("no storage controller named '{}'", controller))
            })?;

        if port >= bus.max_ports() || device_slot > 1 {
            return Err(HvctlError::Hypervisor(format!(
                "invalid address {}:{}:{} for {} controller",
                controller, port, device_slot, bus
            )));
        }
        if self
            .settings
            .attachments
            .iter()
            .any(|a| a.controller == controller && a.port == port && a.slot == device_slot)
        {
            return Err(HvctlError::Hypervisor(format!(
                "port {} device {} of controller '{}' is already in use",
                port, device_slot, controller
            )));
        }

        let medium_id = match medium {
            Some(medium) => {
                let state = self.state.lock();
                let record = state.media.get(&medium.id()).ok_or_else(|| {
                    HvctlError::Hypervisor(format!(
                        "medium '{}' is not registered",
                        medium.location().display()
                    ))
                })?;
                if record.device != device {
                    return Err(HvctlError::Hypervisor(format!(
                        "medium '{}' cannot be attached as {:?}",
                        medium.location().display(),
                        device
                    )));
                }
                Some(medium.id())
            }
            None => None,
        };

        self.settings.attachments.push(Attachment {
            controller: controller.to_string(),
            port,
            slot: device_slot,
            device,
            medium: medium_id,
        });
        Ok(())
    }

    fn detach_device(&mut self, controller: &str, port: u32, device_slot: u32) -> HvctlResult<()> {
        let before = self.settings.attachments.len();
        self.settings
            .attachments
            .retain(|a| !(a.controller == controller && a.port == port && a.slot == device_slot));
        if self.settings.attachments.len() == before {
            return Err(HvctlError::Hypervisor(format!(
                "no device attached at {}:{}:{}",
                controller, port, device_slot
            )));
        }
        Ok(())
    }

    fn save_settings(&mut self) -> HvctlResult<()> {
        let mut state = self.state.lock();
        let record = state.machine_mut(self.id)?;
        record.settings = self.settings.clone();
        record.settings_saved = true;
        Ok(())
    }

    fn discard_settings(&mut self) -> HvctlResult<()> {
        let state = self.state.lock();
        self.settings = state.machine(self.id)?.settings.clone();
        Ok(())
    }
}

struct MemoryConsole {
    id: MachineId,
    state: SharedState,
}

impl Console for MemoryConsole {
    fn power_down(&mut self) -> HvctlResult<Box<dyn Progress>> {
        let mut state = self.state.lock();
        let record = state.machine_mut(self.id)?;
        if !record.state.is_running() {
            return Err(HvctlError::Hypervisor(format!(
                "machine '{}' is not running",
                record.name
            )));
        }
        record.state = MachineState::PoweredOff;
        Ok(Box::new(CompletedProgress::succeeded(format!(
            "power down '{}'",
            record.name
        ))))
    }
}

#[cfg(test)]
mod tests {
    use crate::hypervisor::{Hypervisor, MemoryHypervisor, OsKind};

    use super::*;

    #[test]
    fn test_pending_changes_are_invisible_until_saved() {
        let hv = MemoryHypervisor::new();
        let id = hv.seed_machine("a", OsKind::Linux);
        let handle = hv.machines().unwrap().remove(0);

        let mut session = hv.create_session().unwrap();
        session.lock_machine(id, LockType::Shared).unwrap();
        session
            .machine()
            .unwrap()
            .set_property(MachineProperty::CpuCount(4))
            .unwrap();
        assert_eq!(
            handle.property(crate::hypervisor::PropertyKey::CpuCount).unwrap(),
            MachineProperty::CpuCount(1)
        );

        session.machine().unwrap().save_settings().unwrap();
        assert_eq!(
            handle.property(crate::hypervisor::PropertyKey::CpuCount).unwrap(),
            MachineProperty::CpuCount(4)
        );
        session.unlock_machine().unwrap();
    }

    #[test]
    fn test_unlock_drops_unsaved_changes() {
        let hv = MemoryHypervisor::new();
        let id = hv.seed_machine("a", OsKind::Linux);

        let mut session = hv.create_session().unwrap();
        session.lock_machine(id, LockType::Shared).unwrap();
        session
            .machine()
            .unwrap()
            .add_storage_controller("SATA", StorageBus::Sata)
            .unwrap();
        session.unlock_machine().unwrap();

        session.lock_machine(id, LockType::Shared).unwrap();
        // Re-adding succeeds because the first controller was never saved.
        session
            .machine()
            .unwrap()
            .add_storage_controller("SATA", StorageBus::Sata)
            .unwrap();
        session.unlock_machine().unwrap();
    }

    #[test]
    fn test_machine_requires_lock() {
        let hv = MemoryHypervisor::new();
        hv.seed_machine("a", OsKind::Linux);
        let mut session = hv.create_session().unwrap();
        assert!(matches!(
            session.machine().err(),
            Some(HvctlError::InvalidState(_))
        ));
    }

    #[test]
    fn test_console_requires_running_machine() {
        let hv = MemoryHypervisor::new();
        let id = hv.seed_machine("a", OsKind::Linux);

        let mut session = hv.create_session().unwrap();
        session.lock_machine(id, LockType::Shared).unwrap();
        assert!(session.console().err().unwrap().is_hypervisor_fault());
        session.unlock_machine().unwrap();

        session
            .launch_vm_process(id, LaunchMode::Headless)
            .unwrap()
            .wait_for_completion(None)
            .unwrap();
        session
            .console()
            .unwrap()
            .power_down()
            .unwrap()
            .wait_for_completion(None)
            .unwrap();
        session.unlock_machine().unwrap();
    }

    #[test]
    fn test_launch_twice_fails() {
        let hv = MemoryHypervisor::new();
        let id = hv.seed_machine("a", OsKind::Linux);

        let mut first = hv.create_session().unwrap();
        first.launch_vm_process(id, LaunchMode::Headless).unwrap();
        first.unlock_machine().unwrap();

        let mut second = hv.create_session().unwrap();
        let err = second.launch_vm_process(id, LaunchMode::Gui).err().unwrap();
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_attach_rejects_occupied_port() {
        let hv = MemoryHypervisor::new();
        let id = hv.seed_machine("a", OsKind::Linux);
        let dvd = hv
            .open_medium(
                std::path::Path::new("/isos/boot.iso"),
                DeviceType::Dvd,
                crate::hypervisor::AccessMode::ReadOnly,
            )
            .unwrap();

        let mut session = hv.create_session().unwrap();
        session.lock_machine(id, LockType::Shared).unwrap();
        let m = session.machine().unwrap();
        m.add_storage_controller("IDE", StorageBus::Ide).unwrap();
        m.attach_device("IDE", 0, 0, DeviceType::Dvd, Some(dvd.as_ref()))
            .unwrap();
        assert!(
            m.attach_device("IDE", 0, 0, DeviceType::Dvd, Some(dvd.as_ref()))
                .is_err()
        );
        assert!(m.attach_device("IDE", 2, 0, DeviceType::Dvd, None).is_err());
        assert!(m.detach_device("IDE", 1, 0).is_err());
        m.detach_device("IDE", 0, 0).unwrap();
    }
}
