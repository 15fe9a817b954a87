//! Sessions over `VBoxManage`.
//!
//! `VBoxManage` takes and releases the real session lock inside every command,
//! so the lock held here is logical: it tracks which machine the session is bound
//! to and refuses the calls the hypervisor would refuse on a locked session.

use std::sync::Arc;

use hvctl_shared::{HvctlError, HvctlResult};

use super::command::VBoxManage;
use super::parse;
use crate::hypervisor::{
    Console, DeviceType, LaunchMode, LockType, MachineId, MachineProperty, MachineState, Medium,
    MutableMachine, Progress, Session, SessionState, StorageBus,
};

pub(super) struct VBoxManageSession {
    vbox: Arc<VBoxManage>,
    bound: Option<Bound>,
}

struct Bound {
    machine: VBoxManageMutableMachine,
    console: VBoxManageConsole,
}

impl VBoxManageSession {
    pub(super) fn new(vbox: Arc<VBoxManage>) -> Self {
        Self { vbox, bound: None }
    }

    fn machine_state(&self, id: MachineId) -> HvctlResult<MachineState> {
        let id = id.to_string();
        let output = self
            .vbox
            .run(["showvminfo", id.as_str(), "--machinereadable"])?;
        let info = parse::parse_machine_readable(&output);
        Ok(info
            .get("VMState")
            .map(|s| parse::machine_state(s))
            .unwrap_or(MachineState::Unknown))
    }

    fn bind(&mut self, id: MachineId) {
        self.bound = Some(Bound {
            machine: VBoxManageMutableMachine {
                id,
                vbox: Arc::clone(&self.vbox),
                applied: 0,
            },
            console: VBoxManageConsole {
                id,
                vbox: Arc::clone(&self.vbox),
            },
        });
    }

    fn bound(&mut self) -> HvctlResult<&mut Bound> {
        self.bound
            .as_mut()
            .ok_or_else(|| HvctlError::InvalidState("session is not locked to a machine".into()))
    }
}

impl Session for VBoxManageSession {
    fn state(&self) -> SessionState {
        if self.bound.is_some() {
            SessionState::Locked
        } else {
            SessionState::Unlocked
        }
    }

    fn lock_machine(&mut self, machine: MachineId, lock: LockType) -> HvctlResult<()> {
        if self.bound.is_some() {
            return Err(HvctlError::Hypervisor("session is already locked".into()));
        }
        let state = self.machine_state(machine)?;
        if lock == LockType::Write && state.is_running() {
            return Err(HvctlError::Hypervisor(format!(
                "machine {} is running and cannot be write-locked",
                machine
            )));
        }
        self.bind(machine);
        Ok(())
    }

    fn unlock_machine(&mut self) -> HvctlResult<()> {
        match self.bound.take() {
            Some(_) => Ok(()),
            None => Err(HvctlError::Hypervisor("session is not locked".into())),
        }
    }

    fn launch_vm_process(
        &mut self,
        machine: MachineId,
        mode: LaunchMode,
    ) -> HvctlResult<Box<dyn Progress>> {
        if self.bound.is_some() {
            return Err(HvctlError::Hypervisor(
                "cannot launch a VM process from a locked session".into(),
            ));
        }
        let id = machine.to_string();
        let progress = self.vbox.spawn(
            &format!("launch {}", id),
            ["startvm", id.as_str(), "--type", mode.as_str()],
        )?;
        self.bind(machine);
        Ok(progress)
    }

    fn machine(&mut self) -> HvctlResult<&mut dyn MutableMachine> {
        Ok(&mut self.bound()?.machine)
    }

    fn console(&mut self) -> HvctlResult<&mut dyn Console> {
        let id = self.bound()?.console.id;
        let state = self.machine_state(id)?;
        if !state.is_running() {
            return Err(HvctlError::Hypervisor(format!(
                "machine {} is not running",
                id
            )));
        }
        Ok(&mut self.bound()?.console)
    }
}

/// Applies each change with its own `VBoxManage` command.
struct VBoxManageMutableMachine {
    id: MachineId,
    vbox: Arc<VBoxManage>,
    /// Commands already applied; `VBoxManage` cannot roll them back.
    applied: usize,
}

impl VBoxManageMutableMachine {
    fn apply(&mut self, args: &[&str]) -> HvctlResult<()> {
        self.vbox.run(args)?;
        self.applied += 1;
        Ok(())
    }
}

impl MutableMachine for VBoxManageMutableMachine {
    fn set_property(&mut self, property: MachineProperty) -> HvctlResult<()> {
        property.validate()?;
        let id = self.id.to_string();
        let (flag, value) = match &property {
            MachineProperty::CpuCount(n) => ("--cpus", n.to_string()),
            MachineProperty::MemorySize(n) => ("--memory", n.to_string()),
            MachineProperty::VramSize(n) => ("--vram", n.to_string()),
            MachineProperty::Description(s) => ("--description", s.clone()),
        };
        self.apply(&["modifyvm", id.as_str(), flag, value.as_str()])
    }

    fn add_storage_controller(&mut self, name: &str, bus: StorageBus) -> HvctlResult<()> {
        let id = self.id.to_string();
        self.apply(&[
            "storagectl",
            id.as_str(),
            "--name",
            name,
            "--add",
            bus.as_str(),
        ])
    }

    fn attach_device(
        &mut self,
        controller: &str,
        port: u32,
        device_slot: u32,
        device: DeviceType,
        medium: Option<&dyn Medium>,
    ) -> HvctlResult<()> {
        let location = match medium {
            Some(medium) => medium.location().to_string_lossy().into_owned(),
            None if device == DeviceType::HardDisk => {
                return Err(HvctlError::Hypervisor(
                    "a hard disk attachment requires a medium".into(),
                ));
            }
            None => "emptydrive".to_string(),
        };
        let id = self.id.to_string();
        let port = port.to_string();
        let slot = device_slot.to_string();
        self.apply(&[
            "storageattach",
            id.as_str(),
            "--storagectl",
            controller,
            "--port",
            port.as_str(),
            "--device",
            slot.as_str(),
            "--type",
            device.as_str(),
            "--medium",
            location.as_str(),
        ])
    }

    fn detach_device(&mut self, controller: &str, port: u32, device_slot: u32) -> HvctlResult<()> {
        let id = self.id.to_string();
        let port = port.to_string();
        let slot = device_slot.to_string();
        self.apply(&[
            "storageattach",
            id.as_str(),
            "--storagectl",
            controller,
            "--port",
            port.as_str(),
            "--device",
            slot.as_str(),
            "--medium",
            "none",
        ])
    }

    fn save_settings(&mut self) -> HvctlResult<()> {
        tracing::trace!(machine = %self.id, applied = self.applied, "Changes already saved");
        self.applied = 0;
        Ok(())
    }

    fn discard_settings(&mut self) -> HvctlResult<()> {
        if self.applied > 0 {
            return Err(HvctlError::Unsupported(format!(
                "{} change(s) to machine {} were already applied and cannot be discarded",
                self.applied, self.id
            )));
        }
        Ok(())
    }
}

struct VBoxManageConsole {
    id: MachineId,
    vbox: Arc<VBoxManage>,
}

impl Console for VBoxManageConsole {
    fn power_down(&mut self) -> HvctlResult<Box<dyn Progress>> {
        let id = self.id.to_string();
        self.vbox.spawn(
            &format!("power down {}", id),
            ["controlvm", id.as_str(), "poweroff"],
        )
    }
}
